//! Resumable, serialized enumeration of one record kind.
//!
//! A [`ScanSession`] owns the scan state of a kind: the open connection and
//! statement, and the pending record left behind when a caller's buffer was
//! too small. All of it sits behind a reentrant lock (the gate), so the same
//! thread may re-enter (`next` lazily starting the scan, or a host calling
//! back into the resolver) without deadlocking itself.
//!
//! State machine:
//!
//! ```text
//!            start                    row packed
//!  Closed ──────────▶ OpenIdle ◀──────────────────┐
//!    ▲                  │  │ row too big          │ pending packed
//!    │ end / exhausted  │  └────────────▶ OpenPending
//!    │ / backend error  │                  │  ▲
//!    └──────────────────┴──────────────────┘  └─ still too big
//! ```

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;

use parking_lot::ReentrantMutex;
use tracing::{debug, warn};

use crate::kind::RecordKind;
use crate::pack::Pack;
use crate::status::ResolveError;
use crate::traits::{RowStream, Store, StoreConnection};

/// Observable phase of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorState {
    /// No connection held.
    #[default]
    Closed,
    /// Connection live, nothing pending.
    OpenIdle,
    /// Connection live, one fetched record awaiting a big enough buffer.
    OpenPending,
}

/// Connection and running enumeration statement.
///
/// Field order matters: the stream is finalized before the connection closes.
struct OpenScan {
    stream: Box<dyn RowStream>,
    conn: Box<dyn StoreConnection>,
}

/// Mutable scan state. Only reachable through the gate.
struct ScanState<R> {
    open: Option<OpenScan>,
    pending: Option<R>,
}

impl<R> ScanState<R> {
    fn phase(&self) -> CursorState {
        match (&self.open, &self.pending) {
            (None, _) => CursorState::Closed,
            (Some(_), None) => CursorState::OpenIdle,
            (Some(_), Some(_)) => CursorState::OpenPending,
        }
    }

    fn close(&mut self) {
        self.pending = None;
        self.open = None;
    }
}

struct Slot<R> {
    state: RefCell<ScanState<R>>,
    phase: Cell<CursorState>,
}

/// Scan cursor for record kind `K`, guarded by its own reentrant gate.
///
/// Sessions of different kinds share nothing and never block each other.
pub struct ScanSession<K: RecordKind> {
    gate: ReentrantMutex<Slot<K::Record>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: RecordKind> ScanSession<K> {
    /// Creates a closed session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gate: ReentrantMutex::new(Slot {
                state: RefCell::new(ScanState {
                    open: None,
                    pending: None,
                }),
                phase: Cell::new(CursorState::Closed),
            }),
            _kind: PhantomData,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> CursorState {
        self.gate.lock().phase.get()
    }

    /// Whether a record is waiting for a larger buffer.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.state() == CursorState::OpenPending
    }

    /// Opens the enumeration. An already open scan is rewound: its pending
    /// record is dropped and the next row is the first one again.
    ///
    /// # Errors
    ///
    /// [`ResolveError::BackendUnavailable`] if the store cannot be opened or
    /// the query prepared, [`ResolveError::TemporarilyUnavailable`] if the
    /// store is busy. The session stays closed in both cases.
    pub fn start(&self, store: &dyn Store) -> Result<(), ResolveError> {
        self.with_state(|state| {
            if state.open.is_some() {
                debug!(kind = %K::KIND, "rewinding scan");
                state.close();
            }
            open_scan::<K, _>(store, state)
        })
    }

    /// Delivers the next record into `buf`.
    ///
    /// A closed session is started first. A record that did not fit on the
    /// previous call is delivered before any new row is fetched.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::InsufficientSpace`]: `buf` is too small; the record
    ///   is kept and the next call returns it again.
    /// - [`ResolveError::EndOfSequence`]: every row has been delivered; the
    ///   session is closed.
    /// - [`ResolveError::BackendUnavailable`] /
    ///   [`ResolveError::TemporarilyUnavailable`]: the store failed; the
    ///   session is closed.
    pub fn next<'b>(
        &self,
        store: &dyn Store,
        buf: &'b mut [u8],
    ) -> Result<<K::Record as Pack>::View<'b>, ResolveError> {
        self.with_state(move |state| {
            if state.open.is_none() {
                debug!(kind = %K::KIND, "scan not open, starting it");
                open_scan::<K, _>(store, state)?;
            }

            if let Some(record) = state.pending.take() {
                return match record.pack(buf) {
                    Ok(view) => {
                        debug!(kind = %K::KIND, "delivered pending record");
                        Ok(view)
                    }
                    Err(e) => {
                        debug!(
                            kind = %K::KIND,
                            required = e.required,
                            capacity = e.capacity,
                            "pending record still does not fit"
                        );
                        state.pending = Some(record);
                        Err(e.into())
                    }
                };
            }

            let Some(open) = state.open.as_mut() else {
                return Err(ResolveError::BackendUnavailable("scan not open".to_string()));
            };

            let row = match open.stream.step() {
                Ok(Some(row)) => row,
                Ok(None) => {
                    debug!(kind = %K::KIND, "scan exhausted, closing");
                    state.close();
                    return Err(ResolveError::EndOfSequence);
                }
                Err(e) => {
                    warn!(kind = %K::KIND, error = %e, "scan step failed, closing");
                    state.close();
                    return Err(e.into());
                }
            };

            let record = match K::decode(&row, open.conn.as_mut()) {
                Ok(record) => record,
                Err(e) => {
                    warn!(kind = %K::KIND, error = %e, "could not decode scanned row, closing");
                    state.close();
                    return Err(e.into());
                }
            };

            match record.pack(buf) {
                Ok(view) => Ok(view),
                Err(e) => {
                    debug!(
                        kind = %K::KIND,
                        required = e.required,
                        capacity = e.capacity,
                        "record does not fit, keeping it pending"
                    );
                    state.pending = Some(record);
                    Err(e.into())
                }
            }
        })
    }

    /// Closes the scan and drops any pending record. Idempotent.
    ///
    /// # Errors
    ///
    /// [`ResolveError::TemporarilyUnavailable`] when called re-entrantly from
    /// inside a step of this same session.
    pub fn end(&self) -> Result<(), ResolveError> {
        self.with_state(|state| {
            if state.open.is_some() {
                debug!(kind = %K::KIND, "ending scan");
            }
            state.close();
            Ok(())
        })
    }

    /// Runs `f` with exclusive access to the scan state.
    ///
    /// The gate is reentrant, but the state itself is not: a same-thread call
    /// that arrives while another call on this session is mid-step gets
    /// [`ResolveError::TemporarilyUnavailable`] instead of a second `&mut`.
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut ScanState<K::Record>) -> Result<T, ResolveError>,
    ) -> Result<T, ResolveError> {
        let slot = self.gate.lock();
        let Ok(mut state) = slot.state.try_borrow_mut() else {
            warn!(kind = %K::KIND, "re-entrant scan call during a step");
            return Err(ResolveError::TemporarilyUnavailable);
        };
        let result = f(&mut *state);
        slot.phase.set(state.phase());
        result
    }
}

impl<K: RecordKind> Default for ScanSession<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens a connection and prepares the kind's enumeration query.
///
/// Takes the state by `&mut`, which only exists while the gate is held and
/// the state borrowed, so both `start` and the lazy start inside `next` run
/// under the caller's single acquisition.
fn open_scan<K: RecordKind, R>(
    store: &dyn Store,
    state: &mut ScanState<R>,
) -> Result<(), ResolveError> {
    let mut conn = store.open().map_err(|e| {
        warn!(kind = %K::KIND, error = %e, "unable to open store for scan");
        ResolveError::from(e)
    })?;
    let sql = conn.query_text(K::SCAN)?;
    let stream = conn.prepare(&sql, &[]).map_err(|e| {
        warn!(kind = %K::KIND, error = %e, "unable to prepare scan query");
        ResolveError::from(e)
    })?;
    debug!(kind = %K::KIND, "scan opened");
    state.open = Some(OpenScan { stream, conn });
    state.pending = None;
    Ok(())
}
