//! In-memory [`Store`] implementation.
//!
//! Serves accounts, groups and shadow entries from plain vectors. Query text
//! is the operation name itself ([`QueryOp::name`]); `prepare` dispatches on
//! it and snapshots the matching rows. Faults and hooks can be injected per
//! operation, and live connections and streams are counted so tests can
//! check that every exit path releases what it opened.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::traits::{Column, Param, QueryOp, Row, RowStream, Store, StoreConnection, StoreError};
use crate::types::{Account, ShadowCredential};

/// Failure injected into one operation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// `prepare` fails.
    Prepare(StoreError),
    /// `step` fails once `after` rows have been returned.
    Step { after: usize, error: StoreError },
}

/// Callback run before every `step` of an operation.
pub type StepHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
struct GroupRow {
    name: String,
    passwd: String,
    gid: u32,
    members: Vec<String>,
}

#[derive(Default)]
struct Inner {
    accounts: RwLock<Vec<Account>>,
    groups: RwLock<Vec<GroupRow>>,
    shadows: RwLock<Vec<ShadowCredential>>,
    open_fault: Mutex<Option<StoreError>>,
    faults: Mutex<HashMap<QueryOp, Fault>>,
    hooks: Mutex<HashMap<QueryOp, StepHook>>,
    live_connections: AtomicUsize,
    live_streams: AtomicUsize,
    opened: AtomicUsize,
}

/// Scriptable in-memory record store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account: Account) {
        self.inner.accounts.write().push(account);
    }

    pub fn add_group(&self, name: &str, passwd: &str, gid: u32, members: &[&str]) {
        self.inner.groups.write().push(GroupRow {
            name: name.to_string(),
            passwd: passwd.to_string(),
            gid,
            members: members.iter().map(ToString::to_string).collect(),
        });
    }

    pub fn add_shadow(&self, shadow: ShadowCredential) {
        self.inner.shadows.write().push(shadow);
    }

    /// Makes every subsequent `open` fail with `error`; `None` clears it.
    pub fn set_open_fault(&self, error: Option<StoreError>) {
        *self.inner.open_fault.lock() = error;
    }

    /// Makes `prepare` of `op` fail with [`StoreError::Unavailable`].
    pub fn fail_query(&self, op: QueryOp) {
        self.inject(
            op,
            Fault::Prepare(StoreError::Unavailable(format!("{} failed", op.name()))),
        );
    }

    pub fn inject(&self, op: QueryOp, fault: Fault) {
        self.inner.faults.lock().insert(op, fault);
    }

    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
        *self.inner.open_fault.lock() = None;
    }

    pub fn set_step_hook(&self, op: QueryOp, hook: StepHook) {
        self.inner.hooks.lock().insert(op, hook);
    }

    /// Connections currently open.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.inner.live_connections.load(Ordering::SeqCst)
    }

    /// Row streams not yet finalized.
    #[must_use]
    pub fn live_streams(&self) -> usize {
        self.inner.live_streams.load(Ordering::SeqCst)
    }

    /// Connections opened since creation.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    fn rows_for(&self, op: QueryOp, params: &[Param<'_>]) -> Result<Vec<Row>, StoreError> {
        let text = |i: usize| match params.get(i) {
            Some(Param::Text(s)) => Ok(*s),
            _ => Err(StoreError::Unavailable(format!(
                "{}: text parameter {} not bound",
                op.name(),
                i + 1
            ))),
        };
        let int = |i: usize| match params.get(i) {
            Some(Param::Int(v)) => Ok(*v),
            _ => Err(StoreError::Unavailable(format!(
                "{}: integer parameter {} not bound",
                op.name(),
                i + 1
            ))),
        };

        let accounts = self.inner.accounts.read();
        let groups = self.inner.groups.read();
        let shadows = self.inner.shadows.read();

        let rows: Vec<Row> = match op {
            QueryOp::AccountByName => {
                let name = text(0)?;
                accounts.iter().filter(|a| a.name == name).map(account_row).collect()
            }
            QueryOp::AccountById => {
                let uid = int(0)?;
                accounts
                    .iter()
                    .filter(|a| i64::from(a.uid) == uid)
                    .map(account_row)
                    .collect()
            }
            QueryOp::AccountScan => accounts.iter().map(account_row).collect(),
            QueryOp::GroupByName => {
                let name = text(0)?;
                groups.iter().filter(|g| g.name == name).map(group_row).collect()
            }
            QueryOp::GroupById => {
                let gid = int(0)?;
                groups
                    .iter()
                    .filter(|g| i64::from(g.gid) == gid)
                    .map(group_row)
                    .collect()
            }
            QueryOp::GroupScan => groups.iter().map(group_row).collect(),
            QueryOp::GroupMembers => {
                let gid = int(0)?;
                groups
                    .iter()
                    .filter(|g| i64::from(g.gid) == gid)
                    .flat_map(|g| g.members.iter())
                    .map(|m| Row::new(vec![Column::Text(m.clone())]))
                    .collect()
            }
            QueryOp::ShadowByName => {
                let name = text(0)?;
                shadows.iter().filter(|s| s.name == name).map(shadow_row).collect()
            }
            QueryOp::ShadowScan => shadows.iter().map(shadow_row).collect(),
            QueryOp::SupplementaryGroups => {
                let user = text(0)?;
                let skip = int(1)?;
                groups
                    .iter()
                    .filter(|g| i64::from(g.gid) != skip && g.members.iter().any(|m| m == user))
                    .map(|g| Row::new(vec![Column::Int(i64::from(g.gid))]))
                    .collect()
            }
        };
        Ok(rows)
    }
}

fn account_row(a: &Account) -> Row {
    Row::new(vec![
        Column::Text(a.name.clone()),
        Column::Text(a.passwd.clone()),
        Column::Int(i64::from(a.uid)),
        Column::Int(i64::from(a.gid)),
        Column::Text(a.gecos.clone()),
        Column::Text(a.dir.clone()),
        Column::Text(a.shell.clone()),
    ])
}

fn group_row(g: &GroupRow) -> Row {
    Row::new(vec![
        Column::Text(g.name.clone()),
        Column::Text(g.passwd.clone()),
        Column::Int(i64::from(g.gid)),
    ])
}

fn shadow_row(s: &ShadowCredential) -> Row {
    Row::new(vec![
        Column::Text(s.name.clone()),
        Column::Text(s.passwd.clone()),
        Column::Int(s.last_change),
        Column::Int(s.min_age),
        Column::Int(s.max_age),
        Column::Int(s.warn_period),
        Column::Int(s.inactivity),
        Column::Int(s.expire),
    ])
}

impl Store for MemoryStore {
    fn open(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        if let Some(err) = self.inner.open_fault.lock().clone() {
            return Err(err);
        }
        self.inner.live_connections.fetch_add(1, Ordering::SeqCst);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
        }))
    }
}

struct MemoryConnection {
    store: MemoryStore,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.store
            .inner
            .live_connections
            .fetch_sub(1, Ordering::SeqCst);
    }
}

impl StoreConnection for MemoryConnection {
    fn query_text(&mut self, op: QueryOp) -> Result<Cow<'static, str>, StoreError> {
        Ok(Cow::Borrowed(op.name()))
    }

    fn prepare(
        &mut self,
        sql: &str,
        params: &[Param<'_>],
    ) -> Result<Box<dyn RowStream>, StoreError> {
        let op = QueryOp::ALL
            .into_iter()
            .find(|op| op.name() == sql)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown query: {sql}")))?;

        let fault = self.store.inner.faults.lock().get(&op).cloned();
        let step_fault = match fault {
            Some(Fault::Prepare(err)) => return Err(err),
            Some(Fault::Step { after, error }) => Some((after, error)),
            None => None,
        };

        let rows = self.store.rows_for(op, params)?;
        self.store.inner.live_streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStream {
            store: self.store.clone(),
            op,
            rows: rows.into_iter(),
            delivered: 0,
            step_fault,
        }))
    }
}

struct MemoryStream {
    store: MemoryStore,
    op: QueryOp,
    rows: std::vec::IntoIter<Row>,
    delivered: usize,
    step_fault: Option<(usize, StoreError)>,
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.store.inner.live_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RowStream for MemoryStream {
    fn step(&mut self) -> Result<Option<Row>, StoreError> {
        let hook = self.store.inner.hooks.lock().get(&self.op).cloned();
        if let Some(hook) = hook {
            hook();
        }
        if let Some((after, error)) = &self.step_fault {
            if self.delivered >= *after {
                return Err(error.clone());
            }
        }
        let row = self.rows.next();
        if row.is_some() {
            self.delivered += 1;
        }
        Ok(row)
    }
}
