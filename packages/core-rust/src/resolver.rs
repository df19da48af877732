//! Caller-facing operations: point lookups, scans and group lists.
//!
//! A [`Resolver`] owns a store and one [`ScanSession`] per record kind.
//! Lookups open a transient connection, fetch at most one row and release
//! the connection before packing; they share no state and take no lock.

use tracing::debug;

use crate::cursor::ScanSession;
use crate::kind::{Accounts, Groups, RecordKind, Shadows};
use crate::members::GroupView;
use crate::pack::{AccountView, Pack, ShadowView};
use crate::status::ResolveError;
use crate::traits::{Param, QueryOp, Store};

/// Resolver for accounts, groups and shadow entries backed by `S`.
pub struct Resolver<S: Store> {
    store: S,
    accounts: ScanSession<Accounts>,
    groups: ScanSession<Groups>,
    shadows: ScanSession<Shadows>,
}

impl<S: Store> Resolver<S> {
    /// Creates a resolver with every scan closed.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            accounts: ScanSession::new(),
            groups: ScanSession::new(),
            shadows: ScanSession::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn account_session(&self) -> &ScanSession<Accounts> {
        &self.accounts
    }

    #[must_use]
    pub fn group_session(&self) -> &ScanSession<Groups> {
        &self.groups
    }

    #[must_use]
    pub fn shadow_session(&self) -> &ScanSession<Shadows> {
        &self.shadows
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Looks up an account by name.
    ///
    /// # Errors
    ///
    /// [`ResolveError::NotFound`], [`ResolveError::InsufficientSpace`],
    /// [`ResolveError::TemporarilyUnavailable`] or
    /// [`ResolveError::BackendUnavailable`].
    pub fn account_by_name<'b>(
        &self,
        name: &str,
        buf: &'b mut [u8],
    ) -> Result<AccountView<'b>, ResolveError> {
        self.lookup::<Accounts>(QueryOp::AccountByName, Param::Text(name), buf)
    }

    /// Looks up an account by uid.
    ///
    /// # Errors
    ///
    /// Same as [`Resolver::account_by_name`].
    pub fn account_by_uid<'b>(
        &self,
        uid: u32,
        buf: &'b mut [u8],
    ) -> Result<AccountView<'b>, ResolveError> {
        self.lookup::<Accounts>(QueryOp::AccountById, Param::Int(i64::from(uid)), buf)
    }

    /// Looks up a group, with its members, by name.
    ///
    /// # Errors
    ///
    /// Same as [`Resolver::account_by_name`]; a failing member query is
    /// [`ResolveError::BackendUnavailable`].
    pub fn group_by_name<'b>(
        &self,
        name: &str,
        buf: &'b mut [u8],
    ) -> Result<GroupView<'b>, ResolveError> {
        self.lookup::<Groups>(QueryOp::GroupByName, Param::Text(name), buf)
    }

    /// Looks up a group, with its members, by gid.
    ///
    /// # Errors
    ///
    /// Same as [`Resolver::group_by_name`].
    pub fn group_by_gid<'b>(
        &self,
        gid: u32,
        buf: &'b mut [u8],
    ) -> Result<GroupView<'b>, ResolveError> {
        self.lookup::<Groups>(QueryOp::GroupById, Param::Int(i64::from(gid)), buf)
    }

    /// Looks up a shadow entry by user name.
    ///
    /// # Errors
    ///
    /// Same as [`Resolver::account_by_name`].
    pub fn shadow_by_name<'b>(
        &self,
        name: &str,
        buf: &'b mut [u8],
    ) -> Result<ShadowView<'b>, ResolveError> {
        self.lookup::<Shadows>(QueryOp::ShadowByName, Param::Text(name), buf)
    }

    fn lookup<'b, K: RecordKind>(
        &self,
        op: QueryOp,
        key: Param<'_>,
        buf: &'b mut [u8],
    ) -> Result<<K::Record as Pack>::View<'b>, ResolveError> {
        debug!(kind = %K::KIND, op = op.name(), ?key, "lookup");
        let record = {
            let mut conn = self.store.open()?;
            let sql = conn.query_text(op)?;
            let mut stream = conn.prepare(&sql, &[key])?;
            let Some(row) = stream.step()? else {
                debug!(kind = %K::KIND, ?key, "no matching record");
                return Err(ResolveError::NotFound);
            };
            K::decode(&row, conn.as_mut())?
        };
        Ok(record.pack(buf)?)
    }

    // -----------------------------------------------------------------------
    // Scans
    // -----------------------------------------------------------------------

    /// Opens (or rewinds) the account scan.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::start`].
    pub fn start_account_scan(&self) -> Result<(), ResolveError> {
        self.accounts.start(&self.store)
    }

    /// Next account of the scan.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::next`].
    pub fn next_account<'b>(&self, buf: &'b mut [u8]) -> Result<AccountView<'b>, ResolveError> {
        self.accounts.next(&self.store, buf)
    }

    /// Closes the account scan.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::end`].
    pub fn end_account_scan(&self) -> Result<(), ResolveError> {
        self.accounts.end()
    }

    /// Opens (or rewinds) the group scan.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::start`].
    pub fn start_group_scan(&self) -> Result<(), ResolveError> {
        self.groups.start(&self.store)
    }

    /// Next group of the scan, members included.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::next`].
    pub fn next_group<'b>(&self, buf: &'b mut [u8]) -> Result<GroupView<'b>, ResolveError> {
        self.groups.next(&self.store, buf)
    }

    /// Closes the group scan.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::end`].
    pub fn end_group_scan(&self) -> Result<(), ResolveError> {
        self.groups.end()
    }

    /// Opens (or rewinds) the shadow scan.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::start`].
    pub fn start_shadow_scan(&self) -> Result<(), ResolveError> {
        self.shadows.start(&self.store)
    }

    /// Next shadow entry of the scan.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::next`].
    pub fn next_shadow<'b>(&self, buf: &'b mut [u8]) -> Result<ShadowView<'b>, ResolveError> {
        self.shadows.next(&self.store, buf)
    }

    /// Closes the shadow scan.
    ///
    /// # Errors
    ///
    /// See [`ScanSession::end`].
    pub fn end_shadow_scan(&self) -> Result<(), ResolveError> {
        self.shadows.end()
    }

    /// Closes every scan. Used at teardown.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the remaining scans are still closed.
    pub fn end_all_scans(&self) -> Result<(), ResolveError> {
        let accounts = self.accounts.end();
        let groups = self.groups.end();
        let shadows = self.shadows.end();
        accounts.and(groups).and(shadows)
    }

    // -----------------------------------------------------------------------
    // Group lists
    // -----------------------------------------------------------------------

    /// Appends the gids of every group `user` belongs to, except
    /// `primary_gid`, in store order.
    ///
    /// `limit` caps the total length of `groups`. When the cap is hit before
    /// the result set is drained the call fails with
    /// [`ResolveError::InsufficientSpace`]; gids appended so far stay in
    /// `groups` and the caller may retry with a larger limit.
    ///
    /// # Errors
    ///
    /// [`ResolveError::NotFound`] when the user is in no other group, plus the
    /// usual backend failures.
    pub fn supplementary_groups(
        &self,
        user: &str,
        primary_gid: u32,
        groups: &mut Vec<u32>,
        limit: Option<usize>,
    ) -> Result<(), ResolveError> {
        debug!(user, primary_gid, "resolving supplementary groups");
        let mut conn = self.store.open()?;
        let sql = conn.query_text(QueryOp::SupplementaryGroups)?;
        let mut stream = conn.prepare(
            &sql,
            &[Param::Text(user), Param::Int(i64::from(primary_gid))],
        )?;

        let mut found = 0usize;
        while let Some(row) = stream.step()? {
            let gid = row.column_id(0)?;
            if let Some(limit) = limit {
                if groups.len() >= limit {
                    debug!(user, limit, "supplementary group limit reached");
                    return Err(ResolveError::InsufficientSpace {
                        required: groups.len() + 1,
                        capacity: limit,
                    });
                }
            }
            groups.push(gid);
            found += 1;
        }

        if found == 0 {
            return Err(ResolveError::NotFound);
        }
        debug!(user, found, "supplementary groups resolved");
        Ok(())
    }
}
