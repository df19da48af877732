//! Per-kind row decoding.
//!
//! The cursor and lookup code is written once, generic over [`RecordKind`].
//! What differs between accounts, groups and shadow entries is confined to
//! the query ops used and how a row becomes a record.
//!
//! Expected column order:
//!
//! | kind    | columns                                                           |
//! |---------|-------------------------------------------------------------------|
//! | account | name, passwd, uid, gid, gecos, dir, shell                         |
//! | group   | name, passwd, gid                                                 |
//! | members | name                                                              |
//! | shadow  | name, passwd, [last_change, min, max, warn, inactive, expire]     |

use tracing::debug;

use crate::pack::Pack;
use crate::traits::{Param, QueryOp, Row, StoreConnection, StoreError};
use crate::types::{Account, Group, Kind, ShadowCredential, UNSET};

/// A record kind served by the resolver.
pub trait RecordKind: Send + Sync + 'static {
    type Record: Pack + Clone + std::fmt::Debug + Send;

    const KIND: Kind;

    /// Enumeration query.
    const SCAN: QueryOp;

    /// Builds a record from a row. `conn` is the connection the row came from
    /// and is used for secondary queries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] for rows that do not fit the record.
    fn decode(row: &Row, conn: &mut dyn StoreConnection) -> Result<Self::Record, StoreError>;
}

/// `passwd` entries.
#[derive(Debug)]
pub struct Accounts;

/// `group` entries.
#[derive(Debug)]
pub struct Groups;

/// `shadow` entries.
#[derive(Debug)]
pub struct Shadows;

impl RecordKind for Accounts {
    type Record = Account;
    const KIND: Kind = Kind::Account;
    const SCAN: QueryOp = QueryOp::AccountScan;

    fn decode(row: &Row, _conn: &mut dyn StoreConnection) -> Result<Account, StoreError> {
        Ok(Account {
            name: row.column_text(0)?.into_owned(),
            passwd: row.column_text(1)?.into_owned(),
            uid: row.column_id(2)?,
            gid: row.column_id(3)?,
            gecos: row.column_text(4)?.into_owned(),
            dir: row.column_text(5)?.into_owned(),
            shell: row.column_text(6)?.into_owned(),
        })
    }
}

impl RecordKind for Groups {
    type Record = Group;
    const KIND: Kind = Kind::Group;
    const SCAN: QueryOp = QueryOp::GroupScan;

    fn decode(row: &Row, conn: &mut dyn StoreConnection) -> Result<Group, StoreError> {
        let name = row.column_text(0)?.into_owned();
        let passwd = row.column_text(1)?.into_owned();
        let gid = row.column_id(2)?;
        let members = group_members(conn, gid)?;
        Ok(Group {
            name,
            passwd,
            gid,
            members,
        })
    }
}

impl RecordKind for Shadows {
    type Record = ShadowCredential;
    const KIND: Kind = Kind::Shadow;
    const SCAN: QueryOp = QueryOp::ShadowScan;

    fn decode(row: &Row, _conn: &mut dyn StoreConnection) -> Result<ShadowCredential, StoreError> {
        let aging = |index: usize| -> Result<i64, StoreError> {
            Ok(row.column_opt_int(index)?.unwrap_or(UNSET))
        };
        Ok(ShadowCredential {
            name: row.column_text(0)?.into_owned(),
            passwd: row.column_text(1)?.into_owned(),
            last_change: aging(2)?,
            min_age: aging(3)?,
            max_age: aging(4)?,
            warn_period: aging(5)?,
            inactivity: aging(6)?,
            expire: aging(7)?,
        })
    }
}

/// Drains the member query for `gid`.
///
/// The whole result set is collected before anything is packed, since the
/// pointer table size depends on the count. Any failure of the secondary
/// query is reported as [`StoreError::Malformed`] so the group is never
/// delivered with a partial member list.
///
/// # Errors
///
/// Returns [`StoreError::Malformed`] if the member query fails at any point.
pub fn group_members(
    conn: &mut dyn StoreConnection,
    gid: u32,
) -> Result<Vec<String>, StoreError> {
    let wrap = |e: StoreError| StoreError::Malformed(format!("members of group {gid}: {e}"));

    let sql = conn.query_text(QueryOp::GroupMembers).map_err(wrap)?;
    let mut stream = conn
        .prepare(&sql, &[Param::Int(i64::from(gid))])
        .map_err(wrap)?;

    let mut members = Vec::new();
    while let Some(row) = stream.step().map_err(wrap)? {
        members.push(row.column_text(0).map_err(wrap)?.into_owned());
    }
    debug!(gid, count = members.len(), "resolved group members");
    Ok(members)
}
