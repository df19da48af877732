//! Store adapter contract.
//!
//! The resolver never talks to a database directly. It opens a
//! [`StoreConnection`] through a [`Store`], asks it for the query text of an
//! operation, prepares that query with positional parameters and steps the
//! resulting [`RowStream`] one row at a time.
//!
//! Release is tied to `Drop`: dropping a stream finalizes it and dropping a
//! connection closes it, so every exit path releases what it opened.

use std::borrow::Cow;

/// Every query the resolver issues.
///
/// [`QueryOp::name`] is the stable key used when query text is stored as
/// configuration rather than compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOp {
    /// Account by name. Param 1: name.
    AccountByName,
    /// Account by uid. Param 1: uid.
    AccountById,
    /// All accounts.
    AccountScan,
    /// Group by name. Param 1: name.
    GroupByName,
    /// Group by gid. Param 1: gid.
    GroupById,
    /// All groups.
    GroupScan,
    /// Member names of a group. Param 1: gid.
    GroupMembers,
    /// Shadow entry by name. Param 1: name.
    ShadowByName,
    /// All shadow entries.
    ShadowScan,
    /// Gids of a user's groups. Param 1: user name, param 2: gid to skip.
    SupplementaryGroups,
}

impl QueryOp {
    pub const ALL: [Self; 10] = [
        Self::AccountByName,
        Self::AccountById,
        Self::AccountScan,
        Self::GroupByName,
        Self::GroupById,
        Self::GroupScan,
        Self::GroupMembers,
        Self::ShadowByName,
        Self::ShadowScan,
        Self::SupplementaryGroups,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::AccountByName => "getpwnam",
            Self::AccountById => "getpwuid",
            Self::AccountScan => "getpwent",
            Self::GroupByName => "getgrnam",
            Self::GroupById => "getgrgid",
            Self::GroupScan => "getgrent",
            Self::GroupMembers => "getgrmem",
            Self::ShadowByName => "getspnam",
            Self::ShadowScan => "getspent",
            Self::SupplementaryGroups => "initgroups",
        }
    }
}

/// A positional query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param<'a> {
    Text(&'a str),
    Int(i64),
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    Null,
    Int(i64),
    Text(String),
}

/// Errors reported by a store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend is locked by someone else; retry later.
    #[error("store busy")]
    Busy,
    /// The backend could not be opened, prepared or queried.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A row could not be turned into a record.
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    columns: Vec<Column>,
}

impl Row {
    #[must_use]
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Text at `index`. `NULL` reads as the empty string; integers are
    /// rendered in decimal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] if the column does not exist or
    /// contains a NUL byte.
    pub fn column_text(&self, index: usize) -> Result<Cow<'_, str>, StoreError> {
        let text = match self.column(index)? {
            Column::Null => Cow::Borrowed(""),
            Column::Int(v) => Cow::Owned(v.to_string()),
            Column::Text(s) => Cow::Borrowed(s.as_str()),
        };
        if text.contains('\0') {
            return Err(StoreError::Malformed(format!(
                "column {index} contains a NUL byte"
            )));
        }
        Ok(text)
    }

    /// Integer at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] if the column is missing, `NULL`, or
    /// not an integer.
    pub fn column_int(&self, index: usize) -> Result<i64, StoreError> {
        self.column_opt_int(index)?
            .ok_or_else(|| StoreError::Malformed(format!("column {index} is NULL")))
    }

    /// Integer at `index`, `None` for `NULL` or a missing trailing column.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] if the column holds non-numeric text.
    pub fn column_opt_int(&self, index: usize) -> Result<Option<i64>, StoreError> {
        match self.columns.get(index) {
            None | Some(Column::Null) => Ok(None),
            Some(Column::Int(v)) => Ok(Some(*v)),
            Some(Column::Text(s)) => s.trim().parse().map(Some).map_err(|_| {
                StoreError::Malformed(format!("column {index} is not an integer: {s:?}"))
            }),
        }
    }

    /// Id column at `index`, checked against the `u32` range.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Malformed`] when the value is missing or out of range.
    pub fn column_id(&self, index: usize) -> Result<u32, StoreError> {
        let raw = self.column_int(index)?;
        u32::try_from(raw)
            .map_err(|_| StoreError::Malformed(format!("column {index} id out of range: {raw}")))
    }

    fn column(&self, index: usize) -> Result<&Column, StoreError> {
        self.columns
            .get(index)
            .ok_or_else(|| StoreError::Malformed(format!("missing column {index}")))
    }
}

impl FromIterator<Column> for Row {
    fn from_iter<I: IntoIterator<Item = Column>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Adapter traits
// ---------------------------------------------------------------------------

/// Opens connections to the record backend.
pub trait Store: Send + Sync {
    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] if the backend cannot be reached,
    /// [`StoreError::Busy`] if it is locked.
    fn open(&self) -> Result<Box<dyn StoreConnection>, StoreError>;
}

/// A live connection. Dropping it closes the connection.
pub trait StoreConnection: Send {
    /// Query text for `op`, either compiled in or read from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured text cannot be read.
    fn query_text(&mut self, op: QueryOp) -> Result<Cow<'static, str>, StoreError>;

    /// Prepares `sql` with `params` bound by position (1-based in SQL terms).
    ///
    /// The returned stream does not borrow the connection, so a second query
    /// can be prepared while the first one is still being stepped.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement cannot be prepared or bound.
    fn prepare(&mut self, sql: &str, params: &[Param<'_>])
        -> Result<Box<dyn RowStream>, StoreError>;
}

/// A prepared, running statement. Dropping it finalizes the statement.
pub trait RowStream: Send {
    /// Next row, or `None` once the result set is exhausted.
    ///
    /// # Errors
    ///
    /// [`StoreError::Busy`] on lock contention, [`StoreError::Unavailable`]
    /// on any other backend failure.
    fn step(&mut self) -> Result<Option<Row>, StoreError>;
}
