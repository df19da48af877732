//! `SQLite` implementation of the store adapter.
//!
//! Each connection is opened read-only. Statements are stepped in pages of
//! `scan_batch_size` rows: a page is a fresh `LIMIT/OFFSET` query over the
//! configured query text, so a [`RowStream`] owns no borrowed statement and the
//! connection mutex is held only while a page is read.
//!
//! Pages are not read inside a transaction. A writer committing between two
//! pages of a scan can shift the rows seen by the next page.
//!
//! Every page re-runs the query and skips `offset` rows, so a full scan of
//! `n` rows reads on the order of `n * n / (2 * scan_batch_size)` rows. Raise
//! the batch size for large tables.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension};
use tracing::{debug, warn};

use nsslite_core::{Column, Param, QueryOp, Row, RowStream, Store, StoreConnection, StoreError};

use crate::config::{ConfigError, StoreConfig};
use crate::queries;

/// Store reading accounts, groups and shadow entries from one database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    config: Arc<StoreConfig>,
}

impl SqliteStore {
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` does not validate. The database is
    /// not touched until the first connection is opened.
    pub fn new(config: StoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl Store for SqliteStore {
    fn open(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.config.database, flags).map_err(|e| {
            warn!(database = %self.config.database.display(), error = %e, "cannot open database");
            map_error(e)
        })?;
        conn.busy_timeout(self.config.busy_timeout)
            .map_err(map_error)?;
        debug!(database = %self.config.database.display(), "opened database");
        Ok(Box::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::clone(&self.config),
        }))
    }
}

/// Maps a driver error onto the adapter taxonomy.
fn map_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Busy
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn bind(params: &[Param<'_>]) -> Vec<Value> {
    params
        .iter()
        .map(|p| match *p {
            Param::Text(s) => Value::Text(s.to_string()),
            Param::Int(i) => Value::Integer(i),
        })
        .collect()
}

fn column(value: ValueRef<'_>) -> Result<Column, StoreError> {
    Ok(match value {
        ValueRef::Null => Column::Null,
        ValueRef::Integer(i) => Column::Int(i),
        ValueRef::Real(f) => Column::Text(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Column::Text(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| StoreError::Malformed("column is not valid UTF-8".to_string()))?,
        ),
    })
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    config: Arc<StoreConfig>,
}

impl StoreConnection for SqliteConnection {
    fn query_text(&mut self, op: QueryOp) -> Result<Cow<'static, str>, StoreError> {
        if self.config.queries_from_table {
            let configured: Option<String> = self
                .conn
                .lock()
                .query_row(
                    "SELECT query FROM nss_queries WHERE name = ?1",
                    [op.name()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_error)?;
            if let Some(sql) = configured {
                debug!(op = op.name(), "using configured query");
                return Ok(Cow::Owned(sql));
            }
        }
        Ok(Cow::Owned(queries::builtin(op)))
    }

    fn prepare(
        &mut self,
        sql: &str,
        params: &[Param<'_>],
    ) -> Result<Box<dyn RowStream>, StoreError> {
        let batch = self.config.scan_batch_size;
        // Surface syntax errors and unknown tables here rather than on the
        // first step.
        self.conn
            .lock()
            .prepare(&queries::paged(sql, batch, 0))
            .map(drop)
            .map_err(map_error)?;

        Ok(Box::new(SqliteStream {
            conn: Arc::clone(&self.conn),
            sql: sql.to_string(),
            params: bind(params),
            batch,
            offset: 0,
            page: VecDeque::new(),
            exhausted: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Row stream
// ---------------------------------------------------------------------------

struct SqliteStream {
    conn: Arc<Mutex<Connection>>,
    sql: String,
    params: Vec<Value>,
    batch: usize,
    offset: usize,
    page: VecDeque<Row>,
    exhausted: bool,
}

impl SqliteStream {
    fn fetch_page(&mut self) -> Result<(), StoreError> {
        let sql = queries::paged(&self.sql, self.batch, self.offset);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(map_error)?;
        let width = stmt.column_count();
        let mut rows = stmt
            .query(params_from_iter(self.params.iter()))
            .map_err(map_error)?;

        let mut fetched = 0usize;
        while let Some(row) = rows.next().map_err(map_error)? {
            let row = (0..width)
                .map(|i| row.get_ref(i).map_err(map_error).and_then(column))
                .collect::<Result<Row, StoreError>>()?;
            self.page.push_back(row);
            fetched += 1;
        }

        self.offset += fetched;
        self.exhausted = fetched < self.batch;
        debug!(offset = self.offset, fetched, "fetched page");
        Ok(())
    }
}

impl RowStream for SqliteStream {
    fn step(&mut self) -> Result<Option<Row>, StoreError> {
        if self.page.is_empty() && !self.exhausted {
            self.fetch_page()?;
        }
        Ok(self.page.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use nsslite_core::{ResolveError, Resolver};
    use rusqlite::params;
    use tempfile::TempDir;

    use super::*;
    use crate::queries::SCHEMA;

    fn fixture(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("auth.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        for (uid, gid, name, gecos, home) in [
            (1000, 100, "alice", "Alice", "/home/alice"),
            (1001, 100, "bob", "", "/home/bob"),
            (1002, 100, "eve", "", "/home/eve"),
        ] {
            conn.execute(
                "INSERT INTO passwd (uid, gid, username, gecos, homedir, shell) \
                 VALUES (?1, ?2, ?3, ?4, ?5, '/bin/sh')",
                params![uid, gid, name, gecos, home],
            )
            .unwrap();
        }
        conn.execute_batch(
            "INSERT INTO groups (gid, groupname, passwd) VALUES (100, 'users', 'x');
             INSERT INTO groups (gid, groupname, passwd) VALUES (10, 'wheel', 'x');
             INSERT INTO groups (gid, groupname, passwd) VALUES (29, 'audio', 'x');
             INSERT INTO user_group (uid, gid) VALUES (1000, 10);
             INSERT INTO user_group (uid, gid) VALUES (1002, 10);
             INSERT INTO user_group (uid, gid) VALUES (1002, 29);
             INSERT INTO user_group (uid, gid) VALUES (1002, 100);
             INSERT INTO shadow (username, passwd, lastchange) VALUES ('eve', '$6$salt$hash', 19000);",
        )
        .unwrap();
        path
    }

    fn store(path: &Path, batch: usize) -> SqliteStore {
        SqliteStore::new(StoreConfig {
            scan_batch_size: batch,
            ..StoreConfig::with_database(path)
        })
        .unwrap()
    }

    #[test]
    fn eve_lookup_fills_exact_buffer() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(store(&fixture(&dir), 64));

        let mut buf = vec![0u8; 25];
        let view = resolver.account_by_name("eve", &mut buf).unwrap();
        assert_eq!(view.name.to_bytes(), b"eve");
        assert_eq!(view.passwd.to_bytes(), b"x");
        assert_eq!(view.gecos.to_bytes(), b"");
        assert_eq!(view.dir.to_bytes(), b"/home/eve");
        assert_eq!(view.shell.to_bytes(), b"/bin/sh");
        assert_eq!((view.uid, view.gid), (1002, 100));

        let mut small = vec![0u8; 24];
        assert_eq!(
            resolver.account_by_name("eve", &mut small).unwrap_err(),
            ResolveError::InsufficientSpace {
                required: 25,
                capacity: 24
            }
        );
    }

    #[test]
    fn missing_rows_are_not_found() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(store(&fixture(&dir), 64));
        let mut buf = vec![0u8; 128];
        assert_eq!(
            resolver.account_by_uid(4242, &mut buf).unwrap_err(),
            ResolveError::NotFound
        );
        assert_eq!(
            resolver.shadow_by_name("alice", &mut buf).unwrap_err(),
            ResolveError::NotFound
        );
    }

    #[test]
    fn scan_crosses_page_boundaries() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(store(&fixture(&dir), 2));

        resolver.start_account_scan().unwrap();
        let mut names = Vec::new();
        loop {
            let mut buf = vec![0u8; 128];
            match resolver.next_account(&mut buf) {
                Ok(view) => names.push(view.name.to_str().unwrap().to_string()),
                Err(ResolveError::EndOfSequence) => break,
                Err(e) => panic!("unexpected: {e}"),
            }
        }
        resolver.end_account_scan().unwrap();
        assert_eq!(names, vec!["alice", "bob", "eve"]);
    }

    #[test]
    fn group_members_come_from_user_group() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(store(&fixture(&dir), 1));

        let mut buf = vec![0u8; 256];
        let view = resolver.group_by_name("wheel", &mut buf).unwrap();
        let members: Vec<&str> = view.members.iter().map(|m| m.to_str().unwrap()).collect();
        assert_eq!(members, vec!["alice", "eve"]);

        let mut buf = vec![0u8; 256];
        let view = resolver.group_by_gid(29, &mut buf).unwrap();
        assert_eq!(view.name.to_bytes(), b"audio");
        assert_eq!(view.members.len(), 1);
    }

    #[test]
    fn shadow_null_aging_reads_as_unset() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(store(&fixture(&dir), 64));
        let mut buf = vec![0u8; 64];
        let view = resolver.shadow_by_name("eve", &mut buf).unwrap();
        assert_eq!(view.passwd.to_bytes(), b"$6$salt$hash");
        assert_eq!(view.last_change, 19000);
        assert_eq!(view.min_age, -1);
        assert_eq!(view.expire, -1);
    }

    #[test]
    fn supplementary_groups_exclude_primary() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(store(&fixture(&dir), 64));
        let mut groups = vec![100];
        resolver
            .supplementary_groups("eve", 100, &mut groups, None)
            .unwrap();
        assert_eq!(groups, vec![100, 10, 29]);
    }

    #[test]
    fn missing_database_is_backend_unavailable() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(store(&dir.path().join("absent.sqlite"), 64));
        let mut buf = vec![0u8; 128];
        assert!(matches!(
            resolver.account_by_name("eve", &mut buf),
            Err(ResolveError::BackendUnavailable(_))
        ));
        assert!(matches!(
            resolver.start_group_scan(),
            Err(ResolveError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn exclusive_lock_reports_busy() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let writer = Connection::open(&path).unwrap();
        writer.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let resolver = Resolver::new(store(&path, 64));
        let mut buf = vec![0u8; 128];
        assert_eq!(
            resolver.account_by_name("eve", &mut buf).unwrap_err(),
            ResolveError::TemporarilyUnavailable
        );

        writer.execute_batch("COMMIT;").unwrap();
        assert!(resolver.account_by_name("eve", &mut buf).is_ok());
    }

    #[test]
    fn configured_queries_override_builtin_text() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO nss_queries (name, query) VALUES ('getpwnam', ?1)",
            [
                "SELECT username, 'x', uid, gid, gecos, homedir, '/bin/zsh' \
                 FROM passwd WHERE username = ?1;",
            ],
        )
        .unwrap();
        drop(conn);

        let config = StoreConfig {
            queries_from_table: true,
            busy_timeout: Duration::from_millis(100),
            ..StoreConfig::with_database(&path)
        };
        let resolver = Resolver::new(SqliteStore::new(config).unwrap());

        let mut buf = vec![0u8; 128];
        let view = resolver.account_by_name("eve", &mut buf).unwrap();
        assert_eq!(view.shell.to_bytes(), b"/bin/zsh");

        // getpwuid has no row and falls back to the compiled-in text.
        let view = resolver.account_by_uid(1002, &mut buf).unwrap();
        assert_eq!(view.shell.to_bytes(), b"/bin/sh");
    }

    #[test]
    fn configured_query_ending_in_line_comment_still_runs() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO nss_queries (name, query) VALUES ('getpwnam', ?1)",
            [
                "SELECT username, 'x', uid, gid, gecos, homedir, shell \
                 FROM passwd WHERE username = ?1 -- by name",
            ],
        )
        .unwrap();
        drop(conn);

        let config = StoreConfig {
            queries_from_table: true,
            ..StoreConfig::with_database(&path)
        };
        let resolver = Resolver::new(SqliteStore::new(config).unwrap());
        let mut buf = vec![0u8; 128];
        let view = resolver.account_by_name("eve", &mut buf).unwrap();
        assert_eq!(view.name.to_bytes(), b"eve");
        assert_eq!(view.uid, 1002);
    }

    #[test]
    fn broken_configured_query_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO nss_queries (name, query) VALUES ('getgrent', 'SELECT nope FROM nowhere')",
            [],
        )
        .unwrap();
        drop(conn);

        let config = StoreConfig {
            queries_from_table: true,
            ..StoreConfig::with_database(&path)
        };
        let resolver = Resolver::new(SqliteStore::new(config).unwrap());
        assert!(matches!(
            resolver.start_group_scan(),
            Err(ResolveError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn blob_with_invalid_utf8_is_malformed() {
        assert!(matches!(
            column(ValueRef::Blob(&[0xff, 0xfe])),
            Err(StoreError::Malformed(_))
        ));
        assert_eq!(column(ValueRef::Integer(7)).unwrap(), Column::Int(7));
    }
}
