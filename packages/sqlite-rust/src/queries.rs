//! Compiled-in query text and the expected schema.

use nsslite_core::QueryOp;

/// Tables the built-in queries read. `nss_queries` is only consulted when
/// query text is configured from the database.
pub const SCHEMA: &str = "\
CREATE TABLE passwd (
    uid      INTEGER PRIMARY KEY,
    gid      INTEGER NOT NULL,
    username TEXT NOT NULL UNIQUE,
    gecos    TEXT NOT NULL DEFAULT '',
    homedir  TEXT NOT NULL,
    shell    TEXT NOT NULL
);
CREATE TABLE shadow (
    username   TEXT PRIMARY KEY,
    passwd     TEXT NOT NULL,
    lastchange INTEGER,
    min        INTEGER,
    max        INTEGER,
    warn       INTEGER,
    inact      INTEGER,
    expire     INTEGER
);
CREATE TABLE groups (
    gid       INTEGER PRIMARY KEY,
    groupname TEXT NOT NULL UNIQUE,
    passwd    TEXT NOT NULL DEFAULT 'x'
);
CREATE TABLE user_group (
    uid INTEGER NOT NULL,
    gid INTEGER NOT NULL,
    PRIMARY KEY (uid, gid)
);
CREATE TABLE nss_queries (
    name  TEXT PRIMARY KEY,
    query TEXT NOT NULL
);
";

const ACCOUNT_COLUMNS: &str = "SELECT username, 'x', uid, gid, gecos, homedir, shell FROM passwd";
const GROUP_COLUMNS: &str = "SELECT groupname, passwd, gid FROM groups";
const SHADOW_COLUMNS: &str =
    "SELECT username, passwd, lastchange, min, max, warn, inact, expire FROM shadow";

/// Built-in query text for `op`.
///
/// Parameters are numbered (`?1`, `?2`) in the order the resolver binds them.
#[must_use]
pub fn builtin(op: QueryOp) -> String {
    match op {
        QueryOp::AccountByName => format!("{ACCOUNT_COLUMNS} WHERE username = ?1"),
        QueryOp::AccountById => format!("{ACCOUNT_COLUMNS} WHERE uid = ?1"),
        QueryOp::AccountScan => format!("{ACCOUNT_COLUMNS} ORDER BY uid"),
        QueryOp::GroupByName => format!("{GROUP_COLUMNS} WHERE groupname = ?1"),
        QueryOp::GroupById => format!("{GROUP_COLUMNS} WHERE gid = ?1"),
        QueryOp::GroupScan => format!("{GROUP_COLUMNS} ORDER BY gid"),
        QueryOp::GroupMembers => "SELECT p.username FROM passwd p \
             INNER JOIN user_group ug ON ug.uid = p.uid \
             WHERE ug.gid = ?1 ORDER BY p.uid"
            .to_string(),
        QueryOp::ShadowByName => format!("{SHADOW_COLUMNS} WHERE username = ?1"),
        QueryOp::ShadowScan => format!("{SHADOW_COLUMNS} ORDER BY username"),
        QueryOp::SupplementaryGroups => "SELECT ug.gid FROM user_group ug \
             INNER JOIN passwd p ON p.uid = ug.uid \
             WHERE p.username = ?1 AND ug.gid != ?2 ORDER BY ug.gid"
            .to_string(),
    }
}

/// Wraps `sql` so that it yields at most `limit` rows starting at `offset`.
///
/// A trailing `;` is dropped so configured text ending in one still nests.
/// The closing parenthesis goes on its own line so a trailing `--` comment
/// cannot swallow it.
#[must_use]
pub fn paged(sql: &str, limit: usize, offset: usize) -> String {
    let inner = sql.trim().trim_end_matches(';').trim_end();
    format!("SELECT * FROM ({inner}\n) LIMIT {limit} OFFSET {offset}")
}
