//! Record model: accounts, groups and shadow credentials.
//!
//! These are the owned, in-memory forms of the records a store produces.
//! They carry no layout information; packing them into a caller buffer is
//! the job of [`crate::pack`] and [`crate::members`].

use serde::{Deserialize, Serialize};

/// Sentinel for shadow aging fields that the store does not track.
pub const UNSET: i64 = -1;

/// Password marker reported for accounts whose real hash lives in the shadow table.
pub const SHADOWED_PASSWD: &str = "x";

/// The three record kinds the resolver serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Account,
    Group,
    Shadow,
}

impl Kind {
    /// Short name used in log fields and database names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Account => "passwd",
            Self::Group => "group",
            Self::Shadow => "shadow",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user account (`struct passwd`).
///
/// Every string is present; an empty string stands for "no value".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    /// Password marker, normally [`SHADOWED_PASSWD`].
    pub passwd: String,
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    pub gecos: String,
    /// Home directory.
    pub dir: String,
    pub shell: String,
}

/// A group (`struct group`) with its fully resolved member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub passwd: String,
    pub gid: u32,
    /// Member user names in store order. Duplicates are passed through.
    pub members: Vec<String>,
}

/// A shadow password entry (`struct spwd`).
///
/// Aging fields are day counts; [`UNSET`] means the field is not tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowCredential {
    pub name: String,
    pub passwd: String,
    pub last_change: i64,
    pub min_age: i64,
    pub max_age: i64,
    pub warn_period: i64,
    pub inactivity: i64,
    pub expire: i64,
}

impl ShadowCredential {
    /// Creates a credential with every aging field set to [`UNSET`].
    #[must_use]
    pub fn new(name: impl Into<String>, passwd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passwd: passwd.into(),
            last_change: UNSET,
            min_age: UNSET,
            max_age: UNSET,
            warn_period: UNSET,
            inactivity: UNSET,
            expire: UNSET,
        }
    }
}
