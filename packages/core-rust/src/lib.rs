//! `nsslite` Core: record packing, scan cursors and the store contract for
//! an NSS-style identity resolver.

pub mod cursor;
pub mod kind;
pub mod members;
pub mod memory;
pub mod pack;
pub mod resolver;
pub mod status;
pub mod traits;
pub mod types;

pub use cursor::{CursorState, ScanSession};
pub use kind::{Accounts, Groups, RecordKind, Shadows};
pub use members::{GroupView, MemberTable};
pub use pack::{AccountView, InsufficientSpace, Pack, ShadowView};
pub use resolver::Resolver;
pub use status::{ResolveError, Status};
pub use traits::{Column, Param, QueryOp, Row, RowStream, Store, StoreConnection, StoreError};
pub use types::{Account, Group, Kind, ShadowCredential, SHADOWED_PASSWD, UNSET};
