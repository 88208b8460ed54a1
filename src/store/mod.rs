//! Persistence: domain records, the async `Store` trait, and the libSQL
//! backend with version-tracked migrations.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use model::{
    AccountSettings, Direction, EmailMessage, InvocationRecord, ThreadAttributes, ThreadRecord,
};
pub use traits::{RatePool, Store};
