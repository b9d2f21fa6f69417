//! Persistence layer: libSQL-backed storage for delegated tasks.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{LibSqlBackend, StoreTuning};
pub use traits::TaskStore;
