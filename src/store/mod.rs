//! Persistence layer: libSQL-backed storage for task records, sessions and
//! user settings.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{SessionStore, SettingsStore, TaskStore};
