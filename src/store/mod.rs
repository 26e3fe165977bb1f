//! Persistence layer — libSQL-backed storage for profiles, messages,
//! and pattern records.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;
pub mod types;

pub use libsql_backend::LibSqlStore;
pub use traits::Store;
pub use types::*;
