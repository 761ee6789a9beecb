//! Persistence layer: libSQL-backed result store for parsed emails,
//! the supplier catalog and match history.

pub mod libsql_backend;
pub mod migrations;
pub mod models;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use models::{EmailStatus, MatchRecord, ParsedEmailRecord, SupplierRecord};
pub use traits::ResultStore;
