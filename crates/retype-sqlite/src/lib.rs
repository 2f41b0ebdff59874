//! SQLite backend for retype.
//!
//! One database file holds the records being migrated, their attributes,
//! the registered record types and the migration job documents.

mod db;
mod error;
mod records;
mod state;

pub use db::Database;
pub use error::DbError;
pub use records::SqliteRecordStore;
pub use state::SqliteStateStore;
