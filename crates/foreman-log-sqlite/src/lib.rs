//! Durable SQLite-backed event log, one database file per project.

mod log;

pub use log::SqliteEventLog;
