//! Normalized store and import pipeline for government budget data.
//!
//! Spreadsheet exports come in through [`repair`] and [`source`], get
//! ingested by [`import`] into a [`storage`] backend, and are queried back
//! out by [`rates`] and [`reconcile`].

pub mod config;
pub mod import;
pub mod models;
pub mod rates;
pub mod reconcile;
pub mod repair;
pub mod resolver;
pub mod source;
pub mod sqlite_storage;
pub mod storage;
pub mod translate;

pub use sqlite_storage::SqliteStorage;
pub use storage::{InMemoryStorage, StorageBackend};
