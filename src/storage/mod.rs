//! Storage layer: durable backends, cache, and the write-through store.

pub mod cache;
pub mod durable;
pub mod postgres;
pub mod sqlite;
pub mod store;

pub use cache::HistoryCache;
pub use durable::DurableBackend;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;
pub use store::ChatHistoryStore;
