//! Durable notification record stores.

pub mod sqlite;

pub use sqlite::SqliteNotificationStore;
