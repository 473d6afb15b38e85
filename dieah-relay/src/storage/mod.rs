//! Storage backends for dieah-relay

mod sqlite;

pub use sqlite::OutboxStore;
