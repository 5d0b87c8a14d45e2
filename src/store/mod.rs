//! Durable conversation store.
//!
//! A versioned local SQLite database with four logical tables: sessions
//! (embedded message lists), app metadata, audio-segment blobs, and the
//! vector index. See [`sqlite::ChatStore`].

mod migrate;
mod schema;
mod sqlite;

pub use sqlite::{ChatStore, StoreError};
