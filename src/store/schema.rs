//! SQLite DDL for the conversation store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Current schema version. Version 2 moved audio blobs out of the session
/// document into the `audio_segments` table.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Complete DDL for the conversation database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Schema version tracking.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Conversation sessions. Messages and settings are JSON documents so that
-- single-field updaters can rewrite one column without touching the rest.
CREATE TABLE IF NOT EXISTS sessions (
    id         TEXT PRIMARY KEY,
    title      TEXT NOT NULL DEFAULT '',
    model      TEXT NOT NULL DEFAULT '',
    settings   TEXT NOT NULL DEFAULT '{}',  -- SessionSettings JSON
    messages   TEXT NOT NULL DEFAULT '[]',  -- Vec<Message> JSON
    created_at INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0
);

-- List views order by recency.
CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at);

-- Small app-level key/value pairs (active-session pointer, preferences).
CREATE TABLE IF NOT EXISTS app_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Synthesized speech segments, keyed "{message_id}_part_{index}".
CREATE TABLE IF NOT EXISTS audio_segments (
    key  TEXT PRIMARY KEY,
    data BLOB NOT NULL
);

-- Embedding vectors, one per eligible message.
CREATE TABLE IF NOT EXISTS vector_entries (
    id        TEXT PRIMARY KEY,   -- message id
    text      TEXT NOT NULL,
    vector    TEXT NOT NULL,      -- JSON array of f32
    timestamp INTEGER NOT NULL DEFAULT 0,
    metadata  TEXT NOT NULL       -- VectorMetadata JSON
);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. Seeds the current schema version into
/// `schema_meta` if this is a fresh database.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read the stored schema version, `None` if the stamp is missing.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let value: String = row.get(0)?;
            Ok(value.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}

/// Overwrite the stored schema version.
pub(crate) fn write_schema_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_schema_creates_tables() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        apply_schema(&conn).expect("apply_schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .filter_map(|r| r.ok())
            .collect();

        for table in ["sessions", "app_meta", "audio_segments", "vector_entries"] {
            assert!(tables.contains(&table.to_owned()), "missing table {table}");
        }
    }

    #[test]
    fn apply_schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        apply_schema(&conn).expect("first apply");
        apply_schema(&conn).expect("second apply (idempotent)");
    }

    #[test]
    fn schema_version_is_seeded() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        apply_schema(&conn).expect("apply_schema");
        let version = read_schema_version(&conn)
            .expect("read")
            .expect("version exists");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn schema_version_not_overwritten_on_reapply() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        apply_schema(&conn).expect("first apply");
        write_schema_version(&conn, 1).expect("downgrade stamp");
        apply_schema(&conn).expect("second apply");
        let version = read_schema_version(&conn).expect("read");
        assert_eq!(version, Some(1));
    }
}
