//! SQLite-backed conversation store.
//!
//! The durable authority of record: sessions (with embedded message
//! lists), app metadata, the audio-segment blob cache, and the vector
//! index all live in one database file. The in-memory session owned by
//! the controller is a cache that is reconciled back here.
//!
//! Thread-safe via an internal `Mutex<Connection>`. The embedding
//! application holds exactly one [`ChatStore`] behind an `Arc`; a second
//! process (or a stale handle) holding the database surfaces as
//! [`StoreError::Blocked`] so the UI can ask the user to close it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, ErrorCode, params};
use tracing::warn;

use super::migrate::migrate_if_needed;
use super::schema::{apply_schema, read_schema_version};
use crate::memory::types::{MetadataPatch, VectorEntry, VectorMetadata};
use crate::session::types::{Message, Session, SessionSettings, SessionSummary, now_epoch_secs};

/// Database filename within the data directory.
const DB_FILENAME: &str = "wisp.db";

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u64 = 250;

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    /// Another handle holds the database (the "close your other tab" case).
    #[error("database is held by another handle")]
    Blocked,

    #[error("I/O error: {0}")]
    Io(String),

    /// A persisted document failed to deserialize.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock poisoned: {0}")]
    Lock(String),
}

/// Map SQLite failures, surfacing busy/locked as the distinguishable
/// blocked-open error.
fn map_sqlite(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e
        && matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        )
    {
        return StoreError::Blocked;
    }
    StoreError::Sqlite(e)
}

/// SQLite-backed conversation store.
pub struct ChatStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl ChatStore {
    /// Open (or create) the database at `{data_dir}/wisp.db`.
    ///
    /// Idempotent: applies the schema if the database is new and runs any
    /// pending forward migrations.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io(e.to_string()))?;
        let path = data_dir.join(DB_FILENAME);
        let conn = Connection::open(&path).map_err(map_sqlite)?;
        Self::prepare(conn, path)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite)?;
        Self::prepare(conn, PathBuf::from(":memory:"))
    }

    fn prepare(conn: Connection, path: PathBuf) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(map_sqlite)?;
        apply_schema(&conn).map_err(map_sqlite)?;
        migrate_if_needed(&conn).map_err(map_sqlite)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current schema version stamp.
    pub fn schema_version(&self) -> Result<Option<u32>, StoreError> {
        let conn = self.lock()?;
        read_schema_version(&conn).map_err(map_sqlite)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Lock(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Insert or replace a whole session document.
    pub fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let settings = to_json(&session.settings)?;
        let messages = to_json(&session.messages)?;
        conn.execute(
            "INSERT INTO sessions (id, title, model, settings, messages, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(id) DO UPDATE SET \
               title = excluded.title, model = excluded.model, \
               settings = excluded.settings, messages = excluded.messages, \
               updated_at = excluded.updated_at",
            params![
                session.id,
                session.title,
                session.settings.model,
                settings,
                messages,
                session.created_at,
                session.updated_at,
            ],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    /// Load a full session, `None` if absent.
    pub fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, title, settings, messages, created_at, updated_at \
                 FROM sessions WHERE id = ?1",
            )
            .map_err(map_sqlite)?;
        let mut rows = stmt.query(params![id]).map_err(map_sqlite)?;
        let Some(row) = rows.next().map_err(map_sqlite)? else {
            return Ok(None);
        };

        let settings_json: String = row.get(2).map_err(map_sqlite)?;
        let messages_json: String = row.get(3).map_err(map_sqlite)?;
        let settings: SessionSettings = from_json(&settings_json)?;
        let messages: Vec<Message> = from_json(&messages_json)?;

        Ok(Some(Session {
            id: row.get(0).map_err(map_sqlite)?,
            title: row.get(1).map_err(map_sqlite)?,
            messages,
            settings,
            created_at: row.get(4).map_err(map_sqlite)?,
            updated_at: row.get(5).map_err(map_sqlite)?,
        }))
    }

    /// List every session as a lightweight summary, newest first, without
    /// deserializing message arrays.
    pub fn list_summaries(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, title, model, json_array_length(messages), created_at, updated_at \
                 FROM sessions ORDER BY updated_at DESC",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SessionSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    model: row.get(2)?,
                    message_count: row.get::<_, i64>(3)? as usize,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .map_err(map_sqlite)?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.map_err(map_sqlite)?);
        }
        Ok(summaries)
    }

    /// Load every full session. The bulk read consumed by import/export;
    /// unreadable rows are skipped rather than poisoning the whole dump.
    pub fn all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, title, settings, messages, created_at, updated_at \
                 FROM sessions ORDER BY updated_at DESC",
            )
            .map_err(map_sqlite)?;
        let mut rows = stmt.query([]).map_err(map_sqlite)?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqlite)? {
            let id: String = row.get(0).map_err(map_sqlite)?;
            let settings_json: String = row.get(2).map_err(map_sqlite)?;
            let messages_json: String = row.get(3).map_err(map_sqlite)?;
            let (Ok(settings), Ok(messages)) = (
                from_json::<SessionSettings>(&settings_json),
                from_json::<Vec<Message>>(&messages_json),
            ) else {
                warn!(session = %id, "skipping unreadable session row");
                continue;
            };
            sessions.push(Session {
                id,
                title: row.get(1).map_err(map_sqlite)?,
                messages,
                settings,
                created_at: row.get(4).map_err(map_sqlite)?,
                updated_at: row.get(5).map_err(map_sqlite)?,
            });
        }
        Ok(sessions)
    }

    /// Delete a session row. Derived artifacts (audio, vectors) are the
    /// caller's responsibility; see the controller's delete cascade.
    pub fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .map_err(map_sqlite)?;
        Ok(())
    }

    /// Rewrite only the message array of one session.
    pub fn update_messages(&self, id: &str, messages: &[Message]) -> Result<(), StoreError> {
        let json = to_json(&messages)?;
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE sessions SET messages = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now_epoch_secs(), id],
            )
            .map_err(map_sqlite)?;
        if rows == 0 {
            return Err(StoreError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    /// Rewrite only the settings document of one session.
    pub fn update_settings(&self, id: &str, settings: &SessionSettings) -> Result<(), StoreError> {
        let json = to_json(settings)?;
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE sessions SET settings = ?1, model = ?2, updated_at = ?3 WHERE id = ?4",
                params![json, settings.model, now_epoch_secs(), id],
            )
            .map_err(map_sqlite)?;
        if rows == 0 {
            return Err(StoreError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    /// Rewrite only the title of one session.
    pub fn update_title(&self, id: &str, title: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![title, now_epoch_secs(), id],
            )
            .map_err(map_sqlite)?;
        if rows == 0 {
            return Err(StoreError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    /// Rewrite only the model of one session, keeping the settings
    /// document in sync.
    pub fn update_model(&self, id: &str, model: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE sessions SET model = ?1, \
                 settings = json_set(settings, '$.model', ?1), updated_at = ?2 WHERE id = ?3",
                params![model, now_epoch_secs(), id],
            )
            .map_err(map_sqlite)?;
        if rows == 0 {
            return Err(StoreError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // App metadata
    // -----------------------------------------------------------------------

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT value FROM app_meta WHERE key = ?1")
            .map_err(map_sqlite)?;
        let mut rows = stmt.query(params![key]).map_err(map_sqlite)?;
        match rows.next().map_err(map_sqlite)? {
            Some(row) => Ok(Some(row.get(0).map_err(map_sqlite)?)),
            None => Ok(None),
        }
    }

    pub fn put_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn delete_meta(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM app_meta WHERE key = ?1", params![key])
            .map_err(map_sqlite)?;
        Ok(())
    }

    /// Every app-metadata pair (consumed by export).
    pub fn all_meta(&self) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM app_meta ORDER BY key")
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(map_sqlite)?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row.map_err(map_sqlite)?);
        }
        Ok(pairs)
    }

    // -----------------------------------------------------------------------
    // Audio segments
    // -----------------------------------------------------------------------

    pub fn get_audio(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT data FROM audio_segments WHERE key = ?1")
            .map_err(map_sqlite)?;
        let mut rows = stmt.query(params![key]).map_err(map_sqlite)?;
        match rows.next().map_err(map_sqlite)? {
            Some(row) => Ok(Some(row.get(0).map_err(map_sqlite)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace one blob (re-synthesis writes under the same key).
    pub fn put_audio(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audio_segments (key, data) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET data = excluded.data",
            params![key, data],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn bulk_put_audio(&self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite)?;
        for (key, data) in entries {
            tx.execute(
                "INSERT INTO audio_segments (key, data) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET data = excluded.data",
                params![key, data],
            )
            .map_err(map_sqlite)?;
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(())
    }

    pub fn delete_audio(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM audio_segments WHERE key = ?1", params![key])
            .map_err(map_sqlite)?;
        Ok(())
    }

    pub fn bulk_delete_audio(&self, keys: &[String]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite)?;
        for key in keys {
            tx.execute("DELETE FROM audio_segments WHERE key = ?1", params![key])
                .map_err(map_sqlite)?;
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Vector entries
    // -----------------------------------------------------------------------

    pub fn put_vector(&self, entry: &VectorEntry) -> Result<(), StoreError> {
        self.put_vectors(std::slice::from_ref(entry))
    }

    pub fn put_vectors(&self, entries: &[VectorEntry]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite)?;
        for entry in entries {
            let vector = to_json(&entry.vector)?;
            let metadata = to_json(&entry.metadata)?;
            tx.execute(
                "INSERT INTO vector_entries (id, text, vector, timestamp, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(id) DO UPDATE SET \
                   text = excluded.text, vector = excluded.vector, \
                   timestamp = excluded.timestamp, metadata = excluded.metadata",
                params![entry.id, entry.text, vector, entry.timestamp, metadata],
            )
            .map_err(map_sqlite)?;
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(())
    }

    pub fn get_vector(&self, id: &str) -> Result<Option<VectorEntry>, StoreError> {
        let mut found = self.get_vectors(std::slice::from_ref(&id.to_owned()))?;
        Ok(found.pop())
    }

    pub fn get_vectors(&self, ids: &[String]) -> Result<Vec<VectorEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, text, vector, timestamp, metadata FROM vector_entries WHERE id = ?1",
            )
            .map_err(map_sqlite)?;

        let mut entries = Vec::new();
        for id in ids {
            let mut rows = stmt.query(params![id]).map_err(map_sqlite)?;
            if let Some(row) = rows.next().map_err(map_sqlite)? {
                entries.push(row_to_vector(row)?);
            }
        }
        Ok(entries)
    }

    pub fn all_vectors(&self) -> Result<Vec<VectorEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, text, vector, timestamp, metadata FROM vector_entries")
            .map_err(map_sqlite)?;
        let mut rows = stmt.query([]).map_err(map_sqlite)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqlite)? {
            entries.push(row_to_vector(row)?);
        }
        Ok(entries)
    }

    pub fn delete_vector(&self, id: &str) -> Result<(), StoreError> {
        self.delete_vectors(std::slice::from_ref(&id.to_owned()))
    }

    pub fn delete_vectors(&self, ids: &[String]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction().map_err(map_sqlite)?;
        for id in ids {
            tx.execute("DELETE FROM vector_entries WHERE id = ?1", params![id])
                .map_err(map_sqlite)?;
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(())
    }

    /// Apply a metadata patch to every vector belonging to a session.
    ///
    /// Full-scan cursor patch; acceptable because the index is local and
    /// small. Returns the number of patched rows.
    pub fn patch_session_vector_metadata(
        &self,
        session_id: &str,
        patch: &MetadataPatch,
    ) -> Result<usize, StoreError> {
        if patch.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let rows: Vec<(String, String)> = {
            let mut stmt = conn
                .prepare("SELECT id, metadata FROM vector_entries")
                .map_err(map_sqlite)?;
            let mapped = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(map_sqlite)?;
            mapped
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite)?
        };

        let tx = conn.unchecked_transaction().map_err(map_sqlite)?;
        let mut patched = 0usize;
        for (id, metadata_json) in rows {
            let Ok(mut metadata) = serde_json::from_str::<VectorMetadata>(&metadata_json) else {
                warn!(vector = %id, "skipping vector with unreadable metadata");
                continue;
            };
            if metadata.session_id != session_id {
                continue;
            }
            patch.apply(&mut metadata);
            tx.execute(
                "UPDATE vector_entries SET metadata = ?1 WHERE id = ?2",
                params![to_json(&metadata)?, id],
            )
            .map_err(map_sqlite)?;
            patched += 1;
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(patched)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn row_to_vector(row: &rusqlite::Row<'_>) -> Result<VectorEntry, StoreError> {
    let vector_json: String = row.get(2).map_err(map_sqlite)?;
    let metadata_json: String = row.get(4).map_err(map_sqlite)?;
    Ok(VectorEntry {
        id: row.get(0).map_err(map_sqlite)?,
        text: row.get(1).map_err(map_sqlite)?,
        vector: from_json(&vector_json)?,
        timestamp: row.get(3).map_err(map_sqlite)?,
        metadata: from_json(&metadata_json)?,
    })
}
