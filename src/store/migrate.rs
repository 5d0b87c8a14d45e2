//! Forward-only schema migrations.
//!
//! Each migration transforms data written by one prior schema version
//! into the next without data loss. Migrations run inside a transaction
//! during [`ChatStore::open`](super::ChatStore::open); a database at the
//! current version is a no-op.

use rusqlite::{Connection, params};
use tracing::info;

use super::schema::{CURRENT_SCHEMA_VERSION, read_schema_version, write_schema_version};

/// Bring an opened database up to [`CURRENT_SCHEMA_VERSION`].
pub(crate) fn migrate_if_needed(conn: &Connection) -> rusqlite::Result<()> {
    let mut version = read_schema_version(conn)?.unwrap_or(CURRENT_SCHEMA_VERSION);
    while version < CURRENT_SCHEMA_VERSION {
        match version {
            1 => migrate_v1_to_v2(conn)?,
            _ => break,
        }
        version += 1;
        write_schema_version(conn, version)?;
    }
    Ok(())
}

/// v1 → v2: move audio blobs out of the session document.
///
/// Version 1 stored synthesized speech inline on each message as an
/// `inline_audio` array of base64 strings. Version 2 relocates each blob
/// into the `audio_segments` table under `{message_id}_part_{i}` and
/// replaces the inline array with the `cached_audio_segments` watermark.
fn migrate_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    use base64::Engine as _;

    let tx = conn.unchecked_transaction()?;
    let rows: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT id, messages FROM sessions")?;
        let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        mapped.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut moved = 0usize;
    for (session_id, messages_json) in rows {
        let Ok(mut messages) = serde_json::from_str::<Vec<serde_json::Value>>(&messages_json)
        else {
            // Unparseable documents are left untouched rather than dropped.
            continue;
        };

        let mut changed = false;
        for message in &mut messages {
            let Some(object) = message.as_object_mut() else {
                continue;
            };
            let Some(inline) = object.remove("inline_audio") else {
                continue;
            };
            let Some(parts) = inline.as_array() else {
                continue;
            };
            let Some(message_id) = object.get("id").and_then(|v| v.as_str()).map(String::from)
            else {
                continue;
            };

            let mut stored = 0u32;
            for (index, part) in parts.iter().enumerate() {
                let Some(encoded) = part.as_str() else { continue };
                let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                    continue;
                };
                tx.execute(
                    "INSERT INTO audio_segments (key, data) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET data = excluded.data",
                    params![format!("{message_id}_part_{index}"), bytes],
                )?;
                stored += 1;
                moved += 1;
            }
            if stored > 0 {
                object.insert("cached_audio_segments".to_owned(), stored.into());
            }
            changed = true;
        }

        if changed {
            let updated = serde_json::to_string(&messages)
                .unwrap_or(messages_json);
            tx.execute(
                "UPDATE sessions SET messages = ?1 WHERE id = ?2",
                params![updated, session_id],
            )?;
        }
    }

    tx.commit()?;
    if moved > 0 {
        info!(blobs = moved, "migrated inline audio blobs to audio_segments");
    }
    Ok(())
}
