//! Regeneration, edit-replay, and message deletion.
//!
//! Regeneration re-invokes the streaming engine against a historical
//! point in the conversation, reusing the existing message id so the
//! rendered bubble never flickers. Deletion runs an ordered cleanup:
//! stop owned playback, delete audio blobs per watermark, delete vector
//! entries, roll back memory snapshots, then persist messages and
//! settings together.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::memory::types::MetadataPatch;
use crate::session::memory_box::rollback_after_deletion;
use crate::session::types::{Message, MessageId, Role};

use super::ResponseEngine;

/// Index of the nearest earlier message with role `user`, skipping
/// time-markers, system reminders, and intervening replies.
pub(crate) fn preceding_user_index(messages: &[Message], from: usize) -> Option<usize> {
    messages[..from]
        .iter()
        .rposition(|m| m.role == Role::User)
}

/// Index of the reply (model or error) following a user turn, if any.
/// System markers between the turn and its reply are skipped.
pub(crate) fn following_reply_index(messages: &[Message], user_index: usize) -> Option<usize> {
    for (i, message) in messages.iter().enumerate().skip(user_index + 1) {
        match message.role {
            Role::Model | Role::Error => return Some(i),
            // The next turn started; this one was never answered.
            Role::User => return None,
            Role::System => {}
        }
    }
    None
}

impl ResponseEngine {
    /// Regenerate a model (or error) message in place.
    ///
    /// History is truncated at the preceding user turn and the same
    /// message id is reused as the streaming placeholder. The original
    /// message is snapshotted first so an empty abort restores it
    /// verbatim.
    pub async fn regenerate_model_message(&self, message_id: &str) -> Result<()> {
        let Some(session_id) = self.sessions.active_session_id() else {
            return Err(EngineError::NotFound("no active session".into()));
        };

        let located = self
            .sessions
            .with_active(|session| {
                let index = session.message_index(message_id)?;
                let message = &session.messages[index];
                if !matches!(message.role, Role::Model | Role::Error) {
                    return None;
                }
                let user_index = preceding_user_index(&session.messages, index)?;
                Some((index, user_index, message.clone()))
            })
            .flatten();

        let Some((_, user_index, mut original)) = located else {
            debug!(message = message_id, "regeneration target not found; no-op");
            return Ok(());
        };

        // Stale derived artifacts go before the mutation that invalidates
        // them: audio blobs synchronously, then the vector entry.
        self.playback.stop_if_owned_by([message_id]);
        if let Some(count) = original.cached_audio_segments.take() {
            self.audio_cache.delete_for_message(message_id, count)?;
        }
        if std::mem::take(&mut original.embedded) {
            self.vector_index().delete_vector(message_id)?;
        }
        // The snapshot restored on an empty abort must not claim the
        // artifacts deleted above.

        let reset_id = message_id.to_owned();
        self.sessions.update_current_session(move |mut session| {
            let message = session.find_message_mut(&reset_id)?;
            message.role = Role::Model;
            message.content.clear();
            message.thoughts = None;
            message.cached_audio_segments = None;
            message.embedded = false;
            message.favorite = false;
            message.is_streaming = true;
            Some(session)
        });
        if let Some(messages) = self.sessions.with_active(|s| s.messages.clone()) {
            self.sessions.schedule_persist(&session_id, messages);
        }

        self.run_generation(&session_id, message_id, user_index + 1, Some(original))
            .await
    }

    /// Replay generation from a user turn.
    ///
    /// If a reply already follows, that reply is regenerated in place;
    /// otherwise a fresh placeholder is appended after the user turn and
    /// generation runs normally.
    pub async fn regenerate_from_user_message(&self, user_message_id: &str) -> Result<()> {
        let Some(session_id) = self.sessions.active_session_id() else {
            return Err(EngineError::NotFound("no active session".into()));
        };

        let located = self
            .sessions
            .with_active(|session| {
                let index = session.message_index(user_message_id)?;
                if session.messages[index].role != Role::User {
                    return None;
                }
                Some((index, following_reply_index(&session.messages, index)))
            })
            .flatten();

        let Some((user_index, reply_index)) = located else {
            debug!(message = user_message_id, "replay target not found; no-op");
            return Ok(());
        };

        if let Some(reply_index) = reply_index {
            let reply_id = self
                .sessions
                .with_active(|s| s.messages[reply_index].id.clone())
                .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
            return self.regenerate_model_message(&reply_id).await;
        }

        let placeholder = Message::placeholder();
        let placeholder_id = placeholder.id.clone();
        self.sessions.update_current_session(|mut session| {
            session.messages.insert(user_index + 1, placeholder.clone());
            Some(session)
        });
        if let Some(messages) = self.sessions.with_active(|s| s.messages.clone()) {
            self.sessions.schedule_persist(&session_id, messages);
        }

        self.run_generation(&session_id, &placeholder_id, user_index + 1, None)
            .await
    }

    /// Delete one message.
    pub fn delete_message(&self, message_id: &str) -> Result<()> {
        self.delete_messages(std::slice::from_ref(&message_id.to_owned()))
    }

    /// Delete a message and everything after it.
    pub fn delete_message_and_subsequent(&self, message_id: &str) -> Result<()> {
        let ids = self
            .sessions
            .with_active(|session| {
                session.message_index(message_id).map(|index| {
                    session.messages[index..]
                        .iter()
                        .map(|m| m.id.clone())
                        .collect::<Vec<_>>()
                })
            })
            .flatten()
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(());
        }
        self.delete_messages(&ids)
    }

    /// Delete a set of messages from the active conversation, with the
    /// full cleanup cascade.
    pub fn delete_messages(&self, ids: &[MessageId]) -> Result<()> {
        let Some(session_id) = self.sessions.active_session_id() else {
            return Err(EngineError::NotFound("no active session".into()));
        };
        let deleted: HashSet<MessageId> = ids.iter().cloned().collect();
        if deleted.is_empty() {
            return Ok(());
        }

        // A generation streaming into a message being deleted is cancelled
        // rather than left reconciling into a removed row.
        if let Some(pending) = self.pending_message(&session_id)
            && deleted.contains(&pending)
        {
            self.cancel_response(&session_id);
        }

        // (1) Stop playback that belongs to a doomed message.
        self.playback.stop_if_owned_by(deleted.iter().map(String::as_str));

        // (2) Audio blobs, per watermark.
        let watermarks = self
            .sessions
            .with_active(|session| {
                session
                    .messages
                    .iter()
                    .filter(|m| deleted.contains(&m.id))
                    .filter_map(|m| m.cached_audio_segments.map(|c| (m.id.clone(), c)))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        for (message_id, count) in &watermarks {
            self.audio_cache.delete_for_message(message_id, *count)?;
        }

        // (3) Vector entries.
        self.vector_index().delete_vectors(ids)?;

        // (4) Remove the messages and roll the memory profile back.
        let removed = self.sessions.update_current_session(|mut session| {
            let before = session.messages.len();
            session.messages.retain(|m| !deleted.contains(&m.id));
            if session.messages.len() == before {
                return None;
            }
            rollback_after_deletion(&mut session, &deleted);
            Some(session)
        });
        if !removed {
            debug!(session = %session_id, "deletion matched no messages");
            return Ok(());
        }

        // (5) Messages and settings persist together.
        self.sessions.persist_active_now()?;
        debug!(session = %session_id, count = deleted.len(), "messages deleted");
        Ok(())
    }

    /// Rename the active conversation, keeping the durable row and the
    /// vector provenance metadata in sync.
    pub fn rename_active_session(&self, title: &str) -> Result<()> {
        let Some(session_id) = self.sessions.active_session_id() else {
            return Err(EngineError::NotFound("no active session".into()));
        };

        let title_owned = title.to_owned();
        self.sessions.update_current_session(|mut session| {
            session.title = title_owned.clone();
            Some(session)
        });
        self.sessions.store().update_title(&session_id, title)?;

        let patched = self.vector_index().update_session_metadata(
            &session_id,
            &MetadataPatch {
                session_title: Some(title.to_owned()),
                partner_role: None,
            },
        )?;
        if patched > 0 {
            debug!(session = %session_id, patched, "vector metadata retitled");
        }
        Ok(())
    }
}
