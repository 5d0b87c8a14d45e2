//! Session state controller.
//!
//! The single in-memory source of truth for the currently open
//! conversation. All structural mutation of the active session goes
//! through [`SessionController::update_current_session`], which keeps the
//! in-memory copy and the list-summary cache consistent. Persistence is
//! explicit: callers schedule a debounced write (or flush) after their
//! logical edit, so several edits can batch into one disk write.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::PersistenceConfig;
use crate::error::{EngineError, Result};
use crate::session::debounce::DebouncedWriter;
use crate::session::types::{Message, Session, SessionId, SessionSettings, SessionSummary};
use crate::store::ChatStore;

/// App-metadata key holding the id of the last selected conversation.
pub const ACTIVE_SESSION_KEY: &str = "active_session_id";

/// Where an edit keyed by session id landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The session is the active one; the in-memory copy was updated.
    Active,
    /// The session was edited directly in the durable store. The user has
    /// navigated away; the in-memory slot was not touched.
    Background,
    /// No such session anywhere; callers treat this as a silent no-op.
    Missing,
}

/// Owns the active in-memory session and the summary list.
pub struct SessionController {
    store: Arc<ChatStore>,
    writer: DebouncedWriter,
    active: Mutex<Option<Session>>,
    summaries: Mutex<Vec<SessionSummary>>,
}

impl SessionController {
    /// Build a controller over an opened store, loading the summary list.
    pub fn new(store: Arc<ChatStore>, persistence: &PersistenceConfig) -> Result<Self> {
        let summaries = store.list_summaries()?;
        let writer = DebouncedWriter::new(
            Arc::clone(&store) as Arc<dyn crate::session::debounce::MessageSink>,
            Duration::from_millis(persistence.debounce_ms),
        );
        Ok(Self {
            store,
            writer,
            active: Mutex::new(None),
            summaries: Mutex::new(summaries),
        })
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    /// Snapshot of the summary list, newest first.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.lock_summaries().clone()
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.lock_active().as_ref().map(|s| s.id.clone())
    }

    /// Whether `id` is still the open conversation. Async continuations
    /// must check this before applying in-memory updates.
    pub fn is_active(&self, id: &str) -> bool {
        self.lock_active().as_ref().is_some_and(|s| s.id == id)
    }

    /// Run a closure against the active session, if any.
    pub fn with_active<R>(&self, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.lock_active().as_ref().map(f)
    }

    /// Clone of the active session.
    pub fn active_snapshot(&self) -> Option<Session> {
        self.lock_active().clone()
    }

    /// The only sanctioned mutation of the active session.
    ///
    /// `updater` receives the current session and returns either the new
    /// value (replacing it wholesale, `updated_at` auto-bumped) or `None`
    /// for a no-op (e.g. target message not found). Returns whether a
    /// mutation happened. Persistence is NOT automatic: callers follow up
    /// with [`schedule_persist`](Self::schedule_persist) or a flush.
    pub fn update_current_session(
        &self,
        updater: impl FnOnce(Session) -> Option<Session>,
    ) -> bool {
        let mut active = self.lock_active();
        let Some(current) = active.as_ref() else {
            return false;
        };
        let id = current.id.clone();
        match updater(current.clone()) {
            Some(mut updated) => {
                updated.touch();
                self.refresh_summary(&updated);
                *active = Some(updated);
                true
            }
            None => {
                debug!(session = %id, "session updater declined to mutate");
                false
            }
        }
    }

    /// Create, persist, and activate a new conversation.
    pub fn new_chat(&self, title: &str, settings: SessionSettings) -> Result<SessionId> {
        self.flush_outgoing_active();
        let session = Session::new(title, settings);
        self.store.put_session(&session)?;
        let id = session.id.clone();
        self.refresh_summary(&session);
        *self.lock_active() = Some(session);
        self.persist_active_pointer(&id);
        Ok(id)
    }

    /// Load a conversation from the store and make it active.
    ///
    /// If the full fetch fails or returns nothing, falls back to the
    /// in-memory summary as a degraded, message-less view rather than
    /// blocking navigation.
    pub fn select_chat(&self, id: &str) -> Result<()> {
        self.flush_outgoing_active();
        let loaded = match self.store.get_session(id) {
            Ok(found) => found,
            Err(e) => {
                warn!(session = %id, error = %e, "full session fetch failed");
                None
            }
        };

        let session = match loaded {
            Some(session) => session,
            None => {
                let summary = self
                    .lock_summaries()
                    .iter()
                    .find(|s| s.id == id)
                    .cloned()
                    .ok_or_else(|| EngineError::NotFound(format!("session {id}")))?;
                warn!(session = %id, "falling back to degraded summary-only view");
                summary.into_degraded_session()
            }
        };

        *self.lock_active() = Some(session);
        self.persist_active_pointer(id);
        Ok(())
    }

    /// Re-select the conversation recorded as active in a prior run.
    pub fn restore_last_active(&self) -> Result<bool> {
        match self.store.get_meta(ACTIVE_SESSION_KEY)? {
            Some(id) => match self.select_chat(&id) {
                Ok(()) => Ok(true),
                Err(EngineError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            },
            None => Ok(false),
        }
    }

    /// Delete a conversation and all of its durable artifacts: audio
    /// blobs (via per-message watermarks), vector entries, and the
    /// session row itself.
    pub fn delete_chat(&self, id: &str) -> Result<()> {
        let session = match self.store.get_session(id)? {
            Some(session) => session,
            None => return Ok(()), // concurrent deletion race: silent no-op
        };

        let mut audio_keys = Vec::new();
        let mut message_ids = Vec::new();
        for message in &session.messages {
            if let Some(count) = message.cached_audio_segments {
                for part in 0..count {
                    audio_keys.push(crate::audio::segment_key(&message.id, part));
                }
            }
            message_ids.push(message.id.clone());
        }

        // Artifacts first, then the row: a crash in between leaves an
        // orphan session, never orphan blobs claiming a deleted owner.
        self.store.bulk_delete_audio(&audio_keys)?;
        self.store.delete_vectors(&message_ids)?;
        self.store.delete_session(id)?;

        self.writer.cancel(id);
        self.lock_summaries().retain(|s| s.id != id);
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|s| s.id == id) {
            *active = None;
            drop(active);
            if let Err(e) = self.store.delete_meta(ACTIVE_SESSION_KEY) {
                warn!(error = %e, "failed to clear active-session pointer");
            }
        }
        Ok(())
    }

    /// Schedule a debounced write of the given message array.
    pub fn schedule_persist(&self, session_id: &str, messages: Vec<Message>) {
        self.writer.schedule(session_id, messages);
    }

    /// Immediately persist the active session's messages and settings.
    pub fn persist_active_now(&self) -> Result<()> {
        let Some((id, messages, settings)) = self.with_active(|s| {
            (s.id.clone(), s.messages.clone(), s.settings.clone())
        }) else {
            return Ok(());
        };
        self.writer.flush(&id, &messages)?;
        self.store.update_settings(&id, &settings)?;
        Ok(())
    }

    /// Apply an edit to a session wherever it lives.
    ///
    /// If `session_id` is the active conversation the edit goes through
    /// [`update_current_session`](Self::update_current_session); otherwise
    /// it is applied directly against the durable copy (background
    /// completions for a session the user navigated away from still
    /// persist). The caller persists the active path explicitly.
    pub fn edit_session(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session),
    ) -> Result<EditOutcome> {
        if self.is_active(session_id) {
            let mutated = self.update_current_session(|mut session| {
                f(&mut session);
                Some(session)
            });
            return Ok(if mutated {
                EditOutcome::Active
            } else {
                EditOutcome::Missing
            });
        }

        match self.store.get_session(session_id)? {
            Some(mut session) => {
                f(&mut session);
                session.touch();
                self.store.put_session(&session)?;
                self.refresh_summary(&session);
                Ok(EditOutcome::Background)
            }
            None => Ok(EditOutcome::Missing),
        }
    }

    /// Flush the outgoing active session's pending debounced write before
    /// navigation, so a later background completion never races a stale
    /// snapshot onto disk.
    fn flush_outgoing_active(&self) {
        let Some((id, messages)) = self.with_active(|s| (s.id.clone(), s.messages.clone()))
        else {
            return;
        };
        if let Err(e) = self.writer.flush(&id, &messages) {
            warn!(session = %id, error = %e, "flush on navigation failed");
        }
    }

    /// Update the cached summary entry for a session and re-sort.
    fn refresh_summary(&self, session: &Session) {
        let summary = session.summary();
        let mut summaries = self.lock_summaries();
        summaries.retain(|s| s.id != summary.id);
        summaries.push(summary);
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    fn persist_active_pointer(&self, id: &str) {
        if let Err(e) = self.store.put_meta(ACTIVE_SESSION_KEY, id) {
            warn!(session = %id, error = %e, "failed to persist active-session pointer");
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_summaries(&self) -> std::sync::MutexGuard<'_, Vec<SessionSummary>> {
        self.summaries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::Role;

    fn controller() -> SessionController {
        let store = Arc::new(ChatStore::open_in_memory().expect("store"));
        SessionController::new(store, &PersistenceConfig::default()).expect("controller")
    }

    #[tokio::test]
    async fn new_chat_persists_and_activates() {
        let ctrl = controller();
        let id = ctrl
            .new_chat("Fresh", SessionSettings::default())
            .expect("new chat");

        assert!(ctrl.is_active(&id));
        assert!(ctrl.store().get_session(&id).expect("get").is_some());
        assert_eq!(
            ctrl.store().get_meta(ACTIVE_SESSION_KEY).expect("meta"),
            Some(id.clone())
        );
        assert_eq!(ctrl.summaries()[0].id, id);
    }

    #[tokio::test]
    async fn update_current_session_bumps_and_refreshes_summary() {
        let ctrl = controller();
        let id = ctrl
            .new_chat("Chat", SessionSettings::default())
            .expect("new chat");

        let mutated = ctrl.update_current_session(|mut session| {
            session.messages.push(Message::user("hello"));
            Some(session)
        });
        assert!(mutated);

        let summary = ctrl.summaries().into_iter().find(|s| s.id == id).expect("summary");
        assert_eq!(summary.message_count, 1);
        assert_eq!(
            ctrl.with_active(|s| s.messages.len()).expect("active"),
            1
        );
    }

    #[tokio::test]
    async fn updater_returning_none_is_noop() {
        let ctrl = controller();
        ctrl.new_chat("Chat", SessionSettings::default())
            .expect("new chat");

        let mutated = ctrl.update_current_session(|_| None);
        assert!(!mutated);
        // The active session survives a declined update.
        assert!(ctrl.active_session_id().is_some());
    }

    #[tokio::test]
    async fn select_chat_falls_back_to_degraded_summary() {
        let ctrl = controller();
        let id = ctrl
            .new_chat("Will lose row", SessionSettings::default())
            .expect("new chat");
        ctrl.update_current_session(|mut s| {
            s.messages.push(Message::user("hi"));
            Some(s)
        });

        // Simulate a fetch returning nothing while the summary survives.
        ctrl.store().delete_session(&id).expect("delete row");
        ctrl.select_chat(&id).expect("select");

        let active = ctrl.active_snapshot().expect("active");
        assert_eq!(active.id, id);
        assert!(active.messages.is_empty());
    }

    #[tokio::test]
    async fn select_unknown_chat_is_not_found() {
        let ctrl = controller();
        let err = ctrl.select_chat("chat_ghost");
        assert!(matches!(err, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn edit_session_background_persists_without_touching_active() {
        let ctrl = controller();
        let background = ctrl
            .new_chat("Background", SessionSettings::default())
            .expect("chat 1");
        let foreground = ctrl
            .new_chat("Foreground", SessionSettings::default())
            .expect("chat 2");
        assert!(ctrl.is_active(&foreground));

        let outcome = ctrl
            .edit_session(&background, |session| {
                session.messages.push(Message::model("late completion"));
            })
            .expect("edit");
        assert_eq!(outcome, EditOutcome::Background);

        // Active session untouched; durable copy updated.
        assert_eq!(ctrl.with_active(|s| s.messages.len()).expect("active"), 0);
        let stored = ctrl
            .store()
            .get_session(&background)
            .expect("get")
            .expect("present");
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].role, Role::Model);
    }

    #[tokio::test]
    async fn edit_session_missing_is_silent() {
        let ctrl = controller();
        let outcome = ctrl
            .edit_session("chat_ghost", |_| unreachable!("must not run"))
            .expect("edit");
        assert_eq!(outcome, EditOutcome::Missing);
    }

    #[tokio::test]
    async fn delete_chat_cascades_artifacts() {
        let ctrl = controller();
        let id = ctrl
            .new_chat("Doomed", SessionSettings::default())
            .expect("new chat");

        let mut message = Message::model("spoken reply");
        message.cached_audio_segments = Some(2);
        let message_id = message.id.clone();
        ctrl.update_current_session(|mut s| {
            s.messages.push(message.clone());
            Some(s)
        });
        ctrl.persist_active_now().expect("persist");

        let store = Arc::clone(ctrl.store());
        store
            .put_audio(&crate::audio::segment_key(&message_id, 0), b"a")
            .expect("audio 0");
        store
            .put_audio(&crate::audio::segment_key(&message_id, 1), b"b")
            .expect("audio 1");

        ctrl.delete_chat(&id).expect("delete");

        assert!(store.get_session(&id).expect("get").is_none());
        assert!(
            store
                .get_audio(&crate::audio::segment_key(&message_id, 0))
                .expect("get")
                .is_none()
        );
        assert!(ctrl.active_session_id().is_none());
        assert!(ctrl.summaries().iter().all(|s| s.id != id));
    }

    #[tokio::test]
    async fn restore_last_active_reselects() {
        let ctrl = controller();
        let id = ctrl
            .new_chat("Sticky", SessionSettings::default())
            .expect("new chat");
        *ctrl.lock_active() = None;

        assert!(ctrl.restore_last_active().expect("restore"));
        assert!(ctrl.is_active(&id));
    }
}
