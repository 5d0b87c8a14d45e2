//! Debounced message-array persistence.
//!
//! Rapid successive stream updates must not each trigger a disk write.
//! [`DebouncedWriter`] coalesces writes per session with a trailing
//! debounce: scheduling cancels and reschedules the single pending timer
//! for that session, so only the latest snapshot is ever written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::session::types::Message;
use crate::store::{ChatStore, StoreError};

/// Destination of debounced message writes.
///
/// A seam for tests; production uses [`ChatStore`].
pub trait MessageSink: Send + Sync + 'static {
    fn write_messages(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError>;
}

impl MessageSink for ChatStore {
    fn write_messages(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.update_messages(session_id, messages)
    }
}

/// Trailing-debounce writer, one pending timer per session.
pub struct DebouncedWriter {
    sink: Arc<dyn MessageSink>,
    interval: Duration,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DebouncedWriter {
    pub fn new(sink: Arc<dyn MessageSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule a write of `messages` for `session_id` after the debounce
    /// interval. Cancels and replaces any write already pending for the
    /// same session (cancel-and-reschedule, not queue-and-flush-all).
    pub fn schedule(&self, session_id: &str, messages: Vec<Message>) {
        let sink = Arc::clone(&self.sink);
        let interval = self.interval;
        let id = session_id.to_owned();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Err(e) = sink.write_messages(&id, &messages) {
                // The optimistic in-memory update is not rolled back; the
                // failure is surfaced so the user knows to retry a save.
                warn!(session = %id, error = %e, "debounced message write failed");
            }
        });

        let mut pending = self.lock_pending();
        if let Some(previous) = pending.insert(session_id.to_owned(), handle) {
            previous.abort();
        }
    }

    /// Write immediately, cancelling any pending debounce for the session.
    pub fn flush(&self, session_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.cancel(session_id);
        self.sink.write_messages(session_id, messages)
    }

    /// Drop any pending write for the session without persisting.
    pub fn cancel(&self, session_id: &str) {
        if let Some(handle) = self.lock_pending().remove(session_id) {
            handle.abort();
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
