//! Request lifecycle guards.
//!
//! One in-flight request context per session carries everything a
//! generation request needs to terminate cleanly: its cancellation
//! token, the pending placeholder id, a pre-captured snapshot of the
//! message being regenerated, and the idempotent-completion flags. The
//! registry is keyed by session id, so a request for one conversation
//! can never clobber another's state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::types::{Message, MessageId, SessionId};

/// Shared flags of one in-flight request.
#[derive(Debug)]
struct RequestState {
    request_id: String,
    placeholder_id: MessageId,
    cancel: CancellationToken,
    /// Set by user cancellation; consulted by every callback before it
    /// touches shared state, so a late success cannot resurrect content.
    user_cancelled: Arc<AtomicBool>,
    /// Set once a terminal handler has claimed this request.
    handled: Arc<AtomicBool>,
    /// Pre-regeneration message, restored verbatim on empty abort.
    snapshot: Option<Message>,
}

/// Caller-facing handle for one request.
#[derive(Debug, Clone)]
pub struct RequestTicket {
    pub session_id: SessionId,
    pub request_id: String,
    pub placeholder_id: MessageId,
    pub cancel: CancellationToken,
    user_cancelled: Arc<AtomicBool>,
    handled: Arc<AtomicBool>,
}

impl RequestTicket {
    /// Whether the user cancelled this request.
    pub fn was_cancelled(&self) -> bool {
        self.user_cancelled.load(Ordering::SeqCst)
    }

    /// Claim terminal handling. Returns `false` if another path already
    /// handled this request (late-arriving callback protection).
    pub fn claim_terminal(&self) -> bool {
        !self.handled.swap(true, Ordering::SeqCst)
    }

    /// Whether any terminal path ran.
    pub fn was_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }
}

/// Registry of in-flight requests, one slot per session.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    inner: Mutex<HashMap<SessionId, RequestState>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a request for a session, claiming its slot.
    ///
    /// Any request still occupying the slot is cancelled and replaced: a
    /// later request claims the pending id.
    pub fn begin(
        &self,
        session_id: &str,
        placeholder_id: &str,
        snapshot: Option<Message>,
    ) -> RequestTicket {
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        let state = RequestState {
            request_id: request_id.clone(),
            placeholder_id: placeholder_id.to_owned(),
            cancel: CancellationToken::new(),
            user_cancelled: Arc::new(AtomicBool::new(false)),
            handled: Arc::new(AtomicBool::new(false)),
            snapshot,
        };
        let ticket = RequestTicket {
            session_id: session_id.to_owned(),
            request_id,
            placeholder_id: placeholder_id.to_owned(),
            cancel: state.cancel.clone(),
            user_cancelled: Arc::clone(&state.user_cancelled),
            handled: Arc::clone(&state.handled),
        };

        let mut inner = self.lock();
        if let Some(previous) = inner.insert(session_id.to_owned(), state) {
            previous.cancel.cancel();
        }
        ticket
    }

    /// User-initiated cancellation of a session's outstanding request.
    /// Returns whether there was one.
    pub fn cancel(&self, session_id: &str) -> bool {
        let inner = self.lock();
        match inner.get(session_id) {
            Some(state) => {
                state.user_cancelled.store(true, Ordering::SeqCst);
                state.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// The placeholder id of the session's outstanding request, if any.
    pub fn pending_placeholder(&self, session_id: &str) -> Option<MessageId> {
        self.lock()
            .get(session_id)
            .map(|state| state.placeholder_id.clone())
    }

    /// Take the pre-regeneration snapshot held for this request.
    pub fn take_snapshot(&self, ticket: &RequestTicket) -> Option<Message> {
        let mut inner = self.lock();
        let state = inner.get_mut(ticket.session_id.as_str())?;
        if state.request_id != ticket.request_id {
            return None;
        }
        state.snapshot.take()
    }

    /// Finalizer: release the session slot, but only if this request
    /// still owns it; a later request may have already claimed it.
    pub fn finish(&self, ticket: &RequestTicket) {
        let mut inner = self.lock();
        let owned = inner
            .get(ticket.session_id.as_str())
            .is_some_and(|state| state.request_id == ticket.request_id);
        if owned {
            inner.remove(ticket.session_id.as_str());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, RequestState>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
