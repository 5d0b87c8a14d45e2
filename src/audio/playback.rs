//! The "currently playing audio" slot.
//!
//! At most one audio source is alive at a time. Starting new playback
//! stops (not pauses) any prior playback and releases its token first.
//! The actual output device lives in the rendering layer; this slot owns
//! the lifecycle so deletion and regeneration can stop playback that
//! belongs to a message being removed.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::session::types::MessageId;

/// The playback in progress.
#[derive(Debug, Clone)]
struct ActivePlayback {
    message_id: MessageId,
    part: u32,
    token: CancellationToken,
}

/// Single mutable slot holding the active playback, if any.
#[derive(Debug, Default)]
pub struct PlaybackSlot {
    current: Mutex<Option<ActivePlayback>>,
}

impl PlaybackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin playback of one segment, stopping whatever was playing.
    ///
    /// Returns the token the audio sink should observe; when it fires the
    /// sink must release its resources.
    pub fn begin(&self, message_id: &str, part: u32) -> CancellationToken {
        let token = CancellationToken::new();
        let mut current = self.lock();
        if let Some(previous) = current.take() {
            previous.token.cancel();
        }
        *current = Some(ActivePlayback {
            message_id: message_id.to_owned(),
            part,
            token: token.clone(),
        });
        token
    }

    /// Stop playback, if any.
    pub fn stop(&self) {
        if let Some(active) = self.lock().take() {
            active.token.cancel();
        }
    }

    /// Stop playback if it belongs to one of the given messages.
    pub fn stop_if_owned_by<'a>(&self, message_ids: impl IntoIterator<Item = &'a str>) {
        let mut current = self.lock();
        let Some(active) = current.as_ref() else {
            return;
        };
        let owned = message_ids
            .into_iter()
            .any(|id| id == active.message_id);
        if owned
            && let Some(active) = current.take()
        {
            active.token.cancel();
        }
    }

    /// The message currently playing, if any.
    pub fn playing_message(&self) -> Option<(MessageId, u32)> {
        self.lock()
            .as_ref()
            .map(|active| (active.message_id.clone(), active.part))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActivePlayback>> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
