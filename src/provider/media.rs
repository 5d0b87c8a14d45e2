//! Remote attachment processing.
//!
//! Large attachments are uploaded to provider-side storage and referenced
//! by URI. After upload the provider processes the file asynchronously;
//! [`await_active`] polls the processing state with a bounded retry count
//! and fixed backoff, surfacing a hard timeout as an error rather than
//! hanging forever.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PollPolicy;
use crate::error::{EngineError, Result};

/// Server-side processing state of an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaState {
    /// Still being processed; not yet usable in a request.
    Processing,
    /// Ready for use.
    Active,
    /// Processing failed server-side.
    Failed(String),
}

/// Provider-side attachment storage boundary.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Upload bytes, returning the remote URI to reference in requests.
    async fn upload(&self, name: &str, mime_type: &str, bytes: &[u8]) -> Result<String>;

    /// Current processing state of an uploaded attachment.
    async fn state(&self, uri: &str) -> Result<MediaState>;
}

/// Poll until the attachment is active.
///
/// # Errors
///
/// `Timeout` once the attempt budget or the hard deadline is exhausted;
/// the server-side failure message if processing failed.
pub async fn await_active(
    processor: &dyn MediaProcessor,
    uri: &str,
    policy: &PollPolicy,
) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(policy.timeout_secs);

    for attempt in 0..policy.max_attempts {
        match processor.state(uri).await? {
            MediaState::Active => {
                debug!(uri, attempt, "remote attachment active");
                return Ok(());
            }
            MediaState::Failed(reason) => {
                return Err(EngineError::Provider {
                    kind: crate::error::ProviderFailure::Unknown,
                    message: format!("attachment processing failed: {reason}"),
                });
            }
            MediaState::Processing => {}
        }

        if Instant::now() + Duration::from_millis(policy.backoff_ms) > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(policy.backoff_ms)).await;
    }

    Err(EngineError::Timeout(format!(
        "attachment {uri} not active after {} attempts",
        policy.max_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Becomes active after a fixed number of state polls.
    struct EventuallyActive {
        polls_until_active: u32,
        polls: AtomicU32,
    }

    impl EventuallyActive {
        fn new(polls_until_active: u32) -> Self {
            Self {
                polls_until_active,
                polls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MediaProcessor for EventuallyActive {
        async fn upload(&self, _name: &str, _mime: &str, _bytes: &[u8]) -> Result<String> {
            Ok("remote://file-1".into())
        }

        async fn state(&self, _uri: &str) -> Result<MediaState> {
            let seen = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.polls_until_active {
                Ok(MediaState::Active)
            } else {
                Ok(MediaState::Processing)
            }
        }
    }

    struct AlwaysFailed;

    #[async_trait]
    impl MediaProcessor for AlwaysFailed {
        async fn upload(&self, _name: &str, _mime: &str, _bytes: &[u8]) -> Result<String> {
            Ok("remote://broken".into())
        }

        async fn state(&self, _uri: &str) -> Result<MediaState> {
            Ok(MediaState::Failed("virus scan rejected".into()))
        }
    }

    fn fast_policy(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            max_attempts,
            backoff_ms: 10,
            timeout_secs: 5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_once_active() {
        let processor = EventuallyActive::new(3);
        await_active(&processor, "remote://file-1", &fast_policy(10))
            .await
            .expect("active");
        assert_eq!(processor.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempt_budget() {
        let processor = EventuallyActive::new(100);
        let err = await_active(&processor, "remote://file-1", &fast_policy(4)).await;
        assert!(matches!(err, Err(EngineError::Timeout(_))));
        assert_eq!(processor.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn server_failure_surfaces_immediately() {
        let err = await_active(&AlwaysFailed, "remote://broken", &fast_policy(10)).await;
        match err {
            Err(EngineError::Provider { message, .. }) => {
                assert!(message.contains("virus scan rejected"));
            }
            other => unreachable!("expected provider error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hard_deadline_stops_polling_early() {
        let processor = EventuallyActive::new(u32::MAX);
        let policy = PollPolicy {
            max_attempts: 1_000,
            backoff_ms: 500,
            timeout_secs: 2,
        };
        let err = await_active(&processor, "remote://file-1", &policy).await;
        assert!(matches!(err, Err(EngineError::Timeout(_))));
        // Far fewer polls than the attempt budget.
        assert!(processor.polls.load(Ordering::SeqCst) < 10);
    }
}
