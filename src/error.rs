//! Error types for the conversation engine.

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Classification of a failed generation request.
///
/// The taxonomy exists purely for user messaging: no variant is retried
/// automatically. Retry, if any, is a user-initiated regeneration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFailure {
    /// Connection reset, timeout, 5xx; likely to succeed on a later attempt.
    NetworkTransient,
    /// Rate limit or quota exhausted (429).
    QuotaExceeded,
    /// The provider refused the content on safety grounds.
    SafetyBlocked,
    /// Missing, malformed, or rejected API credential (401/403).
    InvalidCredential,
    /// Anything the classifier could not place.
    Unknown,
}

impl ProviderFailure {
    /// Classify an HTTP error response from the provider.
    pub fn from_http(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::InvalidCredential,
            429 => Self::QuotaExceeded,
            408 | 500..=599 => Self::NetworkTransient,
            400 => {
                let lower = body.to_ascii_lowercase();
                if lower.contains("safety") || lower.contains("content_filter") {
                    Self::SafetyBlocked
                } else {
                    Self::Unknown
                }
            }
            _ => Self::Unknown,
        }
    }

    /// The message shown inline where the answer would have appeared.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NetworkTransient => {
                "The connection to the model was interrupted. You can regenerate this reply."
            }
            Self::QuotaExceeded => {
                "The model's usage quota is exhausted. Wait a little and regenerate this reply."
            }
            Self::SafetyBlocked => {
                "The model declined to answer this request. Try rephrasing the message."
            }
            Self::InvalidCredential => {
                "The API key was rejected. Check the key in your settings and try again."
            }
            Self::Unknown => "Something went wrong while generating this reply.",
        }
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkTransient => write!(f, "network_transient"),
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
            Self::SafetyBlocked => write!(f, "safety_blocked"),
            Self::InvalidCredential => write!(f, "invalid_credential"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Top-level error type for the conversation engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Durable store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Generation request failure, classified for user messaging.
    #[error("provider error ({kind}): {message}")]
    Provider {
        kind: ProviderFailure,
        message: String,
    },

    /// Speech synthesis failure.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Embedding computation failure.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// A derived-cache claim did not hold (e.g. watermark without blobs).
    /// Callers self-heal by treating the claim as a miss, never by crashing.
    #[error("cache inconsistency: {0}")]
    CacheInconsistency(String),

    /// Operating on an id no longer present. Concurrent deletion races are
    /// expected in an optimistic single-user client; most call sites treat
    /// this as a silent no-op.
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration load or parse error.
    #[error("config error: {0}")]
    Config(String),

    /// A bounded wait gave up (remote media processing, stream stall).
    #[error("timed out: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Build a provider error from a classified failure.
    pub fn provider(kind: ProviderFailure, message: impl Into<String>) -> Self {
        Self::Provider {
            kind,
            message: message.into(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
