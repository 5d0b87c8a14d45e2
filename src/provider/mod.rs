//! Streaming completion provider boundary.
//!
//! The engine treats the vendor API as an opaque capability: given a
//! model, mapped turn history, and settings, a provider yields an async
//! sequence of [`StreamEvent`]s. Streams may end without an explicit
//! terminal marker; consumers treat end-of-sequence as implicit
//! completion, synthesizing the final response from accumulated deltas.

pub mod http;
pub mod media;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderFailure, Result};
use crate::session::types::Attachment;

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop.
    Stop,
    /// Hit the max token limit.
    Length,
    /// Content was filtered by safety systems.
    ContentFilter,
    /// Provider-specific or unknown reason.
    Other,
}

/// A normalized streaming event from any completion provider.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Stream opened; first event when the provider emits one.
    Started { request_id: String },
    /// A chunk of ordinary answer text.
    TextDelta { text: String },
    /// A chunk of distinguished "thought" (hidden reasoning) text.
    ThoughtDelta { text: String },
    /// A completed tool/function invocation descriptor.
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    /// Stream ended normally.
    Finished { reason: FinishReason },
    /// Stream failed mid-flight, classified for user messaging.
    Failed {
        failure: ProviderFailure,
        message: String,
    },
}

/// A boxed stream of normalized events.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// The speaker of a turn in the provider's format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One turn of history mapped into the provider's format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTurn {
    pub role: TurnRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ProviderTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            attachments: Vec::new(),
        }
    }
}

/// A tool made available to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool parameters.
    pub parameters: serde_json::Value,
}

/// One outbound generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    pub turns: Vec<ProviderTurn>,
    /// Decided once per request; recorded on the resulting message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,
}

/// Trait for streaming completion providers.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Issue one generation request and stream its incremental output.
    ///
    /// # Errors
    ///
    /// Fails if the request cannot be issued at all; failures after the
    /// stream opens arrive as [`StreamEvent::Failed`].
    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    struct SingleLineProvider;

    #[async_trait]
    impl CompletionProvider for SingleLineProvider {
        fn name(&self) -> &str {
            "single-line"
        }

        async fn stream(&self, _request: &CompletionRequest) -> Result<EventStream> {
            let events = vec![
                StreamEvent::TextDelta { text: "hi".into() },
                StreamEvent::Finished {
                    reason: FinishReason::Stop,
                },
            ];
            Ok(Box::pin(futures_util::stream::iter(events)))
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "test".into(),
            system_instruction: None,
            turns: vec![ProviderTurn::user("hello")],
            seed: Some(7),
            temperature: None,
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn provider_trait_is_object_safe() {
        let provider: Box<dyn CompletionProvider> = Box::new(SingleLineProvider);
        let mut stream = provider.stream(&request()).await.expect("stream");
        let first = stream.next().await;
        assert_eq!(
            first,
            Some(StreamEvent::TextDelta { text: "hi".into() })
        );
    }

    #[test]
    fn finish_reason_serde_is_snake_case() {
        let json = serde_json::to_string(&FinishReason::ContentFilter).expect("serialize");
        assert_eq!(json, "\"content_filter\"");
    }

    #[test]
    fn request_serde_omits_empty_fields() {
        let json = serde_json::to_string(&request()).expect("serialize");
        assert!(!json.contains("tools"));
        assert!(!json.contains("system_instruction"));
        assert!(json.contains("\"seed\":7"));
    }
}
