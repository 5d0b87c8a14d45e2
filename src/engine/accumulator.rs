//! Collects stream events into a finished turn.
//!
//! The engine keeps two views while streaming: the raw accumulated text
//! (the server's view, filtered authoritatively at reconciliation) and
//! the provider-tagged thought text. Tool calls are inspected for the
//! memory-update call; anything else is ignored by this engine.

use crate::error::ProviderFailure;
use crate::provider::{FinishReason, StreamEvent};

/// Name of the tool the model calls to update the memory profile.
pub const MEMORY_TOOL_NAME: &str = "update_memory_profile";

/// A terminal view of one streamed response.
#[derive(Debug, Clone)]
pub struct FinishedTurn {
    /// Raw concatenated text deltas (hidden tags still embedded).
    pub text: String,
    /// Provider-tagged thought text.
    pub thoughts: String,
    /// New memory profile content, if the model called the memory tool.
    pub memory_update: Option<String>,
    /// `None` when the stream ended without a terminal marker; consumers
    /// treat that as implicit completion.
    pub finish: Option<FinishReason>,
    /// Mid-stream failure, if any.
    pub failure: Option<(ProviderFailure, String)>,
    /// Whether any event at all arrived.
    pub saw_any_event: bool,
}

/// Accumulates [`StreamEvent`]s for one request.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    text: String,
    thoughts: String,
    memory_update: Option<String>,
    finish: Option<FinishReason>,
    failure: Option<(ProviderFailure, String)>,
    saw_any_event: bool,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one event, in arrival order.
    pub fn push(&mut self, event: StreamEvent) {
        self.saw_any_event = true;
        match event {
            StreamEvent::Started { .. } => {}
            StreamEvent::TextDelta { text } => self.text.push_str(&text),
            StreamEvent::ThoughtDelta { text } => self.thoughts.push_str(&text),
            StreamEvent::ToolCall { name, arguments } => {
                if name == MEMORY_TOOL_NAME {
                    // {"content": "<new profile json>"}
                    if let Some(content) = arguments.get("content").and_then(|c| c.as_str()) {
                        self.memory_update = Some(content.to_owned());
                    }
                }
            }
            StreamEvent::Finished { reason } => self.finish = Some(reason),
            StreamEvent::Failed { failure, message } => {
                self.failure = Some((failure, message));
            }
        }
    }

    /// Raw text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consume the accumulator.
    pub fn finish(self) -> FinishedTurn {
        FinishedTurn {
            text: self.text,
            thoughts: self.thoughts,
            memory_update: self.memory_update,
            finish: self.finish,
            failure: self.failure,
            saw_any_event: self.saw_any_event,
        }
    }
}
