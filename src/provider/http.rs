//! HTTP streaming completion adapter.
//!
//! Speaks the widely-implemented OpenAI-compatible chat-completions
//! protocol (`POST {base}/chat/completions` with `stream: true`) and
//! normalizes its SSE output into [`StreamEvent`]s. Provider failures are
//! classified into [`ProviderFailure`] for user messaging.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use super::sse::SseDecoder;
use super::{
    CompletionProvider, CompletionRequest, EventStream, FinishReason, ProviderTurn, StreamEvent,
    ToolDeclaration, TurnRole,
};
use crate::error::{EngineError, ProviderFailure, Result};
use crate::session::types::AttachmentData;

/// Configuration for the HTTP completion adapter.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub api_key: String,
    /// Base URL up to and including the API root (no trailing slash).
    pub base_url: String,
}

impl HttpProviderConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}

/// OpenAI-compatible streaming completion provider.
pub struct HttpCompletionProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpCompletionProvider {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &str {
        "http-completions"
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<EventStream> {
        let body = build_request_body(request);
        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EngineError::provider(
                    ProviderFailure::NetworkTransient,
                    format!("request failed: {e}"),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let kind = ProviderFailure::from_http(status.as_u16(), &body_text);
            return Err(EngineError::provider(
                kind,
                format!("HTTP {status}: {body_text}"),
            ));
        }

        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("req")
            .to_owned();
        debug!(request = %request_id, model = %request.model, "completion stream opened");

        Ok(Box::pin(decode_event_stream(
            response.bytes_stream(),
            request_id,
        )))
    }
}

/// Build the JSON request body.
fn build_request_body(request: &CompletionRequest) -> serde_json::Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system_instruction {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    for turn in &request.turns {
        messages.push(turn_to_json(turn));
    }

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
    });
    if let Some(obj) = body.as_object_mut() {
        if let Some(seed) = request.seed {
            obj.insert("seed".into(), serde_json::json!(seed));
        }
        if let Some(temperature) = request.temperature {
            obj.insert("temperature".into(), serde_json::json!(temperature));
        }
        if !request.tools.is_empty() {
            obj.insert("tools".into(), tools_to_json(&request.tools));
        }
    }
    body
}

fn turn_to_json(turn: &ProviderTurn) -> serde_json::Value {
    let role = match turn.role {
        TurnRole::User => "user",
        TurnRole::Assistant => "assistant",
    };

    if turn.attachments.is_empty() {
        return serde_json::json!({"role": role, "content": turn.text});
    }

    // Attachments become a multi-part content array: text first, then one
    // image/data part per attachment.
    let mut parts = vec![serde_json::json!({"type": "text", "text": turn.text})];
    for attachment in &turn.attachments {
        let url = match &attachment.data {
            AttachmentData::Inline { base64 } => {
                format!("data:{};base64,{}", attachment.mime_type, base64)
            }
            AttachmentData::Remote { uri } => uri.clone(),
        };
        parts.push(serde_json::json!({
            "type": "image_url",
            "image_url": {"url": url},
        }));
    }
    serde_json::json!({"role": role, "content": parts})
}

fn tools_to_json(tools: &[ToolDeclaration]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = tools
        .iter()
        .map(|tool| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                },
            })
        })
        .collect();
    serde_json::Value::Array(entries)
}

/// In-flight tool call, assembled from argument fragments.
#[derive(Debug, Default)]
struct PendingToolCall {
    name: String,
    arguments: String,
}

/// Decode a response byte stream into normalized events.
///
/// Tool-call argument fragments accumulate across chunks and are emitted
/// as complete [`StreamEvent::ToolCall`]s before the terminal event.
fn decode_event_stream(
    bytes: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    request_id: String,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    async_stream::stream! {
        yield StreamEvent::Started { request_id };

        let mut decoder = SseDecoder::new();
        // Indexed map keeps parallel tool calls in declaration order.
        let mut pending_tools: BTreeMap<u64, PendingToolCall> = BTreeMap::new();
        let mut finish: Option<FinishReason> = None;
        let mut saw_done = false;
        let mut bytes = std::pin::pin!(bytes);

        'outer: while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield StreamEvent::Failed {
                        failure: ProviderFailure::NetworkTransient,
                        message: format!("stream interrupted: {e}"),
                    };
                    return;
                }
            };

            for frame in decoder.feed(&chunk) {
                if frame.is_done() {
                    saw_done = true;
                    break 'outer;
                }
                for event in parse_data_frame(&frame.data, &mut pending_tools, &mut finish) {
                    yield event;
                }
            }
        }

        // A stream cut off mid-frame still surrenders its buffered tail.
        if !saw_done
            && let Some(frame) = decoder.finish()
            && !frame.is_done()
        {
            for event in parse_data_frame(&frame.data, &mut pending_tools, &mut finish) {
                yield event;
            }
        }

        for event in drain_tool_calls(&mut pending_tools) {
            yield event;
        }
        if let Some(reason) = finish {
            yield StreamEvent::Finished { reason };
        }
        // A stream that ends without a finish_reason or [DONE] simply
        // terminates here; the consumer treats end-of-sequence as
        // implicit completion.
    }
}

/// Parse one SSE `data:` payload into events.
fn parse_data_frame(
    data: &str,
    pending_tools: &mut BTreeMap<u64, PendingToolCall>,
    finish: &mut Option<FinishReason>,
) -> Vec<StreamEvent> {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
        warn!("skipping unparseable stream chunk");
        return Vec::new();
    };

    let mut events = Vec::new();
    let Some(choices) = parsed.get("choices").and_then(|c| c.as_array()) else {
        return events;
    };

    for choice in choices {
        let Some(delta) = choice.get("delta") else {
            continue;
        };

        if let Some(text) = delta.get("content").and_then(|c| c.as_str())
            && !text.is_empty()
        {
            events.push(StreamEvent::TextDelta { text: text.to_owned() });
        }

        // Reasoning-capable backends stream thoughts under a separate key.
        if let Some(text) = delta.get("reasoning_content").and_then(|c| c.as_str())
            && !text.is_empty()
        {
            events.push(StreamEvent::ThoughtDelta { text: text.to_owned() });
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for call in tool_calls {
                let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let entry = pending_tools.entry(index).or_default();
                if let Some(name) = call
                    .pointer("/function/name")
                    .and_then(|n| n.as_str())
                    .filter(|n| !n.is_empty())
                {
                    entry.name = name.to_owned();
                }
                if let Some(fragment) = call.pointer("/function/arguments").and_then(|a| a.as_str())
                {
                    entry.arguments.push_str(fragment);
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            *finish = Some(map_finish_reason(reason));
        }
    }

    events
}

/// Emit accumulated tool calls as complete events.
fn drain_tool_calls(pending_tools: &mut BTreeMap<u64, PendingToolCall>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for (_, call) in std::mem::take(pending_tools) {
        if call.name.is_empty() {
            continue;
        }
        let arguments = if call.arguments.is_empty() {
            serde_json::Value::Null
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(value) => value,
                Err(_) => {
                    warn!(tool = %call.name, "discarding tool call with malformed arguments");
                    continue;
                }
            }
        };
        events.push(StreamEvent::ToolCall {
            name: call.name,
            arguments,
        });
    }
    events
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        // Tool-call stops still end the turn normally for this engine.
        "stop" | "tool_calls" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::Attachment;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "sonnet-local".into(),
            system_instruction: Some("Be brief.".into()),
            turns: vec![
                ProviderTurn::user("Hello"),
                ProviderTurn::assistant("Hi!"),
                ProviderTurn::user("Tell me more"),
            ],
            seed: Some(1234),
            temperature: Some(0.8),
            tools: Vec::new(),
        }
    }

    #[test]
    fn body_includes_system_and_turns_in_order() {
        let body = build_request_body(&request());
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(body["stream"], true);
        assert_eq!(body["seed"], 1234);
    }

    #[test]
    fn body_omits_absent_options() {
        let mut req = request();
        req.seed = None;
        req.temperature = None;
        req.system_instruction = None;
        let body = build_request_body(&req);
        assert!(body.get("seed").is_none());
        assert!(body.get("temperature").is_none());
        assert_eq!(body["messages"].as_array().expect("messages").len(), 3);
    }

    #[test]
    fn inline_attachment_becomes_data_uri() {
        let mut turn = ProviderTurn::user("look at this");
        turn.attachments.push(Attachment {
            name: "pic.png".into(),
            mime_type: "image/png".into(),
            data: AttachmentData::Inline {
                base64: "QUJD".into(),
            },
        });
        let json = turn_to_json(&turn);
        let parts = json["content"].as_array().expect("parts");
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/png;base64,QUJD"
        );
    }

    #[test]
    fn tool_declarations_wrap_as_functions() {
        let tools = [ToolDeclaration {
            name: "update".into(),
            description: "desc".into(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let json = tools_to_json(&tools);
        assert_eq!(json[0]["type"], "function");
        assert_eq!(json[0]["function"]["name"], "update");
    }

    #[test]
    fn parse_text_delta() {
        let mut tools = BTreeMap::new();
        let mut finish = None;
        let events = parse_data_frame(
            r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
            &mut tools,
            &mut finish,
        );
        assert_eq!(events, vec![StreamEvent::TextDelta { text: "Hi".into() }]);
        assert!(finish.is_none());
    }

    #[test]
    fn parse_reasoning_delta() {
        let mut tools = BTreeMap::new();
        let mut finish = None;
        let events = parse_data_frame(
            r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#,
            &mut tools,
            &mut finish,
        );
        assert_eq!(
            events,
            vec![StreamEvent::ThoughtDelta { text: "hmm".into() }]
        );
    }

    #[test]
    fn parse_finish_reason() {
        let mut tools = BTreeMap::new();
        let mut finish = None;
        let events = parse_data_frame(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            &mut tools,
            &mut finish,
        );
        assert!(events.is_empty());
        assert_eq!(finish, Some(FinishReason::Stop));
    }

    #[test]
    fn tool_call_fragments_assemble() {
        let mut tools = BTreeMap::new();
        let mut finish = None;
        parse_data_frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"update_memory_profile","arguments":"{\"content\":"}}]}}]}"#,
            &mut tools,
            &mut finish,
        );
        parse_data_frame(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"{}\"}"}}]}}]}"#,
            &mut tools,
            &mut finish,
        );

        let events = drain_tool_calls(&mut tools);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCall { name, arguments } => {
                assert_eq!(name, "update_memory_profile");
                assert_eq!(arguments["content"], "{}");
            }
            other => unreachable!("expected tool call, got {other:?}"),
        }
        assert!(tools.is_empty());
    }

    #[test]
    fn malformed_tool_arguments_are_discarded() {
        let mut tools = BTreeMap::new();
        tools.insert(
            0,
            PendingToolCall {
                name: "broken".into(),
                arguments: "{not json".into(),
            },
        );
        assert!(drain_tool_calls(&mut tools).is_empty());
    }

    #[test]
    fn unparseable_chunk_yields_nothing() {
        let mut tools = BTreeMap::new();
        let mut finish = None;
        assert!(parse_data_frame("garbage", &mut tools, &mut finish).is_empty());
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), FinishReason::Stop);
        assert_eq!(map_finish_reason("tool_calls"), FinishReason::Stop);
        assert_eq!(map_finish_reason("length"), FinishReason::Length);
        assert_eq!(
            map_finish_reason("content_filter"),
            FinishReason::ContentFilter
        );
        assert_eq!(map_finish_reason("weird"), FinishReason::Other);
    }

}
