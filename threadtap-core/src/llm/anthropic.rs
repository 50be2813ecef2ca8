//! Anthropic messages dialect.
//!
//! Streaming events are typed objects with a subtype tag; text arrives in
//! `content_block_delta` events carrying a `text_delta`. Tool use is
//! signaled by a distinguished stop reason plus typed content blocks, and
//! tool results travel back as one user turn bundling `tool_result`
//! blocks. System text never appears in the turn list; it is lifted to a
//! dedicated request field.

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::sse;
use super::{
    ChatMessage, ChatRole, Completion, MessageContent, Provider, TextStream, ToolCall, ToolDecl,
    ToolResult, tool_arguments_as_object, truncated,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

pub const BACKEND: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

impl AnthropicProvider {
    pub fn new(api_key: String, config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    fn request_payload(&self, messages: &[ChatMessage], tools: &[ToolDecl], stream: bool) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut wire: Vec<Value> = Vec::new();
        for message in messages {
            match message.role {
                ChatRole::System => {
                    if let Some(text) = message.content.as_text() {
                        system_parts.push(text.to_string());
                    }
                }
                ChatRole::User | ChatRole::Assistant => {
                    wire.push(json!({
                        "role": message.role.as_str(),
                        "content": wire_content(message),
                    }));
                }
                // Normalized tool turns become user-side result blocks.
                ChatRole::Tool => {
                    wire.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                            "content": message.content.to_wire_string(),
                        }],
                    }));
                }
            }
        }
        let mut payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": wire,
            "stream": stream,
        });
        if !system_parts.is_empty() {
            payload["system"] = json!(system_parts.join("\n\n"));
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.parameters,
                        })
                    })
                    .collect(),
            );
        }
        payload
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(payload)
            .send()
            .await
            .map_err(|err| ProviderError::Network {
                backend: BACKEND,
                message: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|err| err.to_string());
            return Err(ProviderError::Status {
                backend: BACKEND,
                status: status.as_u16(),
                message: truncated(&body),
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn supports_tool_calls(&self) -> bool {
        true
    }

    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<TextStream, ProviderError> {
        let payload = self.request_payload(messages, &[], true);
        let response = self.send(&payload).await?;
        let bytes = response.bytes_stream().map_err(|err| ProviderError::Network {
            backend: BACKEND,
            message: err.to_string(),
        });
        Ok(decode_anthropic_stream(bytes))
    }

    async fn completion_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDecl],
    ) -> Result<Completion, ProviderError> {
        let payload = self.request_payload(messages, tools, false);
        let response = self.send(&payload).await?;
        let value: Value = response.json().await.map_err(|err| ProviderError::Decode {
            backend: BACKEND,
            message: err.to_string(),
        })?;
        parse_completion(&value)
    }

    fn format_tool_result_messages(
        &self,
        calls: &[ToolCall],
        results: &[ToolResult],
    ) -> Vec<ChatMessage> {
        let call_blocks = calls
            .iter()
            .map(|call| {
                json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": tool_arguments_as_object(&call.arguments),
                })
            })
            .collect();
        let result_blocks = results
            .iter()
            .map(|result| {
                json!({
                    "type": "tool_result",
                    "tool_use_id": result.call_id,
                    "content": result.content,
                })
            })
            .collect();
        vec![
            ChatMessage::assistant_blocks(call_blocks),
            ChatMessage::user_blocks(result_blocks),
        ]
    }
}

fn wire_content(message: &ChatMessage) -> Value {
    let mut blocks: Vec<Value> = match &message.content {
        MessageContent::Text(text) if text.is_empty() => Vec::new(),
        MessageContent::Text(text) => vec![json!({"type": "text", "text": text})],
        MessageContent::Blocks(blocks) => blocks.clone(),
    };
    if let Some(calls) = &message.tool_calls {
        blocks.extend(calls.iter().map(|call| {
            json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": tool_arguments_as_object(&call.arguments),
            })
        }));
    }
    Value::Array(blocks)
}

fn parse_completion(value: &Value) -> Result<Completion, ProviderError> {
    let content = value
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Decode {
            backend: BACKEND,
            message: "response held no content blocks".to_string(),
        })?;
    let mut text_parts: Vec<&str> = Vec::new();
    let mut calls: Vec<ToolCall> = Vec::new();
    for (index, block) in content.iter().enumerate() {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => {
                let Some(name) = block.get("name").and_then(Value::as_str) else {
                    continue;
                };
                calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .map_or_else(|| format!("toolu_{index}"), str::to_string),
                    name: name.to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            _ => {}
        }
    }
    if value.get("stop_reason").and_then(Value::as_str) == Some("tool_use") && !calls.is_empty() {
        return Ok(Completion::ToolCalls(calls));
    }
    Ok(Completion::Text(text_parts.concat()))
}

/// Event subtypes the text decoder cares about; everything else lands in
/// `Unknown` and is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    ContentBlockDelta { delta: WireDelta },
    MessageStop,
    Error { error: WireError },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Decodes one streamed completion into text fragments.
///
/// The stream ends at `message_stop`. A mid-stream `error` event aborts
/// with a provider error; events that fail to parse are logged and
/// skipped.
pub(crate) fn decode_anthropic_stream<S>(source: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, ProviderError>> + Send + Unpin + 'static,
{
    let stream = try_stream! {
        let mut source = source;
        let mut buffer = String::new();
        let mut stopped = false;
        while let Some(chunk) = source.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some((split, delimiter)) = sse::find_event_boundary(&buffer) {
                let event: String = buffer.drain(..split + delimiter).collect();
                let Some(payload) = sse::data_payload(&event) else {
                    continue;
                };
                let parsed: WireEvent = match serde_json::from_str(&payload) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!(error = %err, "skipping malformed stream event");
                        continue;
                    }
                };
                match parsed {
                    WireEvent::ContentBlockDelta {
                        delta: WireDelta::TextDelta { text },
                    } => {
                        if !text.is_empty() {
                            yield text;
                        }
                    }
                    WireEvent::ContentBlockDelta { .. } => {}
                    WireEvent::MessageStop => {
                        stopped = true;
                    }
                    WireEvent::Error { error } => {
                        Err(ProviderError::Decode {
                            backend: BACKEND,
                            message: format!("{} ({})", error.message, error.kind),
                        })?;
                    }
                    WireEvent::Unknown => {}
                }
                if stopped {
                    break;
                }
            }
            if stopped {
                break;
            }
        }
    };
    Box::pin(stream)
}
