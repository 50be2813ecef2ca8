//! OpenAI-compatible chat-completions dialect.
//!
//! Streaming arrives as `data:`-prefixed events closed by a `[DONE]`
//! sentinel. Tool calls come back as a list on the completion message with
//! JSON-encoded string arguments, and tool results go back as one
//! tool-role turn per result.

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::{Value, json};
use tracing::debug;

use super::sse;
use super::{
    ChatMessage, ChatRole, Completion, Provider, TextStream, ToolCall, ToolDecl, ToolResult,
    tool_arguments_as_string, truncated,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

pub const BACKEND: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiProvider {
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
        let mut payload = json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "stream": stream,
            "max_completion_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.iter().map(wire_tool).collect());
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
impl Provider for OpenAiProvider {
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
        Ok(decode_openai_stream(bytes))
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
        let mut messages = vec![ChatMessage::assistant_with_calls(calls.to_vec())];
        messages.extend(
            results
                .iter()
                .map(|result| ChatMessage::tool_response(&result.call_id, &result.content)),
        );
        messages
    }
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages.iter().filter_map(wire_message).collect()
}

fn wire_message(message: &ChatMessage) -> Option<Value> {
    let mut wire = json!({
        "role": message.role.as_str(),
        "content": message.content.to_wire_string(),
    });
    if let Some(calls) = &message.tool_calls {
        wire["tool_calls"] = Value::Array(
            calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": tool_arguments_as_string(&call.arguments),
                        },
                    })
                })
                .collect(),
        );
    }
    if message.role == ChatRole::Tool {
        match &message.tool_call_id {
            Some(id) => wire["tool_call_id"] = json!(id),
            None => {
                debug!("dropping tool message without a call id");
                return None;
            }
        }
    }
    Some(wire)
}

fn wire_tool(tool: &ToolDecl) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

fn parse_completion(value: &Value) -> Result<Completion, ProviderError> {
    let message = value
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::Decode {
            backend: BACKEND,
            message: "response held no completion message".to_string(),
        })?;
    if let Some(raw_calls) = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .filter(|calls| !calls.is_empty())
    {
        let calls: Vec<ToolCall> = raw_calls
            .iter()
            .enumerate()
            .filter_map(|(index, call)| parse_tool_call(index, call))
            .collect();
        if !calls.is_empty() {
            return Ok(Completion::ToolCalls(calls));
        }
    }
    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(Completion::Text(text))
}

fn parse_tool_call(index: usize, call: &Value) -> Option<ToolCall> {
    let name = call.pointer("/function/name").and_then(Value::as_str)?;
    Some(ToolCall {
        id: call
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(|| format!("call_{index}"), str::to_string),
        name: name.to_string(),
        arguments: call
            .pointer("/function/arguments")
            .cloned()
            .unwrap_or_else(|| Value::String("{}".to_string())),
    })
}

/// Decodes one streamed completion into text fragments.
///
/// Events that fail to parse are logged and skipped; a stream ends either
/// at the `[DONE]` sentinel or when the source closes.
pub(crate) fn decode_openai_stream<S>(source: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, ProviderError>> + Send + Unpin + 'static,
{
    let stream = try_stream! {
        let mut source = source;
        let mut buffer = String::new();
        let mut done = false;
        while let Some(chunk) = source.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some((split, delimiter)) = sse::find_event_boundary(&buffer) {
                let event: String = buffer.drain(..split + delimiter).collect();
                let Some(payload) = sse::data_payload(&event) else {
                    continue;
                };
                if payload == sse::STREAM_DONE_SENTINEL {
                    done = true;
                    break;
                }
                let value: Value = match serde_json::from_str(&payload) {
                    Ok(value) => value,
                    Err(err) => {
                        debug!(error = %err, "skipping malformed stream event");
                        continue;
                    }
                };
                if let Some(delta) = value
                    .pointer("/choices/0/delta/content")
                    .and_then(Value::as_str)
                {
                    if !delta.is_empty() {
                        yield delta.to_string();
                    }
                }
            }
            if done {
                break;
            }
        }
    };
    Box::pin(stream)
}
