//! Ollama chat dialect.
//!
//! Responses stream as newline-delimited JSON chunks with a boolean
//! completion flag rather than event framing. Tool calls arrive with
//! structured object arguments and no ids, so ids are generated from the
//! list position. No API key is involved.

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    ChatMessage, Completion, Provider, TextStream, ToolCall, ToolDecl, ToolResult,
    tool_arguments_as_object, truncated,
};
use crate::config::ProviderConfig;
use crate::error::ProviderError;

pub const BACKEND: &str = "ollama";
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
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
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": stream,
            "options": {
                "num_predict": self.max_tokens,
                "temperature": self.temperature,
            },
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            },
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
            .post(format!("{}/api/chat", self.base_url))
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
impl Provider for OllamaProvider {
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
        Ok(decode_ollama_stream(bytes))
    }

    async fn completion_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDecl],
    ) -> Result<Completion, ProviderError> {
        let payload = self.request_payload(messages, tools, false);
        let response = self.send(&payload).await?;
        let chunk: WireChunk = response.json().await.map_err(|err| ProviderError::Decode {
            backend: BACKEND,
            message: err.to_string(),
        })?;
        Ok(parse_completion(chunk))
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

fn wire_message(message: &ChatMessage) -> Value {
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
                        "function": {
                            "name": call.name,
                            "arguments": tool_arguments_as_object(&call.arguments),
                        },
                    })
                })
                .collect(),
        );
    }
    wire
}

fn parse_completion(chunk: WireChunk) -> Completion {
    if chunk.message.tool_calls.is_empty() {
        return Completion::Text(chunk.message.content);
    }
    let calls = chunk
        .message
        .tool_calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| ToolCall {
            id: format!("call_{index}"),
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();
    Completion::ToolCalls(calls)
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    message: WireMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Decodes one streamed completion into text fragments.
///
/// Chunks are framed by newlines. The chunk flagged `done` ends the
/// stream; reaching the end of the byte stream without seeing that flag
/// is a decode error. Lines that fail to parse are logged and skipped.
pub(crate) fn decode_ollama_stream<S>(source: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, ProviderError>> + Send + Unpin + 'static,
{
    let stream = try_stream! {
        let mut source = source;
        let mut buffer = String::new();
        let mut completed = false;
        while let Some(chunk) = source.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                if let Some(text) = decode_line(&line, &mut completed) {
                    yield text;
                }
                if completed {
                    break;
                }
            }
            if completed {
                break;
            }
        }
        // A final chunk may arrive without a trailing newline.
        if !completed {
            let trailing = decode_line(&buffer, &mut completed);
            if let Some(text) = trailing {
                yield text;
            }
        }
        if !completed {
            Err(ProviderError::Decode {
                backend: BACKEND,
                message: "stream ended without a completion signal".to_string(),
            })?;
        }
    };
    Box::pin(stream)
}

fn decode_line(line: &str, completed: &mut bool) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let parsed: WireChunk = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "skipping malformed stream line");
            return None;
        }
    };
    if parsed.done {
        *completed = true;
    }
    if parsed.message.content.is_empty() {
        None
    } else {
        Some(parsed.message.content)
    }
}
