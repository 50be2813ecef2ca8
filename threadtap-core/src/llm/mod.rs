//! Provider-agnostic model plumbing.
//!
//! The [`Provider`] trait hides three wire dialects behind one message
//! shape. Capability questions (tool support, system role) are explicit
//! trait methods so callers branch on declared behavior instead of backend
//! names. Per-backend turn formatting after a tool run goes through
//! [`Provider::format_tool_result_messages`], the one place where dialects
//! legitimately diverge in message structure.

pub mod anthropic;
pub mod ollama;
pub mod openai;
mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::error::{CoreError, ProviderError};

/// Lazily produced text fragments of one streamed completion. Exhausted
/// when the backend signals completion; not restartable.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Plain text for most turns; raw block arrays where a dialect expects
/// structured content (tool use and tool results on some backends).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Blocks(_) => None,
        }
    }

    /// Wire-ready rendering for dialects that only take strings.
    pub fn to_wire_string(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => Value::Array(blocks.clone()).to_string(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// One normalized conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn base(role: ChatRole, content: MessageContent) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(ChatRole::System, MessageContent::Text(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(ChatRole::User, MessageContent::Text(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(ChatRole::Assistant, MessageContent::Text(content.into()))
    }

    /// Assistant turn that carries tool calls in the flat dialect.
    pub fn assistant_with_calls(calls: Vec<ToolCall>) -> Self {
        let mut message = Self::base(ChatRole::Assistant, MessageContent::Text(String::new()));
        message.tool_calls = Some(calls);
        message
    }

    /// Assistant turn whose content is a raw block array.
    pub fn assistant_blocks(blocks: Vec<Value>) -> Self {
        Self::base(ChatRole::Assistant, MessageContent::Blocks(blocks))
    }

    /// User turn whose content is a raw block array.
    pub fn user_blocks(blocks: Vec<Value>) -> Self {
        Self::base(ChatRole::User, MessageContent::Blocks(blocks))
    }

    /// Tool-role turn answering one call.
    pub fn tool_response(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::base(ChatRole::Tool, MessageContent::Text(content.into()));
        message.tool_call_id = Some(call_id.into());
        message
    }
}

/// One tool invocation requested by the model.
///
/// `arguments` keeps whatever encoding the backend used: a JSON-encoded
/// string on some dialects, a structured object on others. Consumers go
/// through [`tool_arguments_as_object`] or [`tool_arguments_as_string`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Declaration of a callable tool offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    /// JSON schema of the argument object.
    pub parameters: Value,
}

/// Textual outcome of one executed tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub call_id: String,
    pub content: String,
}

/// Outcome of one non-streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

/// A model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name as reported in errors and logs.
    fn name(&self) -> &'static str;

    /// Whether structured tool declarations can be sent at all.
    fn supports_tool_calls(&self) -> bool {
        false
    }

    /// Whether the instruction block may travel as a dedicated system turn.
    /// When false, callers prepend instructions to the first user turn.
    fn supports_system_role(&self) -> bool {
        true
    }

    /// Streams a completion as lazily decoded text fragments.
    async fn stream_completion(&self, messages: &[ChatMessage])
    -> Result<TextStream, ProviderError>;

    /// Single-shot completion that may answer with text or tool calls.
    async fn completion_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDecl],
    ) -> Result<Completion, ProviderError>;

    /// Turn sequence this backend expects appended after tools executed.
    fn format_tool_result_messages(
        &self,
        calls: &[ToolCall],
        results: &[ToolResult],
    ) -> Vec<ChatMessage>;
}

/// Builds the configured backend.
pub fn create_provider(config: &ProviderConfig) -> Result<Box<dyn Provider>, CoreError> {
    match config.backend.as_str() {
        openai::BACKEND => {
            let api_key = config.api_key().ok_or_else(|| missing_key(config))?;
            Ok(Box::new(openai::OpenAiProvider::new(api_key, config)))
        }
        anthropic::BACKEND => {
            let api_key = config.api_key().ok_or_else(|| missing_key(config))?;
            Ok(Box::new(anthropic::AnthropicProvider::new(api_key, config)))
        }
        ollama::BACKEND => Ok(Box::new(ollama::OllamaProvider::new(config))),
        other => Err(CoreError::ProviderConfig(format!(
            "unknown backend `{other}`"
        ))),
    }
}

fn missing_key(config: &ProviderConfig) -> CoreError {
    CoreError::ProviderConfig(format!(
        "environment variable {} is empty; the {} backend needs an API key",
        config.api_key_env, config.backend
    ))
}

/// Argument payload as a structured object, parsing the string encoding
/// when necessary.
pub fn tool_arguments_as_object(arguments: &Value) -> Value {
    match arguments {
        Value::String(raw) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
        }
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    }
}

/// Argument payload as a JSON-encoded string, serializing the object
/// encoding when necessary.
pub fn tool_arguments_as_string(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

/// Error messages keep a bounded slice of the response body.
pub(crate) fn truncated(body: &str) -> String {
    const LIMIT: usize = 300;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut cut = LIMIT;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &body[..cut])
}
