//! Deterministic fakes for tests that exercise replay and chat flows
//! without network calls.
//!
//! Both fakes follow the same pattern: queue outcomes up front with
//! builder-style `with_*` calls, hand the fake to the code under test, and
//! inspect what it received through a cloneable recorder handle. Outcomes
//! are served in FIFO order; an exhausted queue is an error, so a test that
//! under-scripts fails loudly instead of hanging.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{ProviderError, TransportError};
use crate::llm::{
    ChatMessage, Completion, Provider, TextStream, ToolCall, ToolDecl, ToolResult,
};
use crate::replay::transport::ReplayTransport;

/// One request as seen by a [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: IndexMap<String, String>,
    pub payload: Value,
    /// When the request arrived, for pacing assertions.
    pub at: Instant,
}

/// Cloneable view of the requests a [`ScriptedTransport`] served.
#[derive(Debug, Clone, Default)]
pub struct RequestRecorder {
    log: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl RequestRecorder {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().expect("request log lock").clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().expect("request log lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, request: RecordedRequest) {
        self.log.lock().expect("request log lock").push(request);
    }
}

/// [`ReplayTransport`] that answers from a queue of scripted outcomes.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Result<Value, TransportError>>>,
    recorder: RequestRecorder,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful JSON response.
    pub fn with_response(self, response: Value) -> Self {
        self.queue
            .lock()
            .expect("response queue lock")
            .push_back(Ok(response));
        self
    }

    /// Queues a failure.
    pub fn with_error(self, error: TransportError) -> Self {
        self.queue
            .lock()
            .expect("response queue lock")
            .push_back(Err(error));
        self
    }

    /// Handle that stays valid after the transport moves into the code
    /// under test.
    pub fn recorder(&self) -> RequestRecorder {
        self.recorder.clone()
    }
}

#[async_trait]
impl ReplayTransport for ScriptedTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &IndexMap<String, String>,
        payload: &Value,
    ) -> Result<Value, TransportError> {
        self.recorder.record(RecordedRequest {
            url: url.to_string(),
            headers: headers.clone(),
            payload: payload.clone(),
            at: Instant::now(),
        });
        self.queue
            .lock()
            .expect("response queue lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(TransportError::Decode(
                    "scripted transport ran out of responses".to_string(),
                ))
            })
    }
}

/// Cloneable view of the message lists a [`ScriptedProvider`] received.
#[derive(Debug, Clone, Default)]
pub struct TranscriptRecorder {
    log: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl TranscriptRecorder {
    /// Every outbound message list, one entry per provider call.
    pub fn transcripts(&self) -> Vec<Vec<ChatMessage>> {
        self.log.lock().expect("transcript log lock").clone()
    }

    pub fn latest(&self) -> Option<Vec<ChatMessage>> {
        self.log.lock().expect("transcript log lock").last().cloned()
    }

    fn record(&self, messages: &[ChatMessage]) {
        self.log
            .lock()
            .expect("transcript log lock")
            .push(messages.to_vec());
    }
}

/// [`Provider`] that answers from queued completions and streams.
///
/// Tool-result formatting uses the flat dialect (assistant turn with calls,
/// then one tool turn per result) so agent tests see realistic turn shapes.
#[derive(Debug)]
pub struct ScriptedProvider {
    completions: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    streams: Mutex<VecDeque<Vec<String>>>,
    tool_support: bool,
    system_role: bool,
    recorder: TranscriptRecorder,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            completions: Mutex::new(VecDeque::new()),
            streams: Mutex::new(VecDeque::new()),
            tool_support: true,
            system_role: true,
            recorder: TranscriptRecorder::default(),
        }
    }

    /// Queues one `completion_with_tools` outcome.
    pub fn with_completion(self, completion: Completion) -> Self {
        self.completions
            .lock()
            .expect("completion queue lock")
            .push_back(Ok(completion));
        self
    }

    /// Queues a plain-text completion.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_completion(Completion::Text(text.into()))
    }

    /// Queues a completion requesting the given tool calls.
    pub fn with_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.with_completion(Completion::ToolCalls(calls))
    }

    /// Queues a provider failure.
    pub fn with_provider_error(self, error: ProviderError) -> Self {
        self.completions
            .lock()
            .expect("completion queue lock")
            .push_back(Err(error));
        self
    }

    /// Queues one `stream_completion` outcome as its fragments.
    pub fn with_stream<I, S>(self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.streams
            .lock()
            .expect("stream queue lock")
            .push_back(fragments.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_tool_support(mut self) -> Self {
        self.tool_support = false;
        self
    }

    pub fn without_system_role(mut self) -> Self {
        self.system_role = false;
        self
    }

    /// Handle that stays valid after the provider moves into the code
    /// under test.
    pub fn recorder(&self) -> TranscriptRecorder {
        self.recorder.clone()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports_tool_calls(&self) -> bool {
        self.tool_support
    }

    fn supports_system_role(&self) -> bool {
        self.system_role
    }

    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
    ) -> Result<TextStream, ProviderError> {
        self.recorder.record(messages);
        let fragments = self
            .streams
            .lock()
            .expect("stream queue lock")
            .pop_front()
            .ok_or_else(|| ProviderError::Decode {
                backend: "scripted",
                message: "scripted provider ran out of streams".to_string(),
            })?;
        let items: Vec<Result<String, ProviderError>> =
            fragments.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn completion_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDecl],
    ) -> Result<Completion, ProviderError> {
        self.recorder.record(messages);
        self.completions
            .lock()
            .expect("completion queue lock")
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::Decode {
                    backend: "scripted",
                    message: "scripted provider ran out of completions".to_string(),
                })
            })
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
