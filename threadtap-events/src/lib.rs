//! Status events shared between threadtap crates.
//!
//! The core library reports run progress by pushing [`StatusEvent`] values
//! into an [`EventSink`]. Front-ends decide how to render them; the schema
//! stays stable and serializable so a detached UI can consume the stream as
//! JSON lines. Each variant carries a `type` tag in dotted form, for example
//! `search.progress` or `chat.delta`.

use serde::{Deserialize, Serialize};

/// Receives status events during a run.
///
/// Implemented for any `FnMut(&StatusEvent)` closure, so callers that only
/// want to print or collect events do not need a named type.
pub trait EventSink {
    fn emit(&mut self, event: &StatusEvent);
}

impl<F> EventSink for F
where
    F: FnMut(&StatusEvent),
{
    fn emit(&mut self, event: &StatusEvent) {
        self(event);
    }
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: &StatusEvent) {}
}

/// Sink that records events in arrival order.
#[derive(Debug, Default)]
pub struct VecSink {
    events: Vec<StatusEvent>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[StatusEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<StatusEvent> {
        self.events
    }
}

impl EventSink for VecSink {
    fn emit(&mut self, event: &StatusEvent) {
        self.events.push(event.clone());
    }
}

/// One status notice pushed to the UI while a search or chat turn executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    /// A primary search run accepted a query and started.
    #[serde(rename = "search.started")]
    SearchStarted(QueryEvent),
    /// One item of a primary search finished, successfully or not.
    #[serde(rename = "search.progress")]
    SearchProgress(ProgressEvent),
    /// A primary search run finished and its result is available.
    #[serde(rename = "search.completed")]
    SearchCompleted(RunSummary),
    /// A fragment of assistant reply text.
    #[serde(rename = "chat.delta")]
    ChatDelta(ChatDeltaEvent),
    /// The assistant reply is complete.
    #[serde(rename = "chat.completed")]
    ChatCompleted,
    /// The assistant invoked the search tool.
    #[serde(rename = "tool.started")]
    ToolStarted(QueryEvent),
    /// One item of a tool-triggered search finished.
    #[serde(rename = "tool.progress")]
    ToolProgress(ProgressEvent),
    /// A tool-triggered search finished.
    #[serde(rename = "tool.completed")]
    ToolCompleted(RunSummary),
    /// The run stopped on a failure the user needs to see.
    #[serde(rename = "run.failed")]
    RunFailed(RunFailedEvent),
}

/// Query text attached to a run start notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryEvent {
    pub query: String,
}

/// Position within a running fetch sequence.
///
/// `current` counts finished items including failures, so the final progress
/// event of a run always has `current == total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressEvent {
    pub current: usize,
    pub total: usize,
    pub error_count: usize,
}

/// Aggregate counts reported when a search run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub threads: usize,
    pub comments: usize,
    pub errors: usize,
}

/// Fragment of streamed assistant text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDeltaEvent {
    pub text: String,
}

/// Human-readable description of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailedEvent {
    pub message: String,
}

/// Point-in-time answer to "can a run start right now".
///
/// `session_seen` reports whether a session-identifying header value has been
/// observed since startup; replays still work without one if the stored
/// templates carry their own credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReadinessSnapshot {
    pub session_seen: bool,
    pub search_template: bool,
    pub detail_template: bool,
    pub replay_active: bool,
    pub agent_active: bool,
}

impl ReadinessSnapshot {
    /// True when both template kinds are present and no run is executing.
    pub fn can_search(&self) -> bool {
        self.search_template && self.detail_template && !self.replay_active
    }
}
