//! Explicit per-session state shared across components.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use threadtap_events::ReadinessSnapshot;

use crate::capture::template::TemplateStore;
use crate::model::{SearchResult, Turn};

/// Everything mutable that belongs to one running session: the observed
/// session credential, conversation state, the latest primary search, and
/// the busy flags.
///
/// Components receive what they need from here explicitly; nothing reads
/// session state through globals.
#[derive(Debug)]
pub struct SessionContext {
    session_value: Option<String>,
    pub history: Vec<Turn>,
    pub prior_tool_results: Vec<SearchResult>,
    pub primary_result: Option<SearchResult>,
    replay_active: Arc<AtomicBool>,
    agent_active: Arc<AtomicBool>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            session_value: None,
            history: Vec::new(),
            prior_tool_results: Vec::new(),
            primary_result: None,
            replay_active: Arc::new(AtomicBool::new(false)),
            agent_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared handle to the replay busy flag.
    pub fn replay_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.replay_active)
    }

    /// Shared handle to the agent busy flag.
    pub fn agent_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.agent_active)
    }

    pub fn replay_active(&self) -> bool {
        self.replay_active.load(Ordering::SeqCst)
    }

    pub fn agent_active(&self) -> bool {
        self.agent_active.load(Ordering::SeqCst)
    }

    pub fn session_value(&self) -> Option<&str> {
        self.session_value.as_deref()
    }

    pub fn update_session_value(&mut self, value: Option<String>) {
        if value.is_some() {
            self.session_value = value;
        }
    }

    /// Forgets the chat history and accumulated tool searches. The primary
    /// search result survives; only the conversation is discarded.
    pub fn reset_conversation(&mut self) {
        self.history.clear();
        self.prior_tool_results.clear();
    }

    /// Installs a fresh primary search result. Conversation state resets so
    /// the next chat turn starts from the new corpus alone.
    pub fn install_primary(&mut self, result: SearchResult) {
        self.primary_result = Some(result);
        self.reset_conversation();
    }

    pub fn readiness(&self, templates: &TemplateStore) -> ReadinessSnapshot {
        let availability = templates.availability();
        ReadinessSnapshot {
            session_seen: self.session_value.is_some(),
            search_template: availability.search,
            detail_template: availability.detail,
            replay_active: self.replay_active(),
            agent_active: self.agent_active(),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII hold on one busy flag.
///
/// Acquisition fails when the flag is already set; runs reject instead of
/// queueing. Dropping the guard clears the flag on every exit path.
#[derive(Debug)]
pub struct ActiveGuard {
    flag: Arc<AtomicBool>,
}

impl ActiveGuard {
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
