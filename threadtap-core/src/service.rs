//! Command facade tying capture, replay, chat, and persistence together.
//!
//! One [`ThreadtapService`] owns the session, the template store, and the
//! correlator, and exposes one method per user-facing command. State is
//! persisted after every mutation so a restarted process picks up where
//! the last one stopped.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use threadtap_events::{EventSink, ReadinessSnapshot, RunFailedEvent, RunSummary, StatusEvent};
use tracing::{debug, info};

use crate::agent::{ConversationalAgent, compose_instructions};
use crate::capture::correlator::CaptureCorrelator;
use crate::capture::template::TemplateStore;
use crate::capture::{ObservationBus, TapSummary, ingest_tap};
use crate::config::ThreadtapConfig;
use crate::error::CoreError;
use crate::llm::{Provider, create_provider};
use crate::model::SearchResult;
use crate::replay::ReplayOrchestrator;
use crate::replay::transport::{HttpReplayTransport, ReplayTransport};
use crate::session::SessionContext;
use crate::state::PersistedState;

pub struct ThreadtapService {
    config: ThreadtapConfig,
    session: SessionContext,
    templates: TemplateStore,
    correlator: CaptureCorrelator,
    bus: ObservationBus,
    transport: Arc<dyn ReplayTransport>,
    state_path: PathBuf,
}

impl ThreadtapService {
    /// Builds a service with the HTTP transport and state loaded from
    /// `state_path`.
    pub fn new(config: ThreadtapConfig, state_path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let transport = Arc::new(HttpReplayTransport::new()?);
        Ok(Self::with_transport(config, state_path, transport))
    }

    /// Same wiring with a caller-chosen transport. Tests inject scripted
    /// transports here.
    pub fn with_transport(
        config: ThreadtapConfig,
        state_path: impl Into<PathBuf>,
        transport: Arc<dyn ReplayTransport>,
    ) -> Self {
        let state_path = state_path.into();
        let mut session = SessionContext::new();
        let correlator = CaptureCorrelator::new(
            &config.upstream.session_header,
            Duration::from_secs(config.replay.pending_capture_ttl_secs),
            session.replay_flag(),
        );

        let state = PersistedState::load(&state_path);
        let mut templates = TemplateStore::new();
        templates.load_snapshot(state.templates);
        session.primary_result = state.last_result;

        Self {
            config,
            session,
            templates,
            correlator,
            bus: ObservationBus::new(),
            transport,
            state_path,
        }
    }

    pub fn config(&self) -> &ThreadtapConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn last_result(&self) -> Option<&SearchResult> {
        self.session.primary_result.as_ref()
    }

    /// What the tool can currently do, for the `status` command.
    pub fn status(&self) -> ReadinessSnapshot {
        self.session.readiness(&self.templates)
    }

    /// Effective instruction block, configured guidance applied.
    pub fn instructions(&self) -> String {
        compose_instructions(self.config.agent.guidance.as_deref())
    }

    /// Ingests an NDJSON observation tap: publish matching lines, correlate
    /// them into templates, pick up any session header value, persist.
    pub fn ingest_reader(&mut self, reader: impl BufRead) -> Result<TapSummary, CoreError> {
        let publisher = self.bus.publisher();
        let summary = ingest_tap(reader, &self.config.upstream.api_url_filter, &publisher);
        let drained = self
            .bus
            .drain_into(&mut self.correlator, &mut self.templates);
        debug!(
            published = summary.published,
            drained, "tap observations correlated"
        );
        if self.correlator.take_session_changed() {
            self.session
                .update_session_value(self.correlator.session_value().map(str::to_string));
            info!("session header value updated from tap");
        }
        self.persist()?;
        Ok(summary)
    }

    /// Full search run. The result becomes the primary corpus for chat and
    /// is persisted as the last result.
    pub async fn run_search(
        &mut self,
        query: &str,
        sink: &mut dyn EventSink,
    ) -> Result<RunSummary, CoreError> {
        let orchestrator = self.orchestrator();
        let session_value = self.session.session_value().map(str::to_string);
        let outcome = orchestrator
            .run_search(query, &self.templates, session_value.as_deref(), sink)
            .await;
        match outcome {
            Ok(result) => {
                let summary = RunSummary {
                    threads: result.threads.len(),
                    comments: result.total_comment_count,
                    errors: result.errors.len(),
                };
                self.session.install_primary(result);
                self.persist()?;
                Ok(summary)
            }
            Err(err) => {
                sink.emit(&StatusEvent::RunFailed(RunFailedEvent {
                    message: err.to_string(),
                }));
                Err(err)
            }
        }
    }

    /// One chat turn against the configured backend.
    pub async fn chat(
        &mut self,
        message: &str,
        sink: &mut dyn EventSink,
    ) -> Result<String, CoreError> {
        let provider = create_provider(&self.config.provider)?;
        self.chat_with_provider(provider.as_ref(), message, sink)
            .await
    }

    /// Chat seam taking an explicit provider; tests pass scripted ones.
    pub async fn chat_with_provider(
        &mut self,
        provider: &dyn Provider,
        message: &str,
        sink: &mut dyn EventSink,
    ) -> Result<String, CoreError> {
        let orchestrator = self.orchestrator();
        let agent = ConversationalAgent::new(provider, &orchestrator, &self.config.agent);
        let outcome = agent
            .run_turn(message, &mut self.session, &self.templates, sink)
            .await;
        if let Err(err) = &outcome {
            sink.emit(&StatusEvent::RunFailed(RunFailedEvent {
                message: err.to_string(),
            }));
        }
        outcome
    }

    /// Drops conversation history and tool results, keeping the primary
    /// search corpus.
    pub fn clear_conversation(&mut self) {
        self.session.reset_conversation();
        info!("conversation cleared");
    }

    fn orchestrator(&self) -> ReplayOrchestrator {
        ReplayOrchestrator::new(
            self.transport.clone(),
            &self.config,
            self.session.replay_flag(),
        )
    }

    fn persist(&self) -> Result<(), CoreError> {
        PersistedState::capture(
            &self.templates,
            &self.config.upstream.session_header,
            self.session.primary_result.as_ref(),
        )
        .save(&self.state_path)
    }
}
