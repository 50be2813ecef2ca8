//! Search replay: one search request, then strictly sequential detail
//! fetches with a deliberate pause between items.
//!
//! The pacing is part of the contract with the upstream site, not an
//! optimization target. Detail fetches never overlap and the inter-request
//! delay applies after every item except the last.

pub mod transport;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use threadtap_events::{EventSink, ProgressEvent, QueryEvent, RunSummary, StatusEvent};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::capture::template::{RequestTemplate, TemplateKind, TemplateStore};
use crate::config::ThreadtapConfig;
use crate::error::{CoreError, TransportError};
use crate::extract;
use crate::extract::{first_non_empty_list, string_at, value_at_path, value_at_path_mut};
use crate::model::{SearchResult, SearchSession, Thread};
use crate::session::ActiveGuard;
use self::transport::ReplayTransport;

/// Post ids live in the path segment after `/p/`, up to the next slash or
/// query string.
static POST_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/p/([^/?]+)").expect("static pattern"));

/// Where search responses have carried their result list.
const RESULT_LIST_PATHS: &[&[&str]] = &[
    &["data", "search", "results"],
    &["data", "searchResults", "edges"],
];

/// URL field inside one search result entry.
const RESULT_URL_PATHS: &[&[&str]] = &[&["url"], &["node", "url"], &["permalink"]];

/// Where detail responses have carried the post record.
const POST_PAYLOAD_PATHS: &[&[&str]] = &[&["data", "post"], &["data", "feedItem", "post"]];

/// Replays captured templates to run a full search.
pub struct ReplayOrchestrator {
    transport: Arc<dyn ReplayTransport>,
    endpoint: String,
    delay: Duration,
    tool_item_limit: usize,
    session_header: String,
    replay_active: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunFlavor {
    Primary,
    Tool,
}

impl RunFlavor {
    fn started_event(self, query: &str) -> Option<StatusEvent> {
        match self {
            // The agent announces tool runs itself, query included.
            Self::Primary => Some(StatusEvent::SearchStarted(QueryEvent {
                query: query.to_string(),
            })),
            Self::Tool => None,
        }
    }

    fn progress_event(self, progress: ProgressEvent) -> StatusEvent {
        match self {
            Self::Primary => StatusEvent::SearchProgress(progress),
            Self::Tool => StatusEvent::ToolProgress(progress),
        }
    }

    fn completed_event(self, result: &SearchResult) -> StatusEvent {
        let summary = RunSummary {
            threads: result.threads.len(),
            comments: result.total_comment_count,
            errors: result.errors.len(),
        };
        match self {
            Self::Primary => StatusEvent::SearchCompleted(summary),
            Self::Tool => StatusEvent::ToolCompleted(summary),
        }
    }
}

impl ReplayOrchestrator {
    pub fn new(
        transport: Arc<dyn ReplayTransport>,
        config: &ThreadtapConfig,
        replay_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            endpoint: config.upstream.api_endpoint.clone(),
            delay: Duration::from_millis(config.replay.inter_request_delay_ms),
            tool_item_limit: config.replay.tool_item_limit,
            session_header: config.upstream.session_header.to_ascii_lowercase(),
            replay_active,
        }
    }

    /// Runs a full search: every id found in the result list is fetched.
    pub async fn run_search(
        &self,
        query: &str,
        templates: &TemplateStore,
        session_value: Option<&str>,
        sink: &mut dyn EventSink,
    ) -> Result<SearchResult, CoreError> {
        self.run(query, templates, session_value, None, RunFlavor::Primary, sink)
            .await
    }

    /// Tool-caller variant: capped item count, tool-flavored events.
    pub async fn run_tool_search(
        &self,
        query: &str,
        templates: &TemplateStore,
        session_value: Option<&str>,
        sink: &mut dyn EventSink,
    ) -> Result<SearchResult, CoreError> {
        self.run(
            query,
            templates,
            session_value,
            Some(self.tool_item_limit),
            RunFlavor::Tool,
            sink,
        )
        .await
    }

    async fn run(
        &self,
        query: &str,
        templates: &TemplateStore,
        session_value: Option<&str>,
        limit: Option<usize>,
        flavor: RunFlavor,
        sink: &mut dyn EventSink,
    ) -> Result<SearchResult, CoreError> {
        let _guard = ActiveGuard::acquire(&self.replay_active)
            .ok_or(CoreError::RunInProgress { what: "search" })?;
        let query = query.trim();
        if query.is_empty() {
            return Err(CoreError::NoQueryAvailable);
        }
        let search_template = templates
            .get(TemplateKind::SearchQuery)
            .ok_or(CoreError::MissingTemplate {
                kind: TemplateKind::SearchQuery,
            })?;
        let detail_template = templates
            .get(TemplateKind::DetailFetch)
            .ok_or(CoreError::MissingTemplate {
                kind: TemplateKind::DetailFetch,
            })?;

        if let Some(event) = flavor.started_event(query) {
            sink.emit(&event);
        }
        info!(query, "search run started");

        let payload = substituted(search_template, query).ok_or_else(|| {
            CoreError::Transport(TransportError::Decode(
                "search template lost its query slot".to_string(),
            ))
        })?;
        let headers = self.effective_headers(search_template, session_value);
        let response = self
            .transport
            .post_json(&self.endpoint, &headers, &payload)
            .await?;

        let mut ids = extract_post_ids(&response);
        if let Some(limit) = limit {
            ids.truncate(limit);
        }
        info!(count = ids.len(), "result ids extracted");

        let mut session = SearchSession::new(query);
        let total = ids.len();
        for (index, id) in ids.iter().enumerate() {
            match self.fetch_thread(detail_template, session_value, id).await {
                Ok(thread) => session.threads.push(thread),
                Err(err) => {
                    warn!(id = %id, error = %err, "detail fetch failed");
                    session.errors.push(crate::model::ItemFailure {
                        id: id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
            sink.emit(&flavor.progress_event(ProgressEvent {
                current: index + 1,
                total,
                error_count: session.errors.len(),
            }));
            if index + 1 < total {
                sleep(self.delay).await;
            }
        }

        let result = session.into_result();
        info!(
            threads = result.threads.len(),
            comments = result.total_comment_count,
            errors = result.errors.len(),
            "search run finished"
        );
        sink.emit(&flavor.completed_event(&result));
        Ok(result)
    }

    async fn fetch_thread(
        &self,
        template: &RequestTemplate,
        session_value: Option<&str>,
        id: &str,
    ) -> Result<Thread, TransportError> {
        let payload = substituted(template, id).ok_or_else(|| {
            TransportError::Decode("detail template lost its id slot".to_string())
        })?;
        let headers = self.effective_headers(template, session_value);
        let response = self
            .transport
            .post_json(&self.endpoint, &headers, &payload)
            .await?;
        let post = POST_PAYLOAD_PATHS
            .iter()
            .find_map(|path| value_at_path(&response, path))
            .filter(|value| value.is_object())
            .ok_or_else(|| {
                TransportError::Decode("detail response held no post record".to_string())
            })?;
        Ok(Thread {
            id: id.to_string(),
            url: string_at(post, RESULT_URL_PATHS).unwrap_or_else(|| format!("/p/{id}")),
            original_post: extract::extract_post(post),
            comments: extract::extract(post),
        })
    }

    /// Template headers plus the live session value when the template does
    /// not carry one. Persisted templates are scrubbed, so this is how a
    /// restored template becomes replayable again.
    fn effective_headers(
        &self,
        template: &RequestTemplate,
        session_value: Option<&str>,
    ) -> indexmap::IndexMap<String, String> {
        let mut headers = template.headers.clone();
        if !headers.contains_key(self.session_header.as_str()) {
            if let Some(value) = session_value {
                headers.insert(self.session_header.clone(), value.to_string());
            }
        }
        headers
    }
}

/// Clone of the template payload with the variable slot overwritten.
fn substituted(template: &RequestTemplate, value: &str) -> Option<Value> {
    let mut payload = template.payload_skeleton.clone();
    let slot = value_at_path_mut(&mut payload, template.kind.slot_path())?;
    *slot = Value::String(value.to_string());
    Some(payload)
}

/// Ids in result-list order; entries without a recognizable URL are
/// dropped, duplicates are kept.
fn extract_post_ids(response: &Value) -> Vec<String> {
    let Some(results) = first_non_empty_list(response, RESULT_LIST_PATHS) else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|entry| {
            let url = string_at(entry, RESULT_URL_PATHS)?;
            post_id_from_url(&url)
        })
        .collect()
}

/// Extracts the post id from a result URL, or `None` when the URL has no
/// `/p/` segment.
pub(crate) fn post_id_from_url(url: &str) -> Option<String> {
    POST_ID_PATTERN
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}
