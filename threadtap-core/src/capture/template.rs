//! Captured request templates and the store that holds the live pair.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

/// The two endpoint shapes the tool knows how to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    SearchQuery,
    DetailFetch,
}

impl TemplateKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::SearchQuery => "search",
            Self::DetailFetch => "detail",
        }
    }

    /// Path of the variable slot replays substitute for this kind.
    ///
    /// The same slot identifies the kind during capture: a body carrying a
    /// value here is classified as this kind of request.
    pub fn slot_path(self) -> &'static [&'static str] {
        match self {
            Self::SearchQuery => &["variables", "query"],
            Self::DetailFetch => &["variables", "postId"],
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A validated, replayable request shape assembled from both observation
/// halves of one browser request.
///
/// Header names are stored lowercased. The payload skeleton keeps the
/// observed variable values; replays clone it and overwrite the slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    pub kind: TemplateKind,
    pub query_hash: String,
    pub headers: IndexMap<String, String>,
    pub payload_skeleton: Value,
    pub captured_at: DateTime<Utc>,
}

impl RequestTemplate {
    /// Copy with the session-identifying header removed. Durable storage
    /// never holds session-proving values; a live one is re-injected at
    /// request build time instead.
    pub fn scrubbed(&self, session_header: &str) -> Self {
        let mut template = self.clone();
        template
            .headers
            .retain(|name, _| !name.eq_ignore_ascii_case(session_header));
        template
    }
}

/// Which template kinds are currently available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TemplateAvailability {
    pub search: bool,
    pub detail: bool,
}

impl TemplateAvailability {
    pub fn both(self) -> bool {
        self.search && self.detail
    }
}

/// Holds at most one live template per request kind.
///
/// A newer capture of the same kind replaces the old one. Availability
/// changes are broadcast on a watch channel so readiness displays update
/// without polling.
#[derive(Debug)]
pub struct TemplateStore {
    search: Option<RequestTemplate>,
    detail: Option<RequestTemplate>,
    availability_tx: watch::Sender<TemplateAvailability>,
}

impl TemplateStore {
    pub fn new() -> Self {
        let (availability_tx, _) = watch::channel(TemplateAvailability::default());
        Self {
            search: None,
            detail: None,
            availability_tx,
        }
    }

    pub fn put(&mut self, template: RequestTemplate) {
        info!(kind = %template.kind, hash = %template.query_hash, "template stored");
        match template.kind {
            TemplateKind::SearchQuery => self.search = Some(template),
            TemplateKind::DetailFetch => self.detail = Some(template),
        }
        self.availability_tx.send_replace(self.availability());
    }

    pub fn get(&self, kind: TemplateKind) -> Option<&RequestTemplate> {
        match kind {
            TemplateKind::SearchQuery => self.search.as_ref(),
            TemplateKind::DetailFetch => self.detail.as_ref(),
        }
    }

    pub fn availability(&self) -> TemplateAvailability {
        TemplateAvailability {
            search: self.search.is_some(),
            detail: self.detail.is_some(),
        }
    }

    /// Receiver that observes every availability change.
    pub fn subscribe(&self) -> watch::Receiver<TemplateAvailability> {
        self.availability_tx.subscribe()
    }

    /// Replaces the held templates with a persisted snapshot.
    pub fn load_snapshot(&mut self, templates: Vec<RequestTemplate>) {
        for template in templates {
            match template.kind {
                TemplateKind::SearchQuery => self.search = Some(template),
                TemplateKind::DetailFetch => self.detail = Some(template),
            }
        }
        self.availability_tx.send_replace(self.availability());
    }

    /// Scrubbed copies of the held templates, ready to persist.
    pub fn snapshot(&self, session_header: &str) -> Vec<RequestTemplate> {
        [self.search.as_ref(), self.detail.as_ref()]
            .into_iter()
            .flatten()
            .map(|template| template.scrubbed(session_header))
            .collect()
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn template(kind: TemplateKind, hash: &str) -> RequestTemplate {
        let mut headers = IndexMap::new();
        headers.insert("accept".to_string(), "application/json".to_string());
        headers.insert("x-csrftoken".to_string(), "secret-token".to_string());
        RequestTemplate {
            kind,
            query_hash: hash.to_string(),
            headers,
            payload_skeleton: json!({"variables": {"query": "plumber"}}),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn put_replaces_same_kind_and_keeps_other() {
        let mut store = TemplateStore::new();
        store.put(template(TemplateKind::SearchQuery, "aaa"));
        store.put(template(TemplateKind::DetailFetch, "bbb"));
        store.put(template(TemplateKind::SearchQuery, "ccc"));
        assert_eq!(
            store.get(TemplateKind::SearchQuery).unwrap().query_hash,
            "ccc"
        );
        assert_eq!(
            store.get(TemplateKind::DetailFetch).unwrap().query_hash,
            "bbb"
        );
    }

    #[test]
    fn availability_changes_are_broadcast() {
        let mut store = TemplateStore::new();
        let rx = store.subscribe();
        assert_eq!(*rx.borrow(), TemplateAvailability::default());
        store.put(template(TemplateKind::SearchQuery, "aaa"));
        assert!(rx.borrow().search);
        assert!(!rx.borrow().detail);
        store.put(template(TemplateKind::DetailFetch, "bbb"));
        assert!(rx.borrow().both());
    }

    #[test]
    fn scrubbed_drops_session_header_only() {
        let scrubbed = template(TemplateKind::SearchQuery, "aaa").scrubbed("X-CSRFToken");
        assert!(!scrubbed.headers.contains_key("x-csrftoken"));
        assert!(scrubbed.headers.contains_key("accept"));
    }

    #[test]
    fn snapshot_scrubs_every_template() {
        let mut store = TemplateStore::new();
        store.put(template(TemplateKind::SearchQuery, "aaa"));
        store.put(template(TemplateKind::DetailFetch, "bbb"));
        let snapshot = store.snapshot("x-csrftoken");
        assert_eq!(snapshot.len(), 2);
        for entry in &snapshot {
            assert!(!entry.headers.contains_key("x-csrftoken"));
        }
    }
}
