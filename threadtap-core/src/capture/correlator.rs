//! Correlates body and header observations into request templates.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use super::template::{RequestTemplate, TemplateKind, TemplateStore};
use super::{BodyObservation, HeaderEntry, HeaderObservation, Observation, REPLAY_ORIGINATOR};
use crate::extract::value_at_path;

/// Where upstream bodies have carried the persisted-query hash, in the
/// order they should be tried.
const HASH_PATHS: &[&[&str]] = &[
    &["extensions", "persistedQuery", "sha256Hash"],
    &["extensions", "documentId"],
    &["doc_id"],
];

/// Headers that must never ride along on a replay. Hop-by-hop and
/// transport-owned fields break when forwarded; cookies travel through the
/// ambient cookie store instead.
const FORBIDDEN_HEADERS: &[&str] = &["authority", "connection", "content-length", "cookie"];

/// Why a body observation could not become a pending capture. These are
/// logged at debug level and dropped; unparseable traffic is routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureParseFailure {
    NotJson,
    UntrackedShape,
    MissingHash,
}

/// Body half waiting for its header half.
#[derive(Debug)]
struct PendingCapture {
    kind: TemplateKind,
    query_hash: String,
    payload: Value,
    created_at: Instant,
}

/// Turns interleaved observation streams into validated templates.
///
/// Body events are parsed, classified, and parked as pending captures keyed
/// by request id. A matching header event within the TTL finalizes the
/// template. Everything arriving while a replay runs, or stamped with the
/// replay originator, is dropped so the tool never captures itself.
#[derive(Debug)]
pub struct CaptureCorrelator {
    pending: HashMap<String, PendingCapture>,
    ttl: Duration,
    session_header: String,
    session_value: Option<String>,
    session_changed: bool,
    replay_active: Arc<AtomicBool>,
}

impl CaptureCorrelator {
    pub fn new(session_header: &str, ttl: Duration, replay_active: Arc<AtomicBool>) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
            session_header: session_header.to_ascii_lowercase(),
            session_value: None,
            session_changed: false,
            replay_active,
        }
    }

    /// Routes one observation to the matching handler.
    pub fn observe(&mut self, observation: Observation, store: &mut TemplateStore) {
        match observation {
            Observation::Body(body) => self.on_body_observed(body),
            Observation::Headers(headers) => self.on_headers_observed(headers, store),
        }
    }

    /// Handles the pre-send half: parse, classify, and park the payload.
    pub fn on_body_observed(&mut self, observation: BodyObservation) {
        if observation.originator == REPLAY_ORIGINATOR {
            debug!(request_id = %observation.request_id, "ignoring replay-originated body");
            return;
        }
        if self.replay_active.load(Ordering::Relaxed) {
            debug!(request_id = %observation.request_id, "replay in progress, ignoring body");
            return;
        }
        self.prune_expired();
        match parse_capture_body(&observation.raw_body) {
            Ok((kind, query_hash, payload)) => {
                // One slot per request id; a later body for the same id wins.
                self.pending.insert(
                    observation.request_id,
                    PendingCapture {
                        kind,
                        query_hash,
                        payload,
                        created_at: Instant::now(),
                    },
                );
            }
            Err(failure) => {
                debug!(
                    request_id = %observation.request_id,
                    ?failure,
                    "dropped unparseable capture body"
                );
            }
        }
    }

    /// Handles the send-time half: session detection plus template assembly.
    ///
    /// The session header scan runs for every event so a fresh session value
    /// is picked up even when no capture is pending.
    pub fn on_headers_observed(&mut self, observation: HeaderObservation, store: &mut TemplateStore) {
        for entry in &observation.headers {
            let name = entry.name.trim_start_matches(':');
            if name.eq_ignore_ascii_case(&self.session_header)
                && self.session_value.as_deref() != Some(entry.value.as_str())
            {
                // Value itself stays out of the logs.
                debug!("observed new session identifier value");
                self.session_value = Some(entry.value.clone());
                self.session_changed = true;
            }
        }

        if observation.originator == REPLAY_ORIGINATOR {
            return;
        }
        let Some(pending) = self.take_live(&observation.request_id) else {
            return;
        };
        store.put(RequestTemplate {
            kind: pending.kind,
            query_hash: pending.query_hash,
            headers: build_header_map(&observation.headers),
            payload_skeleton: pending.payload,
            captured_at: Utc::now(),
        });
    }

    /// Latest observed session-identifying header value.
    pub fn session_value(&self) -> Option<&str> {
        self.session_value.as_deref()
    }

    /// True once per session value change; cleared on read.
    pub fn take_session_changed(&mut self) -> bool {
        std::mem::take(&mut self.session_changed)
    }

    fn take_live(&mut self, request_id: &str) -> Option<PendingCapture> {
        let pending = self.pending.remove(request_id)?;
        if pending.created_at.elapsed() >= self.ttl {
            debug!(request_id, "pending capture expired before headers arrived");
            return None;
        }
        Some(pending)
    }

    fn prune_expired(&mut self) {
        let ttl = self.ttl;
        self.pending.retain(|request_id, pending| {
            let live = pending.created_at.elapsed() < ttl;
            if !live {
                debug!(request_id = %request_id, "expired pending capture");
            }
            live
        });
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Parses one raw body into its template ingredients.
fn parse_capture_body(raw: &str) -> Result<(TemplateKind, String, Value), CaptureParseFailure> {
    let payload: Value =
        serde_json::from_str(raw).map_err(|_| CaptureParseFailure::NotJson)?;
    let kind = classify_payload(&payload).ok_or(CaptureParseFailure::UntrackedShape)?;
    let query_hash = HASH_PATHS
        .iter()
        .find_map(|path| value_at_path(&payload, path).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or(CaptureParseFailure::MissingHash)?;
    Ok((kind, query_hash, payload))
}

/// A body is a search when the search slot holds a value, a detail fetch
/// when the detail slot does. A request id only ever maps to one kind.
fn classify_payload(payload: &Value) -> Option<TemplateKind> {
    [TemplateKind::SearchQuery, TemplateKind::DetailFetch]
        .into_iter()
        .find(|kind| {
            value_at_path(payload, kind.slot_path()).is_some_and(|slot| !slot.is_null())
        })
}

/// Lowercases names and drops headers that must not be replayed.
fn build_header_map(entries: &[HeaderEntry]) -> IndexMap<String, String> {
    entries
        .iter()
        .filter(|entry| {
            let name = entry.name.trim_start_matches(':');
            !FORBIDDEN_HEADERS
                .iter()
                .any(|forbidden| name.eq_ignore_ascii_case(forbidden))
        })
        .map(|entry| (entry.name.to_ascii_lowercase(), entry.value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    fn correlator() -> (CaptureCorrelator, TemplateStore) {
        (
            CaptureCorrelator::new("x-csrftoken", TTL, Arc::new(AtomicBool::new(false))),
            TemplateStore::new(),
        )
    }

    fn search_body(request_id: &str) -> BodyObservation {
        body_with(
            request_id,
            "page",
            json!({
                "variables": {"query": "plumber"},
                "extensions": {"persistedQuery": {"sha256Hash": "hash-search"}}
            }),
        )
    }

    fn detail_body(request_id: &str) -> BodyObservation {
        body_with(
            request_id,
            "page",
            json!({
                "variables": {"postId": "abc"},
                "extensions": {"persistedQuery": {"sha256Hash": "hash-detail"}}
            }),
        )
    }

    fn body_with(request_id: &str, originator: &str, payload: Value) -> BodyObservation {
        BodyObservation {
            request_id: request_id.to_string(),
            originator: originator.to_string(),
            url: "https://x.test/api/gql".to_string(),
            raw_body: payload.to_string(),
        }
    }

    fn headers(request_id: &str) -> HeaderObservation {
        HeaderObservation {
            request_id: request_id.to_string(),
            originator: "page".to_string(),
            url: "https://x.test/api/gql".to_string(),
            headers: vec![
                entry("Accept", "application/json"),
                entry("X-CSRFToken", "tok-123"),
                entry("Cookie", "session=abc"),
                entry(":authority", "x.test"),
                entry("Content-Length", "482"),
                entry("Connection", "keep-alive"),
            ],
        }
    }

    fn entry(name: &str, value: &str) -> HeaderEntry {
        HeaderEntry {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn both_halves_in_order_produce_a_template() {
        let (mut correlator, mut store) = correlator();
        correlator.on_body_observed(search_body("r1"));
        correlator.on_headers_observed(headers("r1"), &mut store);
        let template = store.get(TemplateKind::SearchQuery).unwrap();
        assert_eq!(template.query_hash, "hash-search");
        assert_eq!(
            template.payload_skeleton["variables"]["query"],
            json!("plumber")
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn forbidden_headers_are_stripped_and_names_lowercased() {
        let (mut correlator, mut store) = correlator();
        correlator.on_body_observed(search_body("r1"));
        correlator.on_headers_observed(headers("r1"), &mut store);
        let template = store.get(TemplateKind::SearchQuery).unwrap();
        assert_eq!(template.headers.get("accept").unwrap(), "application/json");
        assert!(template.headers.contains_key("x-csrftoken"));
        for forbidden in ["cookie", "authority", ":authority", "content-length", "connection"] {
            assert!(!template.headers.contains_key(forbidden), "{forbidden} kept");
        }
    }

    #[test]
    fn header_half_without_body_is_a_no_op() {
        let (mut correlator, mut store) = correlator();
        correlator.on_headers_observed(headers("r1"), &mut store);
        assert!(store.get(TemplateKind::SearchQuery).is_none());
        assert!(store.get(TemplateKind::DetailFetch).is_none());
        // The session header was still picked up.
        assert_eq!(correlator.session_value(), Some("tok-123"));
        assert!(correlator.take_session_changed());
        assert!(!correlator.take_session_changed());
    }

    #[test]
    fn replay_originated_bodies_are_ignored() {
        let (mut correlator, mut store) = correlator();
        let mut body = search_body("r1");
        body.originator = REPLAY_ORIGINATOR.to_string();
        correlator.on_body_observed(body);
        correlator.on_headers_observed(headers("r1"), &mut store);
        assert!(store.get(TemplateKind::SearchQuery).is_none());
    }

    #[test]
    fn bodies_are_ignored_while_replay_is_active() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut correlator = CaptureCorrelator::new("x-csrftoken", TTL, Arc::clone(&flag));
        let mut store = TemplateStore::new();
        correlator.on_body_observed(search_body("r1"));
        assert_eq!(correlator.pending_count(), 0);

        flag.store(false, Ordering::Relaxed);
        correlator.on_body_observed(search_body("r2"));
        correlator.on_headers_observed(headers("r2"), &mut store);
        assert!(store.get(TemplateKind::SearchQuery).is_some());
    }

    #[test]
    fn expired_pending_capture_never_completes() {
        let mut correlator =
            CaptureCorrelator::new("x-csrftoken", Duration::ZERO, Arc::new(AtomicBool::new(false)));
        let mut store = TemplateStore::new();
        correlator.on_body_observed(search_body("r1"));
        correlator.on_headers_observed(headers("r1"), &mut store);
        assert!(store.get(TemplateKind::SearchQuery).is_none());
    }

    #[test]
    fn malformed_bodies_are_dropped_silently() {
        let (mut correlator, mut store) = correlator();
        correlator.on_body_observed(body_with("r1", "page", json!({"variables": {}})));
        correlator.on_body_observed(BodyObservation {
            request_id: "r2".to_string(),
            originator: "page".to_string(),
            url: "u".to_string(),
            raw_body: "{not json".to_string(),
        });
        // Search slot present but no hash anywhere.
        correlator.on_body_observed(body_with(
            "r3",
            "page",
            json!({"variables": {"query": "x"}}),
        ));
        assert_eq!(correlator.pending_count(), 0);
        correlator.on_headers_observed(headers("r1"), &mut store);
        assert!(store.get(TemplateKind::SearchQuery).is_none());
    }

    #[test]
    fn hash_candidate_paths_are_tried_in_order() {
        let (kind, hash, _) = parse_capture_body(
            &json!({"variables": {"postId": "p"}, "doc_id": "hash-alt"}).to_string(),
        )
        .unwrap();
        assert_eq!(kind, TemplateKind::DetailFetch);
        assert_eq!(hash, "hash-alt");
    }

    #[test]
    fn newer_capture_of_same_kind_replaces_older() {
        let (mut correlator, mut store) = correlator();
        correlator.on_body_observed(search_body("r1"));
        correlator.on_headers_observed(headers("r1"), &mut store);
        let mut second = search_body("r2");
        second.raw_body = json!({
            "variables": {"query": "electrician"},
            "extensions": {"persistedQuery": {"sha256Hash": "hash-search-2"}}
        })
        .to_string();
        correlator.on_body_observed(second);
        correlator.on_headers_observed(headers("r2"), &mut store);
        assert_eq!(
            store.get(TemplateKind::SearchQuery).unwrap().query_hash,
            "hash-search-2"
        );
    }

    /// All merge orders of the two streams, for two requests of different
    /// kinds. A template must appear exactly when the body half precedes
    /// its header half in the merged order.
    #[test]
    fn every_interleaving_correlates_by_arrival_order() {
        let bodies = vec![
            Observation::Body(search_body("s1")),
            Observation::Body(detail_body("d1")),
        ];
        let header_events = vec![
            Observation::Headers(headers("s1")),
            Observation::Headers(headers("d1")),
        ];
        for merged in interleavings(&bodies, &header_events) {
            let (mut correlator, mut store) = correlator();
            for observation in &merged {
                correlator.observe(observation.clone(), &mut store);
            }
            let position = |target: &Observation| {
                merged
                    .iter()
                    .position(|observation| observation == target)
                    .unwrap()
            };
            let search_expected = position(&bodies[0]) < position(&header_events[0]);
            let detail_expected = position(&bodies[1]) < position(&header_events[1]);
            assert_eq!(
                store.get(TemplateKind::SearchQuery).is_some(),
                search_expected,
                "search mismatch in {merged:?}"
            );
            assert_eq!(
                store.get(TemplateKind::DetailFetch).is_some(),
                detail_expected,
                "detail mismatch in {merged:?}"
            );
        }
    }

    fn interleavings<T: Clone>(left: &[T], right: &[T]) -> Vec<Vec<T>> {
        if left.is_empty() {
            return vec![right.to_vec()];
        }
        if right.is_empty() {
            return vec![left.to_vec()];
        }
        let mut merged = Vec::new();
        for mut tail in interleavings(&left[1..], right) {
            tail.insert(0, left[0].clone());
            merged.push(tail);
        }
        for mut tail in interleavings(left, &right[1..]) {
            tail.insert(0, right[0].clone());
            merged.push(tail);
        }
        merged
    }
}
