//! End-to-end pipeline: tap ingestion to templates, templates to a
//! replayed search run, results to the persisted state file.

use std::io::Cursor;
use std::sync::Arc;

use serde_json::{Value, json};
use threadtap_core::config::ThreadtapConfig;
use threadtap_core::error::TransportError;
use threadtap_core::service::ThreadtapService;
use threadtap_core::testing::ScriptedTransport;
use threadtap_events::{ProgressEvent, StatusEvent, VecSink};

const API_URL: &str = "https://neighborhood.example/api/gql";

fn capture_tap() -> String {
    [
        format!(
            r#"{{"phase":"body","request_id":"s1","originator":"page","url":"{API_URL}","raw_body":"{{\"variables\":{{\"query\":\"old query\"}},\"extensions\":{{\"persistedQuery\":{{\"sha256Hash\":\"hash-search\"}}}}}}"}}"#
        ),
        format!(
            r#"{{"phase":"headers","request_id":"s1","originator":"page","url":"{API_URL}","headers":[{{"name":"content-type","value":"application/json"}},{{"name":"x-csrftoken","value":"tok-1"}},{{"name":"cookie","value":"sid=1"}}]}}"#
        ),
        format!(
            r#"{{"phase":"body","request_id":"d1","originator":"page","url":"{API_URL}","raw_body":"{{\"variables\":{{\"postId\":\"seed\"}},\"extensions\":{{\"persistedQuery\":{{\"sha256Hash\":\"hash-detail\"}}}}}}"}}"#
        ),
        format!(
            r#"{{"phase":"headers","request_id":"d1","originator":"page","url":"{API_URL}","headers":[{{"name":"content-type","value":"application/json"}}]}}"#
        ),
    ]
    .join("\n")
}

fn search_response(ids: &[&str]) -> Value {
    let results: Vec<Value> = ids
        .iter()
        .map(|id| json!({"url": format!("https://neighborhood.example/p/{id}?s=feed")}))
        .collect();
    json!({"data": {"search": {"results": results}}})
}

fn thread_with_reply() -> Value {
    json!({"data": {"post": {
        "author": {"displayName": "Ann W.", "cityName": "Oakwood"},
        "body": {"text": "Anyone know a good plumber?"},
        "comments": {"edges": [
            {"node": {
                "author": {"displayName": "Bea K.", "cityName": "Oakwood"},
                "body": {
                    "text": "Call Mario, he fixed our water heater.",
                    "annotations": [{"action": {"phone": "555-0101"}}]
                },
                "business": {"name": "Mario Plumbing", "endorsementCount": 12},
                "replies": {"edges": [
                    {"node": {
                        "author": {"displayName": "Cal D.", "cityName": "Riverside"},
                        "body": {"text": "Seconding Mario."}
                    }}
                ]}
            }}
        ]}
    }}})
}

fn thread_with_two_comments() -> Value {
    json!({"data": {"post": {
        "author": {"displayName": "Dee F."},
        "body": {"text": "Plumber recommendations?"},
        "comments": {"edges": [
            {"node": {"author": {"displayName": "Eve G."}, "body": {"text": "Try Rooter Bros."}}},
            {"node": {"author": {"displayName": "Fay H."}, "body": {"text": "We used Pipeworks."}}}
        ]}
    }}})
}

fn service_with(transport: ScriptedTransport) -> (ThreadtapService, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ThreadtapConfig::default();
    config.replay.inter_request_delay_ms = 0;
    let mut service =
        ThreadtapService::with_transport(config, dir.path().join("state.json"), Arc::new(transport));
    service.ingest_reader(Cursor::new(capture_tap())).unwrap();
    (service, dir)
}

#[tokio::test]
async fn search_aggregates_threads_and_per_item_failures() {
    let transport = ScriptedTransport::new()
        .with_response(search_response(&["abc", "def", "ghi"]))
        .with_response(thread_with_reply())
        .with_error(TransportError::Status { status: 500 })
        .with_response(thread_with_two_comments());
    let recorder = transport.recorder();
    let (mut service, dir) = service_with(transport);

    let mut sink = VecSink::new();
    let summary = service.run_search("plumber", &mut sink).await.unwrap();
    assert_eq!(summary.threads, 2);
    assert_eq!(summary.comments, 4);
    assert_eq!(summary.errors, 1);

    let result = service.last_result().unwrap();
    assert_eq!(result.query, "plumber");
    assert_eq!(result.threads[0].id, "abc");
    assert_eq!(result.threads[0].original_post.author, "Ann W.");
    assert_eq!(result.threads[0].comments[0].replies[0].author, "Cal D.");
    assert_eq!(result.threads[0].comments[0].replies[0].nesting_level, 1);
    assert_eq!(result.threads[0].comments[0].phone.as_deref(), Some("555-0101"));
    let business = result.threads[0].comments[0].business.as_ref().unwrap();
    assert_eq!(business.name, "Mario Plumbing");
    assert_eq!(business.endorsement_count, Some(12));
    assert_eq!(result.threads[1].id, "ghi");
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].id, "def");
    assert!(result.errors[0].reason.contains("500"));
    assert_eq!(result.total_comment_count, 4);

    // One search request plus one detail request per id.
    let requests = recorder.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].payload["variables"]["query"], "plumber");
    assert_eq!(requests[1].payload["variables"]["postId"], "abc");
    assert_eq!(requests[3].payload["variables"]["postId"], "ghi");

    // The captured session header rides on the replay; the cookie header
    // never does.
    assert_eq!(
        requests[0].headers.get("x-csrftoken"),
        Some(&"tok-1".to_string())
    );
    assert!(!requests[0].headers.contains_key("cookie"));

    // The run result lands in the state file, session header still absent.
    let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
    assert!(raw.contains("\"query\": \"plumber\""));
    assert!(!raw.contains("tok-1"));
}

#[tokio::test]
async fn search_events_follow_the_started_progress_completed_order() {
    let transport = ScriptedTransport::new()
        .with_response(search_response(&["abc", "def"]))
        .with_error(TransportError::Network("reset".to_string()))
        .with_response(thread_with_two_comments());
    let (mut service, _dir) = service_with(transport);

    let mut sink = VecSink::new();
    service.run_search("plumber", &mut sink).await.unwrap();

    let events = sink.events();
    assert!(matches!(&events[0], StatusEvent::SearchStarted(query) if query.query == "plumber"));
    let progress: Vec<&ProgressEvent> = events
        .iter()
        .filter_map(|event| match event {
            StatusEvent::SearchProgress(progress) => Some(progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 2);
    assert_eq!((progress[0].current, progress[0].total), (1, 2));
    assert_eq!(progress[0].error_count, 1);
    assert_eq!((progress[1].current, progress[1].total), (2, 2));
    assert_eq!(progress[1].error_count, 1);
    match events.last().unwrap() {
        StatusEvent::SearchCompleted(summary) => {
            assert_eq!(summary.threads, 1);
            assert_eq!(summary.comments, 2);
            assert_eq!(summary.errors, 1);
        }
        other => panic!("expected SearchCompleted last, got {other:?}"),
    }
}

#[tokio::test]
async fn second_search_replaces_the_primary_result() {
    let transport = ScriptedTransport::new()
        .with_response(search_response(&["abc"]))
        .with_response(thread_with_reply())
        .with_response(search_response(&["ghi"]))
        .with_response(thread_with_two_comments());
    let (mut service, _dir) = service_with(transport);

    service
        .run_search("plumber", &mut VecSink::new())
        .await
        .unwrap();
    assert_eq!(service.last_result().unwrap().query, "plumber");

    service
        .run_search("electrician", &mut VecSink::new())
        .await
        .unwrap();
    let result = service.last_result().unwrap();
    assert_eq!(result.query, "electrician");
    assert_eq!(result.threads[0].id, "ghi");
}

#[tokio::test]
async fn recapturing_updates_the_template_used_by_the_next_run() {
    let transport = ScriptedTransport::new()
        .with_response(search_response(&[]))
        .with_response(search_response(&[]));
    let recorder = transport.recorder();
    let (mut service, _dir) = service_with(transport);

    service
        .run_search("first", &mut VecSink::new())
        .await
        .unwrap();

    // A fresh capture with a different hash replaces the search template.
    let newer = [
        format!(
            r#"{{"phase":"body","request_id":"s2","originator":"page","url":"{API_URL}","raw_body":"{{\"variables\":{{\"query\":\"x\"}},\"extensions\":{{\"persistedQuery\":{{\"sha256Hash\":\"hash-search-v2\"}}}}}}"}}"#
        ),
        format!(
            r#"{{"phase":"headers","request_id":"s2","originator":"page","url":"{API_URL}","headers":[{{"name":"content-type","value":"application/json"}}]}}"#
        ),
    ]
    .join("\n");
    service.ingest_reader(Cursor::new(newer)).unwrap();

    service
        .run_search("second", &mut VecSink::new())
        .await
        .unwrap();
    let requests = recorder.requests();
    assert_eq!(
        requests[0].payload["extensions"]["persistedQuery"]["sha256Hash"],
        "hash-search"
    );
    assert_eq!(
        requests[1].payload["extensions"]["persistedQuery"]["sha256Hash"],
        "hash-search-v2"
    );
}
