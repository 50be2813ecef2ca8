//! Pure extraction of posts and comment trees from fetched detail records.
//!
//! Upstream response shapes drift between deployments, so every field is
//! resolved through an ordered list of candidate paths; the first one that
//! yields a value wins. Nodes missing an author are treated as malformed
//! and skipped, replies included.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::model::{BusinessInfo, Comment, Post};

/// Where a post keeps its top-level comment list.
const POST_COMMENT_PATHS: &[&[&str]] = &[&["comments", "edges"], &["commentSection", "edges"]];

/// Where a comment keeps its nested replies. First non-empty list wins;
/// later paths are not consulted even if they also hold data.
const REPLY_PATHS: &[&[&str]] = &[
    &["replies", "edges"],
    &["childComments", "edges"],
    &["comments", "edges"],
];

const AUTHOR_PATHS: &[&[&str]] = &[&["author", "displayName"], &["author", "name"]];
const LOCATION_PATHS: &[&[&str]] = &[&["author", "cityName"], &["author", "location"]];
const BODY_PATHS: &[&[&str]] = &[&["body", "text"], &["body"], &["text"]];
const CREATED_PATHS: &[&[&str]] = &[&["createdAt"], &["creationDate"]];
const ANNOTATION_PATHS: &[&[&str]] = &[&["body", "annotations"], &["annotations"]];
const PHONE_PATHS: &[&[&str]] = &[&["action", "phone"], &["phone"]];
const BUSINESS_PATHS: &[&[&str]] = &[&["business"], &["recommendedBusiness"]];
const BUSINESS_NAME_PATHS: &[&[&str]] = &[&["name"], &["displayName"]];
const BUSINESS_CATEGORY_PATHS: &[&[&str]] = &[&["category"], &["categoryName"]];
const BUSINESS_COUNT_PATHS: &[&[&str]] = &[&["endorsementCount"], &["recommendCount"]];
const BUSINESS_ADDRESS_PATHS: &[&[&str]] = &[&["address"], &["location", "address"]];

/// Builds the ordered top-level comments for one fetched post record.
pub fn extract(post: &Value) -> Vec<Comment> {
    let Some(edges) = first_non_empty_list(post, POST_COMMENT_PATHS) else {
        return Vec::new();
    };
    edges
        .iter()
        .filter_map(|edge| build_comment(edge_node(edge), 0))
        .collect()
}

/// Builds the opening post of a fetched record.
pub fn extract_post(post: &Value) -> Post {
    Post {
        author: string_at(post, AUTHOR_PATHS).unwrap_or_default(),
        body: string_at(post, BODY_PATHS).unwrap_or_default(),
        created_at: timestamp_at(post, CREATED_PATHS),
    }
}

/// Number of comments in the forest, replies at every depth included.
pub fn count_all(comments: &[Comment]) -> usize {
    comments
        .iter()
        .map(|comment| 1 + count_all(&comment.replies))
        .sum()
}

fn build_comment(node: &Value, level: usize) -> Option<Comment> {
    if !node.is_object() {
        debug!("skipping non-object comment node");
        return None;
    }
    let Some(author) = string_at(node, AUTHOR_PATHS) else {
        debug!("skipping comment node without an author");
        return None;
    };
    let replies = first_non_empty_list(node, REPLY_PATHS)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|edge| build_comment(edge_node(edge), level + 1))
                .collect()
        })
        .unwrap_or_default();
    Some(Comment {
        author,
        location: string_at(node, LOCATION_PATHS).unwrap_or_default(),
        body: string_at(node, BODY_PATHS).unwrap_or_default(),
        created_at: timestamp_at(node, CREATED_PATHS),
        phone: phone_annotation(node),
        business: business_info(node),
        nesting_level: level,
        replies,
    })
}

/// First phone number found in the node's styled-text action annotations.
fn phone_annotation(node: &Value) -> Option<String> {
    let annotations = first_non_empty_list(node, ANNOTATION_PATHS)?;
    annotations
        .iter()
        .find_map(|annotation| string_at(annotation, PHONE_PATHS))
}

fn business_info(node: &Value) -> Option<BusinessInfo> {
    let business = BUSINESS_PATHS
        .iter()
        .find_map(|path| value_at_path(node, path))
        .filter(|value| value.is_object())?;
    let name = string_at(business, BUSINESS_NAME_PATHS)?;
    Some(BusinessInfo {
        name,
        category: string_at(business, BUSINESS_CATEGORY_PATHS),
        endorsement_count: BUSINESS_COUNT_PATHS
            .iter()
            .find_map(|path| value_at_path(business, path).and_then(Value::as_u64)),
        address: string_at(business, BUSINESS_ADDRESS_PATHS),
    })
}

/// Edge wrappers carry the node under `node`; bare nodes pass through.
fn edge_node(edge: &Value) -> &Value {
    edge.get("node").unwrap_or(edge)
}

/// Walks a path of object keys.
pub(crate) fn value_at_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

/// Walks a path of object keys, mutably.
pub(crate) fn value_at_path_mut<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    path.iter()
        .try_fold(value, |current, key| current.get_mut(*key))
}

/// First candidate path that holds a non-empty array.
pub(crate) fn first_non_empty_list<'a>(
    value: &'a Value,
    candidates: &[&[&str]],
) -> Option<&'a Vec<Value>> {
    candidates.iter().find_map(|path| {
        value_at_path(value, path)
            .and_then(Value::as_array)
            .filter(|list| !list.is_empty())
    })
}

/// First candidate path that holds a non-empty string.
pub(crate) fn string_at(value: &Value, candidates: &[&[&str]]) -> Option<String> {
    candidates.iter().find_map(|path| {
        value_at_path(value, path)
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    })
}

/// Accepts both epoch seconds and RFC 3339 strings.
fn timestamp_at(value: &Value, candidates: &[&[&str]]) -> Option<DateTime<Utc>> {
    candidates
        .iter()
        .find_map(|path| value_at_path(value, path))
        .and_then(|raw| match raw {
            Value::Number(number) => number
                .as_i64()
                .and_then(|seconds| DateTime::from_timestamp(seconds, 0)),
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|parsed| parsed.with_timezone(&Utc)),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn node(author: &str, body: &str) -> Value {
        json!({
            "author": {"displayName": author, "cityName": "Oakwood"},
            "body": {"text": body},
            "createdAt": 1_700_000_000,
        })
    }

    fn edge(node: Value) -> Value {
        json!({"node": node})
    }

    #[test]
    fn extracts_nested_replies_with_levels() {
        let mut reply = node("bob", "agreed");
        reply["replies"] = json!({"edges": [edge(node("cat", "same"))]});
        let mut top = node("ann", "call Mario");
        top["replies"] = json!({"edges": [edge(reply)]});
        let post = json!({"comments": {"edges": [edge(top)]}});

        let comments = extract(&post);
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, "ann");
        assert_eq!(comments[0].nesting_level, 0);
        assert_eq!(comments[0].replies[0].author, "bob");
        assert_eq!(comments[0].replies[0].nesting_level, 1);
        assert_eq!(comments[0].replies[0].replies[0].nesting_level, 2);
        assert_eq!(count_all(&comments), 3);
    }

    #[test]
    fn reply_candidates_fall_through_in_priority_order() {
        for reply_field in ["replies", "childComments", "comments"] {
            let mut top = node("ann", "hello");
            top[reply_field] = json!({"edges": [edge(node("bob", "hi"))]});
            let post = json!({"comments": {"edges": [edge(top)]}});
            let comments = extract(&post);
            assert_eq!(comments[0].replies.len(), 1, "field {reply_field}");
        }
    }

    #[test]
    fn first_non_empty_reply_list_wins() {
        let mut top = node("ann", "hello");
        top["replies"] = json!({"edges": []});
        top["childComments"] = json!({"edges": [edge(node("bob", "hi"))]});
        let post = json!({"comments": {"edges": [edge(top)]}});
        let comments = extract(&post);
        assert_eq!(comments[0].replies.len(), 1);
        assert_eq!(comments[0].replies[0].author, "bob");
    }

    #[test]
    fn malformed_nodes_are_skipped() {
        let post = json!({"comments": {"edges": [
            edge(node("ann", "fine")),
            edge(json!({"body": {"text": "no author"}})),
            json!("not even an object"),
        ]}});
        let comments = extract(&post);
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author, "ann");
    }

    #[test]
    fn phone_is_found_in_action_annotations() {
        let mut commenter = node("ann", "call them");
        commenter["body"]["annotations"] = json!([
            {"kind": "bold"},
            {"action": {"phone": "555-0199"}},
        ]);
        let post = json!({"comments": {"edges": [edge(commenter)]}});
        let comments = extract(&post);
        assert_eq!(comments[0].phone.as_deref(), Some("555-0199"));
    }

    #[test]
    fn business_info_is_parsed_when_present() {
        let mut commenter = node("ann", "recommend these folks");
        commenter["business"] = json!({
            "name": "Mario's Plumbing",
            "category": "Plumber",
            "endorsementCount": 12,
            "address": "12 Pipe St",
        });
        let post = json!({"comments": {"edges": [edge(commenter)]}});
        let business = extract(&post)[0].business.clone().unwrap();
        assert_eq!(business.name, "Mario's Plumbing");
        assert_eq!(business.category.as_deref(), Some("Plumber"));
        assert_eq!(business.endorsement_count, Some(12));
        assert_eq!(business.address.as_deref(), Some("12 Pipe St"));
    }

    #[test]
    fn business_without_name_is_dropped() {
        let mut commenter = node("ann", "meh");
        commenter["business"] = json!({"category": "Plumber"});
        let post = json!({"comments": {"edges": [edge(commenter)]}});
        assert!(extract(&post)[0].business.is_none());
    }

    #[test]
    fn timestamps_accept_epoch_and_rfc3339() {
        let epoch = node("ann", "x");
        let comments = extract(&json!({"comments": {"edges": [edge(epoch)]}}));
        assert!(comments[0].created_at.is_some());

        let mut stamped = node("bob", "y");
        stamped["createdAt"] = json!("2024-03-01T12:30:00Z");
        let comments = extract(&json!({"comments": {"edges": [edge(stamped)]}}));
        assert_eq!(
            comments[0].created_at.unwrap().to_rfc3339(),
            "2024-03-01T12:30:00+00:00"
        );

        let mut bad = node("cat", "z");
        bad["createdAt"] = json!("yesterday-ish");
        let comments = extract(&json!({"comments": {"edges": [edge(bad)]}}));
        assert!(comments[0].created_at.is_none());
    }

    #[test]
    fn recursion_has_no_depth_limit() {
        let mut deepest = node("leaf", "bottom");
        for index in 0..50 {
            let mut wrapper = node(&format!("level{index}"), "…");
            wrapper["replies"] = json!({"edges": [edge(deepest)]});
            deepest = wrapper;
        }
        let post = json!({"comments": {"edges": [edge(deepest)]}});
        let comments = extract(&post);
        assert_eq!(count_all(&comments), 51);
        let mut cursor = &comments[0];
        while let Some(next) = cursor.replies.first() {
            assert_eq!(next.nesting_level, cursor.nesting_level + 1);
            cursor = next;
        }
        assert_eq!(cursor.nesting_level, 50);
        assert_eq!(cursor.author, "leaf");
    }

    #[test]
    fn count_all_matches_hand_built_forests() {
        // Shapes generated from a tiny xorshift so the sizes vary.
        let mut seed = 0x9e3779b9u32;
        let mut rand = move |bound: usize| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed as usize) % bound
        };
        for _ in 0..20 {
            let width = 1 + rand(4);
            let depth = rand(5);
            let mut expected = 0usize;
            let forest: Vec<Comment> = (0..width)
                .map(|_| build_chain(depth, &mut expected))
                .collect();
            assert_eq!(count_all(&forest), expected);
        }
    }

    fn build_chain(depth: usize, counter: &mut usize) -> Comment {
        *counter += 1;
        Comment {
            author: "a".to_string(),
            location: String::new(),
            body: String::new(),
            created_at: None,
            phone: None,
            business: None,
            nesting_level: 0,
            replies: if depth == 0 {
                Vec::new()
            } else {
                vec![build_chain(depth - 1, counter)]
            },
        }
    }

    #[test]
    fn post_extraction_reads_author_and_body() {
        let post = json!({
            "author": {"name": "Dana"},
            "body": "Looking for a plumber",
            "comments": {"edges": []},
        });
        let extracted = extract_post(&post);
        assert_eq!(extracted.author, "Dana");
        assert_eq!(extracted.body, "Looking for a plumber");
        assert!(extracted.created_at.is_none());
        assert!(extract(&post).is_empty());
    }
}
