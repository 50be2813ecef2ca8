//! Domain data model: threads, comments, run results, and chat turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One fetched discussion: the original post plus its comment forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub url: String,
    pub original_post: Post,
    pub comments: Vec<Comment>,
}

/// The post that opened a thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub author: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// One comment node; `replies` nest without depth limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub location: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business: Option<BusinessInfo>,
    /// Depth in the tree; top-level comments sit at 0.
    pub nesting_level: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Comment>,
}

/// Business recommendation attached to a comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endorsement_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// One item that failed during a run that otherwise kept going.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

/// Aggregated outcome of one search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub threads: Vec<Thread>,
    pub errors: Vec<ItemFailure>,
    pub total_comment_count: usize,
}

/// Accumulates threads and failures while a run executes.
#[derive(Debug, Clone)]
pub struct SearchSession {
    pub query: String,
    pub threads: Vec<Thread>,
    pub errors: Vec<ItemFailure>,
}

impl SearchSession {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            threads: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Finalizes the run, counting every comment across all threads.
    pub fn into_result(self) -> SearchResult {
        let total_comment_count = self
            .threads
            .iter()
            .map(|thread| crate::extract::count_all(&thread.comments))
            .sum();
        SearchResult {
            query: self.query,
            threads: self.threads,
            errors: self.errors,
            total_comment_count,
        }
    }
}

/// One chat exchange kept in conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}
