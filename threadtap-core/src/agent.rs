//! The chat turn loop: instruction composition, corpus formatting, and
//! bounded tool rounds.
//!
//! One invocation drives one user message to a final reply. Backends with
//! structured tool support get up to a fixed number of tool rounds; each
//! round may trigger capped replay searches whose results feed back into
//! the conversation. Backends without tool support fall back to a plain
//! streamed completion over the already-collected corpus.

use futures::StreamExt;
use serde_json::{Value, json};
use threadtap_events::{ChatDeltaEvent, EventSink, QueryEvent, StatusEvent};
use tracing::{debug, info, warn};

use crate::capture::template::TemplateStore;
use crate::config::AgentConfig;
use crate::error::CoreError;
use crate::llm::{
    ChatMessage, ChatRole, Completion, MessageContent, Provider, ToolCall, ToolDecl, ToolResult,
    tool_arguments_as_object,
};
use crate::model::{Comment, SearchResult, Turn, TurnRole};
use crate::replay::ReplayOrchestrator;
use crate::session::{ActiveGuard, SessionContext};

/// Name the model uses to request another search.
pub const SEARCH_TOOL_NAME: &str = "search_posts";

/// Overridable half of the instruction block; `agent.guidance` in the
/// config replaces this text.
pub const DEFAULT_GUIDANCE: &str = "\
You are a neighborhood research assistant. You answer questions about local \
service providers and recommendations using the discussion threads collected \
for you. Prefer providers that several different neighbors endorse, include \
names, phone numbers, and locations when the threads mention them, and say \
plainly when the collected threads do not answer the question.";

/// Fixed half of the instruction block: tool usage and output format.
/// Always appended after the guidance, configured or not.
const INTERNAL_RULES: &str = "\
When the collected threads do not cover the user's question, call the \
search_posts tool with a short topic query instead of guessing; never invent \
providers, phone numbers, or endorsements. After a search, use only the \
returned threads. Answer in plain text with short paragraphs or dashed \
lists.";

const EMPTY_CORPUS_NOTICE: &str = "\
No search data has been collected yet. Use the search_posts tool to gather \
discussion threads before answering questions that need local knowledge.";

/// Reply used when the tool-round bound is reached without a final text.
const TOOL_BOUND_MESSAGE: &str = "\
Sorry, I ran out of search attempts before reaching a confident answer. \
Try asking again with a narrower question, or run a search directly.";

/// Drives one chat turn against a provider, with replay-backed tool calls.
pub struct ConversationalAgent<'a> {
    provider: &'a dyn Provider,
    replay: &'a ReplayOrchestrator,
    config: &'a AgentConfig,
}

impl<'a> ConversationalAgent<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        replay: &'a ReplayOrchestrator,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            provider,
            replay,
            config,
        }
    }

    /// Runs one user message to completion and returns the final reply.
    ///
    /// History gains the user and assistant turns only when the turn
    /// succeeds; a failed turn leaves the conversation as it was.
    pub async fn run_turn(
        &self,
        message: &str,
        session: &mut SessionContext,
        templates: &TemplateStore,
        sink: &mut dyn EventSink,
    ) -> Result<String, CoreError> {
        let flag = session.agent_flag();
        let _guard =
            ActiveGuard::acquire(&flag).ok_or(CoreError::RunInProgress { what: "chat" })?;
        info!(backend = self.provider.name(), "chat turn started");

        let mut messages = self.compose_messages(session, message);
        let reply = if self.provider.supports_tool_calls() {
            self.tool_loop(&mut messages, session, templates, sink)
                .await?
        } else {
            self.stream_fallback(&messages, sink).await?
        };

        session.history.push(Turn::user(message));
        session.history.push(Turn::assistant(reply.as_str()));
        sink.emit(&StatusEvent::ChatCompleted);
        info!(chars = reply.len(), "chat turn finished");
        Ok(reply)
    }

    /// Builds the outbound turn list: instructions, corpus, prior history,
    /// then the new message. Backends without a system role get the
    /// instruction block prefixed onto the first user turn instead.
    fn compose_messages(&self, session: &SessionContext, message: &str) -> Vec<ChatMessage> {
        let instructions = compose_instructions(self.config.guidance.as_deref());
        let mut turns = vec![ChatMessage::user(format!(
            "Collected discussion threads:\n\n{}",
            format_corpus(session)
        ))];
        for turn in &session.history {
            turns.push(match turn.role {
                TurnRole::User => ChatMessage::user(turn.content.as_str()),
                TurnRole::Assistant => ChatMessage::assistant(turn.content.as_str()),
            });
        }
        turns.push(ChatMessage::user(message));

        if self.provider.supports_system_role() {
            turns.insert(0, ChatMessage::system(instructions));
        } else if let Some(first_user) = turns
            .iter_mut()
            .find(|turn| turn.role == ChatRole::User)
        {
            if let MessageContent::Text(text) = &mut first_user.content {
                *text = format!("{instructions}\n\n{text}");
            }
        }
        turns
    }

    async fn tool_loop(
        &self,
        messages: &mut Vec<ChatMessage>,
        session: &mut SessionContext,
        templates: &TemplateStore,
        sink: &mut dyn EventSink,
    ) -> Result<String, CoreError> {
        let tools = [search_tool()];
        // Cloned up front; tool results are appended to the session inside
        // the loop.
        let session_value = session.session_value().map(str::to_string);
        for _ in 0..self.config.max_tool_rounds {
            match self.provider.completion_with_tools(messages, &tools).await? {
                Completion::Text(text) => {
                    self.emit_sliced(&text, sink);
                    return Ok(text);
                }
                Completion::ToolCalls(calls) => {
                    info!(count = calls.len(), "model requested tool calls");
                    let mut results = Vec::with_capacity(calls.len());
                    for call in &calls {
                        let content = self
                            .execute_search_call(
                                call,
                                session,
                                templates,
                                session_value.as_deref(),
                                sink,
                            )
                            .await;
                        results.push(ToolResult {
                            call_id: call.id.clone(),
                            content,
                        });
                    }
                    messages.extend(self.provider.format_tool_result_messages(&calls, &results));
                }
            }
        }
        warn!(
            rounds = self.config.max_tool_rounds,
            "tool round bound reached without a final reply"
        );
        self.emit_sliced(TOOL_BOUND_MESSAGE, sink);
        Ok(TOOL_BOUND_MESSAGE.to_string())
    }

    /// Runs one requested search and renders its outcome for the model.
    /// Failures become text the model can react to; they never abort the
    /// turn.
    async fn execute_search_call(
        &self,
        call: &ToolCall,
        session: &mut SessionContext,
        templates: &TemplateStore,
        session_value: Option<&str>,
        sink: &mut dyn EventSink,
    ) -> String {
        if call.name != SEARCH_TOOL_NAME {
            debug!(name = %call.name, "unknown tool requested");
            return format!(
                "Unknown tool `{}`; only {SEARCH_TOOL_NAME} is available.",
                call.name
            );
        }
        let query = query_argument(&call.arguments);
        sink.emit(&StatusEvent::ToolStarted(QueryEvent {
            query: query.clone(),
        }));
        match self
            .replay
            .run_tool_search(&query, templates, session_value, sink)
            .await
        {
            Ok(result) => {
                let rendered = format_search_result(&result);
                session.prior_tool_results.push(result);
                rendered
            }
            Err(err) => {
                warn!(error = %err, "tool search failed");
                format!("Search failed: {err}")
            }
        }
    }

    async fn stream_fallback(
        &self,
        messages: &[ChatMessage],
        sink: &mut dyn EventSink,
    ) -> Result<String, CoreError> {
        let mut stream = self.provider.stream_completion(messages).await?;
        let mut reply = String::new();
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            reply.push_str(&fragment);
            sink.emit(&StatusEvent::ChatDelta(ChatDeltaEvent { text: fragment }));
        }
        Ok(reply)
    }

    /// Emits a non-incremental reply as fixed-size slices so the caller
    /// still gets progressive output. Slices split on char boundaries.
    fn emit_sliced(&self, text: &str, sink: &mut dyn EventSink) {
        let size = self.config.stream_slice_chars.max(1);
        let mut buffer = String::new();
        let mut count = 0;
        for ch in text.chars() {
            buffer.push(ch);
            count += 1;
            if count == size {
                sink.emit(&StatusEvent::ChatDelta(ChatDeltaEvent {
                    text: std::mem::take(&mut buffer),
                }));
                count = 0;
            }
        }
        if !buffer.is_empty() {
            sink.emit(&StatusEvent::ChatDelta(ChatDeltaEvent { text: buffer }));
        }
    }
}

/// Instruction block as sent to the model: guidance (configured or
/// default) followed by the fixed internal rules.
pub fn compose_instructions(guidance: Option<&str>) -> String {
    let guidance = guidance
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(DEFAULT_GUIDANCE);
    format!("{guidance}\n\n{INTERNAL_RULES}")
}

/// Default instruction block, for display to users writing an override.
pub fn default_instructions() -> String {
    compose_instructions(None)
}

fn search_tool() -> ToolDecl {
    ToolDecl {
        name: SEARCH_TOOL_NAME.to_string(),
        description: "Search neighborhood discussion threads for a topic and return the \
                      matching posts with their full comment trees."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Topic to search for, such as a service or trade",
                },
            },
            "required": ["query"],
        }),
    }
}

/// Query argument in either encoding the dialects produce: a JSON-encoded
/// string or a structured object.
fn query_argument(arguments: &Value) -> String {
    tool_arguments_as_object(arguments)
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Renders every collected search (primary plus tool-triggered) as the
/// corpus block of the outbound turn list.
pub fn format_corpus(session: &SessionContext) -> String {
    let mut sections: Vec<String> = Vec::new();
    if let Some(primary) = &session.primary_result {
        sections.push(format_search_result(primary));
    }
    sections.extend(session.prior_tool_results.iter().map(format_search_result));
    if sections.is_empty() {
        EMPTY_CORPUS_NOTICE.to_string()
    } else {
        sections.join("\n\n")
    }
}

/// Plain-text rendering of one search result, shared between the corpus
/// block and tool-result payloads.
pub fn format_search_result(result: &SearchResult) -> String {
    let mut out = format!(
        "Search \"{}\": {} threads, {} comments",
        result.query,
        result.threads.len(),
        result.total_comment_count
    );
    if !result.errors.is_empty() {
        out.push_str(&format!(" ({} items failed)", result.errors.len()));
    }
    for (index, thread) in result.threads.iter().enumerate() {
        out.push_str(&format!("\n\nThread {} ({})\n", index + 1, thread.url));
        let post = &thread.original_post;
        if post.author.is_empty() && post.body.is_empty() {
            out.push_str("Original post unavailable.");
        } else {
            out.push_str(&format!("Posted by {}: {}", post.author, post.body));
        }
        for comment in &thread.comments {
            append_comment(&mut out, comment);
        }
    }
    out
}

fn append_comment(out: &mut String, comment: &Comment) {
    let indent = "  ".repeat(comment.nesting_level);
    out.push_str(&format!(
        "\n{indent}- {} ({}): {}",
        comment.author, comment.location, comment.body
    ));
    if let Some(phone) = &comment.phone {
        out.push_str(&format!(" [phone: {phone}]"));
    }
    if let Some(business) = &comment.business {
        out.push_str(&format!(" [business: {}", business.name));
        if let Some(category) = &business.category {
            out.push_str(&format!(", {category}"));
        }
        if let Some(count) = business.endorsement_count {
            out.push_str(&format!(", {count} endorsements"));
        }
        if let Some(address) = &business.address {
            out.push_str(&format!(", {address}"));
        }
        out.push(']');
    }
    for reply in &comment.replies {
        append_comment(out, reply);
    }
}
