//! Per-request mutable state threaded through the processor chain.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use sl_domain::item::{ChatTurn, RetrievedItem};
use sl_domain::stream::Usage;

use crate::spans::SpanId;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metadata vocabulary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The closed set of cross-stage metadata keys. Stages ignore keys they
/// do not know.
pub mod meta {
    /// Structured result left by a previous turn (or produced this turn).
    pub const CACHED_RESULT: &str = "cached_result";
    /// Which stage produced the answer.
    pub const HANDLED_BY: &str = "handled_by";
    pub const REWRITE_FALLBACK: &str = "rewrite_fallback";
    pub const RERANK_FALLBACK: &str = "rerank_fallback";
    pub const DROPPED_BELOW_CUTOFF: &str = "dropped_below_cutoff";
    /// Table payload produced by the tabular strategy this turn.
    pub const STRUCTURED_BLOCKS: &str = "structured_blocks";
    pub const ROUTER_FAILED: &str = "router_failed";
    pub const CACHE_SIMILARITY: &str = "cache_similarity";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// State accumulated across the chain for one request. Owned by the
/// orchestrator task; processors receive `&mut` access in turn.
pub struct RequestContext {
    pub request_id: Uuid,
    pub conversation_id: String,
    /// The question as the user asked it. Never mutated.
    pub query: String,
    /// Rewrite-stage output; `None` until the rewrite runs.
    pub rewritten_query: Option<String>,
    /// Bounded window of prior turns, oldest first.
    pub history: Vec<ChatTurn>,
    /// Retrieved context, mutated in place by merge and rerank.
    pub items: Vec<RetrievedItem>,
    /// Embedding of the raw question, kept for cache store at persist time.
    pub question_embedding: Option<Vec<f32>>,
    /// Token usage accumulated across LLM sub-calls.
    pub usage: Usage,
    /// Root span of the request.
    pub root_span: SpanId,

    output_text: String,
    stopped_by: Option<&'static str>,
    metadata: HashMap<&'static str, Value>,
}

impl RequestContext {
    pub fn new(conversation_id: impl Into<String>, query: impl Into<String>, root_span: SpanId) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            query: query.into(),
            rewritten_query: None,
            history: Vec::new(),
            items: Vec::new(),
            question_embedding: None,
            usage: Usage::default(),
            root_span,
            output_text: String::new(),
            stopped_by: None,
            metadata: HashMap::new(),
        }
    }

    /// The query downstream stages should use.
    pub fn effective_query(&self) -> &str {
        self.rewritten_query.as_deref().unwrap_or(&self.query)
    }

    // ── stop flag ─────────────────────────────────────────────────

    /// Request that the chain skip the remaining answering stages.
    /// Only the first caller wins; a second stop request is refused.
    pub fn request_stop(&mut self, stage: &'static str) -> bool {
        if let Some(holder) = self.stopped_by {
            tracing::warn!(
                requested_by = stage,
                held_by = holder,
                "stop already set, refusing second setter"
            );
            return false;
        }
        self.stopped_by = Some(stage);
        true
    }

    pub fn stopped(&self) -> bool {
        self.stopped_by.is_some()
    }

    pub fn stopped_by(&self) -> Option<&'static str> {
        self.stopped_by
    }

    // ── output text ───────────────────────────────────────────────

    /// Append answer text. Once some other stage has set the stop flag the
    /// output is frozen; append attempts from non-owners are dropped.
    pub fn append_output(&mut self, stage: &'static str, text: &str) {
        if let Some(holder) = self.stopped_by {
            if holder != stage {
                tracing::warn!(
                    stage,
                    held_by = holder,
                    "output frozen after stop, dropping append"
                );
                return;
            }
        }
        self.output_text.push_str(text);
    }

    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    // ── metadata ──────────────────────────────────────────────────

    pub fn set_meta(&mut self, key: &'static str, value: Value) {
        self.metadata.insert(key, value);
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        self.meta(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
