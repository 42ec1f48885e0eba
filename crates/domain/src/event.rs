//! The progress-event protocol — a closed set of typed events streamed to
//! the client as newline-delimited JSON, one object per event.
//!
//! `step` events carry a stable identity (`step_id`, optional `parent_id`)
//! and form a tree that a UI can render as a live timeline. For any step id
//! the `running` event always precedes its `completed`/`failed` event.

use serde::Serialize;
use serde_json::Value;

use crate::item::SourceRef;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step kinds and statuses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed enumeration of pipeline stage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Root span covering the whole request.
    Pipeline,
    HistoryLoad,
    CacheLookup,
    Rewrite,
    Router,
    /// Parent span of the retrieval fan-out.
    Retrieval,
    /// One child span per knowledge source.
    SourceQuery,
    Rerank,
    /// Tabular-strategy ambiguity check.
    TabularCheck,
    StructuredQuery,
    /// General-strategy sub-call roles, classified by position.
    Selection,
    Reasoning,
    Synthesis,
    Shortcut,
    Visualization,
    Analytics,
    Persist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event — the wire protocol
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during one answer request (provider-agnostic).
///
/// Serialized once per emission and discarded; events are best-effort
/// telemetry, not a source of truth — the final answer text is.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A timeline step started, completed, or failed.
    #[serde(rename = "step")]
    Step {
        step_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        step_type: StepKind,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        /// Duration in milliseconds; present on terminal statuses.
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// An answer text chunk. Both fields carry the same text; older
    /// clients read `content`.
    #[serde(rename = "token")]
    Token { content: String, text: String },

    /// A structured non-prose payload (e.g. a table) detected inline in
    /// the token stream.
    #[serde(rename = "content_block")]
    ContentBlock { block_type: String, data: Value },

    /// The final retrieved-item list handed to synthesis.
    #[serde(rename = "sources")]
    Sources { data: Vec<SourceRef> },

    /// A surfaced failure. Degraded stages may emit one and continue on
    /// their fallback path; an orchestrator-level error ends the stream.
    #[serde(rename = "error")]
    Error { message: String },
}

impl Event {
    pub fn token(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::Token {
            content: text.clone(),
            text,
        }
    }

    /// Serialize to one NDJSON line (no trailing newline).
    pub fn to_ndjson(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize event");
            String::from(r#"{"type":"error","message":"event serialization failed"}"#)
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_wire_shape() {
        let ev = Event::Step {
            step_id: "3".into(),
            parent_id: Some("1".into()),
            step_type: StepKind::SourceQuery,
            status: StepStatus::Completed,
            label: Some("docs".into()),
            duration: Some(42),
            payload: None,
        };
        let json: Value = serde_json::from_str(&ev.to_ndjson()).unwrap();
        assert_eq!(json["type"], "step");
        assert_eq!(json["step_id"], "3");
        assert_eq!(json["parent_id"], "1");
        assert_eq!(json["step_type"], "source_query");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["duration"], 42);
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn token_carries_both_fields() {
        let json: Value = serde_json::from_str(&Event::token("hi").to_ndjson()).unwrap();
        assert_eq!(json["content"], "hi");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn error_wire_shape() {
        let ev = Event::Error {
            message: "boom".into(),
        };
        let json: Value = serde_json::from_str(&ev.to_ndjson()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn step_status_terminal() {
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
    }
}
