//! Span tracking — one record per pipeline stage for a single request.
//!
//! Every stage that announces itself as `running` must eventually produce a
//! terminal record; [`SpanTracker::close_dangling`] is the orchestrator's
//! backstop for stages that died without closing their span.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use sl_domain::event::{StepKind, StepStatus};

pub type SpanId = u32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Span record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Span {
    pub id: SpanId,
    pub parent: Option<SpanId>,
    pub kind: StepKind,
    pub label: Option<String>,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub payload: Option<Value>,
}

impl Span {
    fn close(&mut self, status: StepStatus, payload: Option<Value>) {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        if payload.is_some() {
            self.payload = payload;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns all spans of one request. Ids are sequential and never reused, so
/// span ordering doubles as creation ordering.
pub struct SpanTracker {
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    next_id: SpanId,
    spans: Vec<Span>,
}

impl Default for SpanTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                next_id: 1,
                spans: Vec::new(),
            }),
        }
    }

    pub fn start(
        &self,
        kind: StepKind,
        parent: Option<SpanId>,
        label: Option<&str>,
    ) -> (SpanId, Span) {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let span = Span {
            id,
            parent,
            kind,
            label: label.map(String::from),
            status: StepStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            input_tokens: 0,
            output_tokens: 0,
            payload: None,
        };
        inner.spans.push(span.clone());
        (id, span)
    }

    /// Close a span as completed. Idempotent: closing an already-terminal
    /// span returns the existing record untouched.
    pub fn end(&self, id: SpanId, payload: Option<Value>) -> Option<Span> {
        self.close(id, StepStatus::Completed, payload)
    }

    /// Close a span as failed. Same idempotence rule as [`end`](Self::end).
    pub fn fail(&self, id: SpanId, payload: Option<Value>) -> Option<Span> {
        self.close(id, StepStatus::Failed, payload)
    }

    fn close(&self, id: SpanId, status: StepStatus, payload: Option<Value>) -> Option<Span> {
        let mut inner = self.inner.lock();
        let span = inner.spans.iter_mut().find(|s| s.id == id)?;
        if span.status.is_terminal() {
            tracing::debug!(span_id = id, "span already closed, ignoring");
            return Some(span.clone());
        }
        span.close(status, payload);
        Some(span.clone())
    }

    /// Record a stage whose timing was measured elsewhere: the span is
    /// created already terminal.
    #[allow(clippy::too_many_arguments)]
    pub fn record_completed(
        &self,
        kind: StepKind,
        label: Option<&str>,
        duration_ms: u64,
        input_tokens: u32,
        output_tokens: u32,
        parent: Option<SpanId>,
    ) -> Span {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let now = Utc::now();
        let span = Span {
            id,
            parent,
            kind,
            label: label.map(String::from),
            status: StepStatus::Completed,
            started_at: now - chrono::Duration::milliseconds(duration_ms as i64),
            ended_at: Some(now),
            duration_ms: Some(duration_ms),
            input_tokens,
            output_tokens,
            payload: None,
        };
        inner.spans.push(span.clone());
        span
    }

    /// Roll token counts onto a span. Roll-ups to parents are always
    /// explicit calls, never automatic.
    pub fn add_tokens(&self, id: SpanId, input: u32, output: u32) {
        let mut inner = self.inner.lock();
        if let Some(span) = inner.spans.iter_mut().find(|s| s.id == id) {
            span.input_tokens += input;
            span.output_tokens += output;
        }
    }

    /// Change the kind of an existing span, keeping its id and timing.
    /// Returns the updated record, `None` for an unknown id.
    pub fn relabel(&self, id: SpanId, kind: StepKind) -> Option<Span> {
        let mut inner = self.inner.lock();
        let span = inner.spans.iter_mut().find(|s| s.id == id)?;
        span.kind = kind;
        Some(span.clone())
    }

    /// Close every span that has no end time, newest first (children
    /// before their parents for typical nesting). Skips `except`.
    /// Returns the spans closed here, in closing order.
    pub fn close_dangling(&self, except: Option<SpanId>) -> Vec<Span> {
        let mut inner = self.inner.lock();
        let mut closed = Vec::new();
        for span in inner.spans.iter_mut().rev() {
            if Some(span.id) == except || span.status.is_terminal() {
                continue;
            }
            tracing::warn!(span_id = span.id, kind = ?span.kind, "closing dangling span");
            span.close(
                StepStatus::Completed,
                Some(serde_json::json!({ "defensive_close": true })),
            );
            closed.push(span.clone());
        }
        closed
    }

    pub fn get(&self, id: SpanId) -> Option<Span> {
        self.inner.lock().spans.iter().find(|s| s.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Span> {
        self.inner.lock().spans.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
