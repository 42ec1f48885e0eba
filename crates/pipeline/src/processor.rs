//! The processor contract and the event-emission plumbing shared by every
//! stage: a closed-tolerant sink over the client channel, and the `Steps`
//! handle that pairs span bookkeeping with the step events it implies.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use sl_domain::error::Result;
use sl_domain::event::{Event, StepKind};
use sl_domain::item::SourceRef;

use crate::context::RequestContext;
use crate::spans::{Span, SpanId, SpanTracker};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processor trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One stage of the fixed chain.
///
/// An `Err` escaping `run` is treated as unanticipated by the orchestrator
/// and terminates the request. Stages with a specified degraded path handle
/// their own failures and return `Ok`.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()>;

    /// Trailing bookkeeping stages override this to keep running after an
    /// earlier stage set the stop flag. They must behave as observers:
    /// no stop requests, no answer mutation.
    fn runs_after_stop(&self) -> bool {
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sends events to the client channel. A disconnected receiver is normal
/// (client went away); sends become no-ops and `is_closed` lets loops bail
/// out promptly.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Returns false when the client is gone.
    pub async fn emit(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps — span tracker + event sink, kept in lockstep
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The only way stages emit step events. Pairing span mutation with event
/// emission here is what makes the running-before-terminal ordering hold
/// for every step id.
#[derive(Clone)]
pub struct Steps {
    tracker: Arc<SpanTracker>,
    sink: EventSink,
}

impl Steps {
    pub fn new(tracker: Arc<SpanTracker>, sink: EventSink) -> Self {
        Self { tracker, sink }
    }

    pub fn tracker(&self) -> &SpanTracker {
        &self.tracker
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Start a span and announce it as running.
    pub async fn begin(
        &self,
        kind: StepKind,
        parent: Option<SpanId>,
        label: Option<&str>,
    ) -> SpanId {
        let (id, span) = self.tracker.start(kind, parent, label);
        self.sink.emit(step_event(&span)).await;
        id
    }

    /// Close a span as completed and announce it.
    pub async fn complete(&self, id: SpanId, payload: Option<Value>) {
        if let Some(span) = self.tracker.end(id, payload) {
            self.sink.emit(step_event(&span)).await;
        }
    }

    /// Close a span as failed and announce it.
    pub async fn fail(&self, id: SpanId, payload: Option<Value>) {
        if let Some(span) = self.tracker.fail(id, payload) {
            self.sink.emit(step_event(&span)).await;
        }
    }

    /// Record a stage timed elsewhere: emits the running event and the
    /// completed event back to back for the same id.
    pub async fn record(
        &self,
        kind: StepKind,
        label: Option<&str>,
        duration_ms: u64,
        parent: Option<SpanId>,
    ) -> SpanId {
        let span = self
            .tracker
            .record_completed(kind, label, duration_ms, 0, 0, parent);
        let mut running = span.clone();
        running.status = sl_domain::event::StepStatus::Running;
        running.ended_at = None;
        running.duration_ms = None;
        self.sink.emit(step_event(&running)).await;
        self.sink.emit(step_event(&span)).await;
        span.id
    }

    pub fn add_tokens(&self, id: SpanId, input: u32, output: u32) {
        self.tracker.add_tokens(id, input, output);
    }

    /// Retroactively change a closed span's kind and re-emit its completed
    /// event under the new kind, same id.
    pub async fn relabel(&self, id: SpanId, kind: StepKind) {
        if let Some(span) = self.tracker.relabel(id, kind) {
            self.sink.emit(step_event(&span)).await;
        }
    }

    // ── non-step events ───────────────────────────────────────────

    pub async fn token(&self, text: &str) -> bool {
        self.sink.emit(Event::token(text)).await
    }

    pub async fn content_block(&self, block_type: &str, data: Value) {
        self.sink
            .emit(Event::ContentBlock {
                block_type: block_type.to_string(),
                data,
            })
            .await;
    }

    pub async fn sources(&self, data: Vec<SourceRef>) {
        self.sink.emit(Event::Sources { data }).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.sink
            .emit(Event::Error {
                message: message.into(),
            })
            .await;
    }
}

/// Wire representation of a span's current state.
pub fn step_event(span: &Span) -> Event {
    Event::Step {
        step_id: span.id.to_string(),
        parent_id: span.parent.map(|p| p.to_string()),
        step_type: span.kind,
        status: span.status,
        label: span.label.clone(),
        duration: span.duration_ms,
        payload: span.payload.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
