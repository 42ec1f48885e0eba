//! The answer orchestrator — builds the fixed processor chain and runs one
//! question through it, streaming events back over a channel.
//!
//! Entry point: [`ChatService::stream_answer`] spawns the chain and returns
//! the event receiver immediately.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::Instrument;

use sl_domain::config::Config;
use sl_domain::error::Error;
use sl_domain::event::{Event, StepKind};
use sl_domain::item::truncate_str;

use crate::context::RequestContext;
use crate::processor::{step_event, EventSink, Processor, Steps};
use crate::processors;
use crate::spans::SpanTracker;

/// Channel depth for the client event stream.
const EVENT_BUFFER: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every external dependency the chain consumes, behind traits.
pub struct Collaborators {
    pub llm: Arc<dyn sl_providers::LlmProvider>,
    pub embedding: Arc<dyn sl_providers::EmbeddingProvider>,
    pub reranker: Option<Arc<dyn sl_providers::RerankProvider>>,
    pub sources: Vec<Arc<dyn sl_providers::KnowledgeSource>>,
    pub history: Arc<dyn sl_providers::HistoryStore>,
    pub semantic_cache: Arc<dyn sl_providers::SemanticCache>,
    pub result_cache: Arc<dyn sl_providers::ResultCache>,
    pub settings: Arc<dyn sl_providers::SettingsResolver>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnswerInput {
    pub conversation_id: String,
    pub question: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ChatService {
    processors: Vec<Arc<dyn Processor>>,
}

impl ChatService {
    /// Build the service with the fixed chain. The order is part of the
    /// contract: answering stages first, bookkeeping observers last.
    pub fn new(config: Arc<Config>, collab: Arc<Collaborators>) -> Self {
        let processors: Vec<Arc<dyn Processor>> = vec![
            Arc::new(processors::history::HistoryLoadProcessor::new(
                Arc::clone(&config),
                Arc::clone(&collab),
            )),
            Arc::new(processors::semantic_cache::SemanticCacheProcessor::new(
                Arc::clone(&config),
                Arc::clone(&collab),
            )),
            Arc::new(processors::persist::UserPersistProcessor::new(Arc::clone(
                &collab,
            ))),
            Arc::new(processors::router::RouterProcessor::new(
                Arc::clone(&config),
                Arc::clone(&collab),
            )),
            Arc::new(processors::rag::StandardRagProcessor::new(
                Arc::clone(&config),
                Arc::clone(&collab),
            )),
            Arc::new(processors::visualize::VisualizationProcessor::new()),
            Arc::new(processors::analytics::AnalyticsProcessor::new(Arc::clone(
                &collab,
            ))),
            Arc::new(processors::persist::FinalPersistProcessor::new(Arc::clone(
                &collab,
            ))),
        ];
        Self { processors }
    }

    /// Build a service over an explicit chain. Used by tests.
    pub fn with_processors(processors: Vec<Arc<dyn Processor>>) -> Self {
        Self { processors }
    }

    /// Run one question through the chain. Returns immediately; events
    /// arrive on the receiver as the chain progresses.
    pub fn stream_answer(&self, input: AnswerInput) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_BUFFER);
        let processors = self.processors.clone();

        let request_span = tracing::info_span!(
            "answer",
            conversation = %input.conversation_id,
        );
        tokio::spawn(run_chain(processors, input, tx).instrument(request_span));

        rx
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chain execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_chain(
    processors: Vec<Arc<dyn Processor>>,
    input: AnswerInput,
    tx: mpsc::Sender<Event>,
) {
    let tracker = Arc::new(SpanTracker::new());
    let sink = EventSink::new(tx);
    let steps = Steps::new(Arc::clone(&tracker), sink.clone());

    let root = steps
        .begin(
            StepKind::Pipeline,
            None,
            Some(&truncate_str(&input.question, 120)),
        )
        .await;
    let mut ctx = RequestContext::new(input.conversation_id, input.question, root);

    let mut failure: Option<Error> = None;
    for processor in &processors {
        // Client gone: abandon in-flight work, keep committed side effects.
        if sink.is_closed() {
            tracing::debug!("client disconnected, abandoning chain");
            break;
        }
        if ctx.stopped() && !processor.runs_after_stop() {
            tracing::debug!(stage = processor.name(), "skipping stage after stop");
            continue;
        }

        tracing::debug!(stage = processor.name(), "running stage");
        if let Err(e) = processor.run(&mut ctx, &steps).await {
            tracing::error!(stage = processor.name(), error = %e, "stage failed, terminating request");
            failure = Some(e);
            break;
        }
    }

    // Every running event that was emitted gets its promised terminal
    // event, even when a stage died mid-flight.
    for span in tracker.close_dangling(Some(root)) {
        sink.emit(step_event(&span)).await;
    }

    match failure {
        Some(e) => {
            sink.emit(Event::Error {
                message: e.to_string(),
            })
            .await;
            steps
                .fail(root, Some(serde_json::json!({ "error": e.to_string() })))
                .await;
        }
        None => {
            steps
                .complete(
                    root,
                    Some(serde_json::json!({
                        "input_tokens": ctx.usage.prompt_tokens,
                        "output_tokens": ctx.usage.completion_tokens,
                        "total_tokens": ctx.usage.total_tokens,
                        "handled_by": ctx.meta(crate::context::meta::HANDLED_BY),
                    })),
                )
                .await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
