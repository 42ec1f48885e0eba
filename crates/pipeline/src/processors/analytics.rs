//! Analytics capture — a trailing observer. The question embedding is
//! computed fire-and-forget; an analytics failure is never allowed to
//! surface to the user.

use std::sync::Arc;

use sl_domain::error::Result;
use sl_domain::event::StepKind;

use crate::chat::Collaborators;
use crate::context::{meta, RequestContext};
use crate::processor::{Processor, Steps};

pub struct AnalyticsProcessor {
    collab: Arc<Collaborators>,
}

impl AnalyticsProcessor {
    pub fn new(collab: Arc<Collaborators>) -> Self {
        Self { collab }
    }
}

#[async_trait::async_trait]
impl Processor for AnalyticsProcessor {
    fn name(&self) -> &'static str {
        "analytics"
    }

    fn runs_after_stop(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()> {
        let started = std::time::Instant::now();

        let spans = steps.tracker().snapshot();
        tracing::debug!(
            spans = spans.len(),
            output_chars = ctx.output_text().len(),
            items = ctx.items.len(),
            handled_by = ?ctx.meta(meta::HANDLED_BY),
            total_tokens = ctx.usage.total_tokens,
            "request analytics"
        );

        // The question embedding is only needed for offline analysis;
        // spawn and forget when the cache stage didn't already compute it.
        if ctx.question_embedding.is_none() {
            let embedding = Arc::clone(&self.collab.embedding);
            let question = ctx.query.clone();
            tokio::spawn(async move {
                if let Err(e) = embedding.embed(&question).await {
                    tracing::warn!(error = %e, "analytics embedding failed");
                }
            });
        }

        steps
            .record(
                StepKind::Analytics,
                Some("capture"),
                started.elapsed().as_millis() as u64,
                Some(ctx.root_span),
            )
            .await;
        Ok(())
    }
}
