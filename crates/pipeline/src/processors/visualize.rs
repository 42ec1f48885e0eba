//! Visualization stage — a trailing observer that renders structured
//! results as `content_block` events. Handles both the tabular strategy's
//! fresh table and the shortcut's reuse of the previous turn's result.

use sl_domain::error::Result;
use sl_domain::event::StepKind;

use crate::context::{meta, RequestContext};
use crate::processor::{Processor, Steps};

#[derive(Default)]
pub struct VisualizationProcessor;

impl VisualizationProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Processor for VisualizationProcessor {
    fn name(&self) -> &'static str {
        "visualization"
    }

    fn runs_after_stop(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()> {
        let handled_by = ctx
            .meta(meta::HANDLED_BY)
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let block = if let Some(table) = ctx.meta(meta::STRUCTURED_BLOCKS) {
            Some(table.clone())
        } else if handled_by == "router_shortcut" {
            ctx.meta(meta::CACHED_RESULT).cloned()
        } else {
            None
        };

        let Some(data) = block else {
            return Ok(());
        };

        let span = steps
            .begin(StepKind::Visualization, Some(ctx.root_span), None)
            .await;
        steps.content_block("table", data).await;
        steps.complete(span, None).await;
        Ok(())
    }
}
