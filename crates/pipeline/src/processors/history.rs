//! Loads the bounded conversation window and any structured result the
//! previous turn left behind.

use std::sync::Arc;

use sl_domain::config::Config;
use sl_domain::error::Result;
use sl_domain::event::StepKind;

use crate::chat::Collaborators;
use crate::context::{meta, RequestContext};
use crate::processor::{Processor, Steps};

pub struct HistoryLoadProcessor {
    config: Arc<Config>,
    collab: Arc<Collaborators>,
}

impl HistoryLoadProcessor {
    pub fn new(config: Arc<Config>, collab: Arc<Collaborators>) -> Self {
        Self { config, collab }
    }
}

#[async_trait::async_trait]
impl Processor for HistoryLoadProcessor {
    fn name(&self) -> &'static str {
        "history_load"
    }

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()> {
        let span = steps
            .begin(StepKind::HistoryLoad, Some(ctx.root_span), None)
            .await;

        match self
            .collab
            .history
            .recent(&ctx.conversation_id, self.config.history_window)
            .await
        {
            Ok(turns) => {
                let count = turns.len();
                ctx.history = turns;
                steps
                    .complete(span, Some(serde_json::json!({ "turns": count })))
                    .await;
            }
            Err(e) => {
                // A cold history store degrades the answer, it does not
                // block it.
                tracing::warn!(error = %e, "history load failed, continuing without history");
                steps
                    .fail(span, Some(serde_json::json!({ "error": e.to_string() })))
                    .await;
            }
        }

        if let Some(previous) = self.collab.result_cache.get(&ctx.conversation_id) {
            ctx.set_meta(meta::CACHED_RESULT, previous);
        }

        Ok(())
    }
}
