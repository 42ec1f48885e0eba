//! Persistence stages: the user turn is written before any answering stage
//! runs (so an aborted request still leaves a record), the assistant turn
//! is written last, after every stage has settled.

use std::sync::Arc;

use sl_domain::error::Result;
use sl_domain::event::StepKind;
use sl_domain::item::Role;

use crate::chat::Collaborators;
use crate::context::{meta, RequestContext};
use crate::processor::{Processor, Steps};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// User-turn persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UserPersistProcessor {
    collab: Arc<Collaborators>,
}

impl UserPersistProcessor {
    pub fn new(collab: Arc<Collaborators>) -> Self {
        Self { collab }
    }
}

#[async_trait::async_trait]
impl Processor for UserPersistProcessor {
    fn name(&self) -> &'static str {
        "user_persist"
    }

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()> {
        let span = steps
            .begin(StepKind::Persist, Some(ctx.root_span), Some("user"))
            .await;

        match self
            .collab
            .history
            .append_turn(&ctx.conversation_id, Role::User, &ctx.query, None)
            .await
        {
            Ok(()) => steps.complete(span, None).await,
            Err(e) => {
                tracing::warn!(error = %e, "user turn persistence failed");
                steps
                    .fail(span, Some(serde_json::json!({ "error": e.to_string() })))
                    .await;
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Final persistence — last stage, observes everything
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FinalPersistProcessor {
    collab: Arc<Collaborators>,
}

impl FinalPersistProcessor {
    pub fn new(collab: Arc<Collaborators>) -> Self {
        Self { collab }
    }
}

#[async_trait::async_trait]
impl Processor for FinalPersistProcessor {
    fn name(&self) -> &'static str {
        "final_persist"
    }

    fn runs_after_stop(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()> {
        let answer = ctx.output_text().to_string();
        if answer.is_empty() {
            tracing::debug!("no answer text produced, nothing to persist");
            return Ok(());
        }

        let span = steps
            .begin(StepKind::Persist, Some(ctx.root_span), Some("final"))
            .await;

        let handled_by = ctx.meta(meta::HANDLED_BY).cloned();
        let turn_meta = handled_by
            .as_ref()
            .map(|h| serde_json::json!({ "handled_by": h }));

        if let Err(e) = self
            .collab
            .history
            .append_turn(&ctx.conversation_id, Role::Assistant, &answer, turn_meta)
            .await
        {
            tracing::warn!(error = %e, "assistant turn persistence failed");
            steps
                .fail(span, Some(serde_json::json!({ "error": e.to_string() })))
                .await;
            return Ok(());
        }

        // Freshly synthesized answers feed the semantic cache; answers
        // served FROM the cache must not be re-inserted.
        let from_cache = handled_by
            .as_ref()
            .and_then(|h| h.as_str())
            .map(|h| h == "semantic_cache")
            .unwrap_or(false);
        if !from_cache {
            if let Some(embedding) = ctx.question_embedding.clone() {
                if let Err(e) = self
                    .collab
                    .semantic_cache
                    .store(embedding, &ctx.query, &answer)
                    .await
                {
                    tracing::warn!(error = %e, "semantic cache store failed");
                }
            }
        }

        steps.complete(span, None).await;
        Ok(())
    }
}
