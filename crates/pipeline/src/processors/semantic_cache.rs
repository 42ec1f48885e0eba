//! Semantic answer cache check. A near-identical earlier question is
//! answered from the cache without touching retrieval or synthesis.

use std::sync::Arc;

use sl_domain::config::Config;
use sl_domain::error::Result;
use sl_domain::event::StepKind;

use crate::chat::Collaborators;
use crate::context::{meta, RequestContext};
use crate::processor::{Processor, Steps};

pub struct SemanticCacheProcessor {
    config: Arc<Config>,
    collab: Arc<Collaborators>,
}

impl SemanticCacheProcessor {
    pub fn new(config: Arc<Config>, collab: Arc<Collaborators>) -> Self {
        Self { config, collab }
    }
}

#[async_trait::async_trait]
impl Processor for SemanticCacheProcessor {
    fn name(&self) -> &'static str {
        "semantic_cache"
    }

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()> {
        if !self.config.cache.enabled {
            return Ok(());
        }

        let span = steps
            .begin(StepKind::CacheLookup, Some(ctx.root_span), None)
            .await;

        // Embedding is on the critical path here, so it gets a short leash;
        // a miss is always a safe outcome.
        let embedding = match tokio::time::timeout(
            std::time::Duration::from_millis(self.config.cache.embed_timeout_ms),
            self.collab.embedding.embed(&ctx.query),
        )
        .await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "cache embedding failed, treating as miss");
                steps
                    .complete(span, Some(serde_json::json!({ "hit": false, "fallback": true })))
                    .await;
                return Ok(());
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.cache.embed_timeout_ms,
                    "cache embedding timed out, treating as miss"
                );
                steps
                    .complete(span, Some(serde_json::json!({ "hit": false, "fallback": true })))
                    .await;
                return Ok(());
            }
        };
        ctx.question_embedding = Some(embedding.clone());

        match self.collab.semantic_cache.lookup(&embedding).await {
            Ok(Some(hit)) => {
                tracing::debug!(similarity = hit.similarity, "semantic cache hit");
                steps.token(&hit.answer).await;
                ctx.append_output("semantic_cache", &hit.answer);
                ctx.set_meta(meta::CACHE_SIMILARITY, serde_json::json!(hit.similarity));
                ctx.set_meta(meta::HANDLED_BY, serde_json::json!("semantic_cache"));
                ctx.request_stop("semantic_cache");
                steps
                    .complete(
                        span,
                        Some(serde_json::json!({ "hit": true, "similarity": hit.similarity })),
                    )
                    .await;
            }
            Ok(None) => {
                steps
                    .complete(span, Some(serde_json::json!({ "hit": false })))
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache lookup failed, treating as miss");
                steps
                    .complete(span, Some(serde_json::json!({ "hit": false, "fallback": true })))
                    .await;
            }
        }

        Ok(())
    }
}
