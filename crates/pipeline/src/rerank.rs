//! Relevance reranking — fail-open by contract. Reranking improves
//! ordering; it is never allowed to cost the user an answer.

use std::sync::Arc;

use sl_domain::config::RerankConfig;
use sl_domain::event::StepKind;
use sl_domain::item::RetrievedItem;

use crate::processor::Steps;
use crate::spans::SpanId;

pub struct RerankOutcome {
    pub items: Vec<RetrievedItem>,
    /// Provider failed or timed out; items are the pre-rerank head.
    pub fallback_used: bool,
    /// Reranking was disabled or there was nothing to rank.
    pub skipped: bool,
}

/// Rescore and reorder `items`. On any provider failure the outcome is the
/// first `top_n` items in their exact pre-rerank order.
pub async fn rerank_items(
    query: &str,
    mut items: Vec<RetrievedItem>,
    provider: Option<&Arc<dyn sl_providers::RerankProvider>>,
    cfg: &RerankConfig,
    steps: &Steps,
    parent: Option<SpanId>,
) -> RerankOutcome {
    let provider = match provider {
        Some(p) if cfg.enabled && !items.is_empty() => p,
        _ => {
            steps
                .record(StepKind::Rerank, Some("skipped"), 0, parent)
                .await;
            return RerankOutcome {
                items,
                fallback_used: false,
                skipped: true,
            };
        }
    };

    items.truncate(cfg.max_candidates);

    let span = steps.begin(StepKind::Rerank, parent, None).await;
    let documents: Vec<String> = items.iter().map(|i| i.text.clone()).collect();

    let result = tokio::time::timeout(
        std::time::Duration::from_millis(cfg.timeout_ms),
        provider.rerank(query, &documents, cfg.top_n),
    )
    .await;

    match result {
        Ok(Ok(hits)) => {
            let mut reranked: Vec<RetrievedItem> = hits
                .iter()
                .filter(|h| h.index < items.len())
                .filter(|h| h.relevance_score >= cfg.score_cutoff)
                .map(|h| {
                    let mut item = items[h.index].clone();
                    item.score = h.relevance_score;
                    item
                })
                .collect();
            reranked.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            reranked.truncate(cfg.top_n);

            steps
                .complete(
                    span,
                    Some(serde_json::json!({ "kept": reranked.len(), "fallback": false })),
                )
                .await;
            RerankOutcome {
                items: reranked,
                fallback_used: false,
                skipped: false,
            }
        }
        failure => {
            match failure {
                Ok(Err(e)) => tracing::warn!(error = %e, "rerank failed, using retrieval order"),
                _ => tracing::warn!(timeout_ms = cfg.timeout_ms, "rerank timed out, using retrieval order"),
            }
            steps
                .error("reranking unavailable; answering from retrieval order")
                .await;

            items.truncate(cfg.top_n);
            steps
                .complete(
                    span,
                    Some(serde_json::json!({ "kept": items.len(), "fallback": true })),
                )
                .await;
            RerankOutcome {
                items,
                fallback_used: true,
                skipped: false,
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
