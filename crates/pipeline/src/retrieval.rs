//! Retrieval fan-out and merge.
//!
//! All configured sources are queried concurrently, each under its own
//! child span and timeout. One poisoned source never takes down its
//! siblings: its child span fails and an empty result is merged. Merge
//! order is source-declaration order, which makes the first-wins dedup
//! deterministic.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;

use sl_domain::config::RetrievalConfig;
use sl_domain::event::StepKind;
use sl_domain::item::{ItemId, RetrievedItem};

use crate::processor::Steps;
use crate::spans::SpanId;

pub struct FanoutOutcome {
    pub items: Vec<RetrievedItem>,
    pub failed_sources: Vec<String>,
    pub dropped_below_cutoff: usize,
}

/// Query every source concurrently and merge the settled results. The
/// parent `retrieval` span closes only after every child has settled.
pub async fn fan_out(
    query: &str,
    sources: &[Arc<dyn sl_providers::KnowledgeSource>],
    cfg: &RetrievalConfig,
    steps: &Steps,
    parent: Option<SpanId>,
) -> FanoutOutcome {
    let retrieval_span = steps.begin(StepKind::Retrieval, parent, None).await;

    if sources.is_empty() {
        tracing::warn!("no knowledge sources configured, retrieval returns nothing");
        steps
            .complete(retrieval_span, Some(serde_json::json!({ "sources": 0, "items": 0 })))
            .await;
        return FanoutOutcome {
            items: Vec::new(),
            failed_sources: Vec::new(),
            dropped_below_cutoff: 0,
        };
    }

    let queries = sources.iter().map(|source| {
        let source = Arc::clone(source);
        async move {
            let child = steps
                .begin(StepKind::SourceQuery, Some(retrieval_span), Some(source.id()))
                .await;

            let result = tokio::time::timeout(
                std::time::Duration::from_millis(cfg.source_timeout_ms),
                source.search(query, cfg.top_k, None),
            )
            .await;

            match result {
                Ok(Ok(hits)) => {
                    steps
                        .complete(child, Some(serde_json::json!({ "hits": hits.len() })))
                        .await;
                    let items: Vec<RetrievedItem> = hits
                        .into_iter()
                        .map(|h| RetrievedItem {
                            id: ItemId::new(source.id(), h.content_id),
                            text: h.text,
                            metadata: h.metadata,
                            score: h.score,
                        })
                        .collect();
                    (source.id().to_string(), Some(items))
                }
                Ok(Err(e)) => {
                    tracing::warn!(source = source.id(), error = %e, "source query failed");
                    steps
                        .fail(child, Some(serde_json::json!({ "error": e.to_string() })))
                        .await;
                    (source.id().to_string(), None)
                }
                Err(_) => {
                    tracing::warn!(
                        source = source.id(),
                        timeout_ms = cfg.source_timeout_ms,
                        "source query timed out"
                    );
                    steps
                        .fail(child, Some(serde_json::json!({ "error": "timeout" })))
                        .await;
                    (source.id().to_string(), None)
                }
            }
        }
    });

    // join_all preserves input order, so the merge below sees results in
    // source-declaration order regardless of completion order.
    let settled = join_all(queries).await;

    let mut items = Vec::new();
    let mut failed_sources = Vec::new();
    let mut seen: HashSet<ItemId> = HashSet::new();
    let mut duplicates = 0usize;

    for (source_id, result) in settled {
        match result {
            Some(source_items) => {
                for item in source_items {
                    if seen.insert(item.id.clone()) {
                        items.push(item);
                    } else {
                        duplicates += 1;
                    }
                }
            }
            None => failed_sources.push(source_id),
        }
    }
    if duplicates > 0 {
        tracing::debug!(duplicates, "dropped duplicate items during merge");
    }

    let before = items.len();
    items.retain(|i| i.score >= cfg.similarity_cutoff);
    let dropped_below_cutoff = before - items.len();
    if dropped_below_cutoff > 0 {
        tracing::debug!(
            dropped = dropped_below_cutoff,
            cutoff = cfg.similarity_cutoff,
            "dropped items below similarity cutoff"
        );
    }

    steps
        .complete(
            retrieval_span,
            Some(serde_json::json!({
                "sources": sources.len(),
                "items": items.len(),
                "failed": failed_sources,
                "dropped_below_cutoff": dropped_below_cutoff,
            })),
        )
        .await;

    FanoutOutcome {
        items,
        failed_sources,
        dropped_below_cutoff,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
