//! Standalone context rewrite — resolving pronouns and ellipsis against
//! the conversation window before retrieval sees the query. Shared by the
//! router strategies and the standard RAG path.

use std::sync::Arc;

use sl_domain::config::RewriteConfig;
use sl_domain::event::StepKind;
use sl_domain::item::{ChatTurn, Role};

use crate::processor::Steps;
use crate::spans::SpanId;

pub struct RewriteOutcome {
    pub query: String,
    /// History was too short; no LLM call was made.
    pub skipped: bool,
    /// The rewrite call failed or timed out; the raw query is in use.
    pub fallback_used: bool,
}

/// Rewrite `query` into a self-contained form. Never fails the request:
/// every degraded path returns the original query.
pub async fn rewrite_query(
    query: &str,
    history: &[ChatTurn],
    llm: &Arc<dyn sl_providers::LlmProvider>,
    cfg: &RewriteConfig,
    steps: &Steps,
    parent: Option<SpanId>,
) -> RewriteOutcome {
    if history.len() < cfg.min_history_turns {
        steps
            .record(StepKind::Rewrite, Some("skipped"), 0, parent)
            .await;
        return RewriteOutcome {
            query: query.to_string(),
            skipped: true,
            fallback_used: false,
        };
    }

    let span = steps.begin(StepKind::Rewrite, parent, None).await;
    let prompt = build_prompt(query, history);

    let result = tokio::time::timeout(
        std::time::Duration::from_millis(cfg.timeout_ms),
        llm.complete(&prompt),
    )
    .await;

    match result {
        Ok(Ok(text)) => {
            let rewritten = clean_rewrite(&text);
            if rewritten.is_empty() {
                tracing::warn!("rewrite returned empty text, keeping raw query");
                steps
                    .complete(span, Some(serde_json::json!({ "fallback": true })))
                    .await;
                return RewriteOutcome {
                    query: query.to_string(),
                    skipped: false,
                    fallback_used: true,
                };
            }
            steps
                .complete(span, Some(serde_json::json!({ "fallback": false })))
                .await;
            RewriteOutcome {
                query: rewritten,
                skipped: false,
                fallback_used: false,
            }
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "rewrite failed, keeping raw query");
            steps
                .complete(span, Some(serde_json::json!({ "fallback": true })))
                .await;
            RewriteOutcome {
                query: query.to_string(),
                skipped: false,
                fallback_used: true,
            }
        }
        Err(_) => {
            tracing::warn!(timeout_ms = cfg.timeout_ms, "rewrite timed out, keeping raw query");
            steps
                .complete(span, Some(serde_json::json!({ "fallback": true })))
                .await;
            RewriteOutcome {
                query: query.to_string(),
                skipped: false,
                fallback_used: true,
            }
        }
    }
}

fn build_prompt(query: &str, history: &[ChatTurn]) -> String {
    let mut lines = String::new();
    for turn in history {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        lines.push_str(&format!("{role}: {}\n", turn.content));
    }
    format!(
        "Rewrite the final user question so it is fully self-contained, \
         resolving pronouns and references using the conversation. \
         Reply with the rewritten question only.\n\n\
         Conversation:\n{lines}\nQuestion: {query}"
    )
}

fn clean_rewrite(text: &str) -> String {
    text.trim().trim_matches('"').trim().to_string()
}
