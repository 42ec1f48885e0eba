//! The standard RAG stage: rewrite → fan-out retrieval → rerank →
//! synthesis. Runs only when no earlier stage answered, including when the
//! router failed and left the request to this degraded-but-safe path.

use std::sync::Arc;

use serde_json::json;

use sl_domain::config::Config;
use sl_domain::error::{Error, Result};
use sl_domain::event::StepKind;
use sl_domain::item::SourceRef;
use sl_providers::{ChatMessage, ChatRequest};

use crate::chat::Collaborators;
use crate::context::{meta, RequestContext};
use crate::processor::{Processor, Steps};
use crate::processors::stream_llm;
use crate::rerank::rerank_items;
use crate::retrieval::fan_out;
use crate::rewrite::rewrite_query;

pub struct StandardRagProcessor {
    config: Arc<Config>,
    collab: Arc<Collaborators>,
}

impl StandardRagProcessor {
    pub fn new(config: Arc<Config>, collab: Arc<Collaborators>) -> Self {
        Self { config, collab }
    }
}

#[async_trait::async_trait]
impl Processor for StandardRagProcessor {
    fn name(&self) -> &'static str {
        "standard_rag"
    }

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()> {
        // ── Rewrite (unless the router already did it) ────────────
        if ctx.rewritten_query.is_none() {
            let outcome = rewrite_query(
                &ctx.query,
                &ctx.history,
                &self.collab.llm,
                &self.config.rewrite,
                steps,
                Some(ctx.root_span),
            )
            .await;
            if outcome.fallback_used {
                ctx.set_meta(meta::REWRITE_FALLBACK, json!(true));
            }
            ctx.rewritten_query = Some(outcome.query);
        }
        let query = ctx.effective_query().to_string();

        // ── Retrieval fan-out ─────────────────────────────────────
        let fanout = fan_out(
            &query,
            &self.collab.sources,
            &self.config.retrieval,
            steps,
            Some(ctx.root_span),
        )
        .await;
        if fanout.dropped_below_cutoff > 0 {
            ctx.set_meta(
                meta::DROPPED_BELOW_CUTOFF,
                json!(fanout.dropped_below_cutoff),
            );
        }

        // ── Rerank (fail-open) ────────────────────────────────────
        let reranked = rerank_items(
            &query,
            fanout.items,
            self.collab.reranker.as_ref(),
            &self.config.rerank,
            steps,
            Some(ctx.root_span),
        )
        .await;
        if reranked.fallback_used {
            ctx.set_meta(meta::RERANK_FALLBACK, json!(true));
        }
        ctx.items = reranked.items;

        // The final context, exactly what synthesis will see.
        steps
            .sources(ctx.items.iter().map(SourceRef::from_item).collect())
            .await;

        // ── Synthesis ─────────────────────────────────────────────
        let synth_span = steps
            .begin(StepKind::Synthesis, Some(ctx.root_span), None)
            .await;

        let request = build_synthesis_request(ctx, &query);
        let output = match tokio::time::timeout(
            std::time::Duration::from_millis(self.config.router.synthesis_timeout_ms),
            stream_llm(&self.collab.llm, request, steps, true),
        )
        .await
        {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                steps
                    .fail(synth_span, Some(json!({ "error": e.to_string() })))
                    .await;
                return Err(e);
            }
            Err(_) => {
                steps
                    .fail(synth_span, Some(json!({ "error": "timeout" })))
                    .await;
                return Err(Error::Timeout("synthesis timed out".into()));
            }
        };

        if let Some(usage) = &output.usage {
            steps.add_tokens(synth_span, usage.prompt_tokens, usage.completion_tokens);
            // Roll-up to the request span is explicit.
            steps.add_tokens(ctx.root_span, usage.prompt_tokens, usage.completion_tokens);
            ctx.usage.add(usage);
        }
        steps.complete(synth_span, None).await;

        ctx.append_output("rag", &output.text);
        ctx.set_meta(meta::HANDLED_BY, json!("rag"));
        ctx.request_stop("rag");
        Ok(())
    }
}

fn build_synthesis_request(ctx: &RequestContext, query: &str) -> ChatRequest {
    let mut context_block = String::new();
    for (i, item) in ctx.items.iter().enumerate() {
        context_block.push_str(&format!("[{}] ({})\n{}\n\n", i + 1, item.id, item.text));
    }
    let system = if ctx.items.is_empty() {
        "Answer the question from general knowledge and say plainly that no \
         source material was found."
            .to_string()
    } else {
        format!(
            "Answer the question using the passages below. Cite passage \
             numbers where you rely on them.\n\n{context_block}"
        )
    };

    let mut messages = vec![ChatMessage::system(system)];
    for turn in &ctx.history {
        messages.push(ChatMessage::from_turn(turn));
    }
    messages.push(ChatMessage::user(query));

    ChatRequest {
        messages,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_domain::item::{ItemId, RetrievedItem};

    #[test]
    fn synthesis_request_numbers_passages() {
        let mut ctx = RequestContext::new("c1", "q", 1);
        ctx.items = vec![
            RetrievedItem {
                id: ItemId::new("docs", "a"),
                text: "first".into(),
                metadata: serde_json::Value::Null,
                score: 0.9,
            },
            RetrievedItem {
                id: ItemId::new("wiki", "b"),
                text: "second".into(),
                metadata: serde_json::Value::Null,
                score: 0.8,
            },
        ];
        let req = build_synthesis_request(&ctx, "q");
        match &req.messages[0] {
            ChatMessage::System { content } => {
                assert!(content.contains("[1] (docs:a)"));
                assert!(content.contains("[2] (wiki:b)"));
            }
            _ => panic!("expected system message"),
        }
    }

    #[test]
    fn empty_context_gets_honest_system_prompt() {
        let ctx = RequestContext::new("c1", "q", 1);
        let req = build_synthesis_request(&ctx, "q");
        match &req.messages[0] {
            ChatMessage::System { content } => {
                assert!(content.contains("no source material"));
            }
            _ => panic!("expected system message"),
        }
    }
}
