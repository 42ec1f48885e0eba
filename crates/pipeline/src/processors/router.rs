//! The router — the agentic answering stage. Tries its strategies in a
//! fixed priority order (cached-result shortcut, tabular, general query
//! engine); a successful branch sets the stop flag, a failed branch lets
//! the standard RAG stage produce a degraded answer instead.
//!
//! The one exception to the fail-open posture: expiry of the critical
//! query/synthesis timeout propagates as an error and terminates the
//! request.

use std::sync::Arc;

use serde_json::json;

use sl_domain::config::{Config, SourceKind};
use sl_domain::error::{Error, Result};
use sl_domain::event::StepKind;
use sl_providers::{ChatMessage, ChatRequest, ToolCall, ToolSpec};

use crate::chat::Collaborators;
use crate::context::{meta, RequestContext};
use crate::processor::{Processor, Steps};
use crate::processors::{shortcut, stream_llm, tabular};
use crate::rewrite::rewrite_query;
use crate::spans::SpanId;

pub struct RouterProcessor {
    config: Arc<Config>,
    collab: Arc<Collaborators>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-call classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Position of an LLM sub-call within the tool loop. Classification is
/// positional and carried explicitly, never inferred from ambient state.
#[derive(Debug, Clone, Copy)]
pub struct CallSequence {
    pub index: u32,
    pub tool_used: bool,
}

impl CallSequence {
    pub fn first() -> Self {
        Self {
            index: 1,
            tool_used: false,
        }
    }

    pub fn after_tool_use(self) -> Self {
        Self {
            index: self.index + 1,
            tool_used: true,
        }
    }

    /// The first call before any tool use is the model selecting how to
    /// answer; everything after a tool result is reasoning over it.
    pub fn kind(self) -> StepKind {
        if self.index == 1 && !self.tool_used {
            StepKind::Selection
        } else {
            StepKind::Reasoning
        }
    }
}

/// A first call that is already a structured query is not strategy
/// selection, whatever its position says.
pub fn is_structured_query_syntax(text: &str) -> bool {
    let head = text.trim_start().to_ascii_uppercase();
    ["SELECT ", "WITH ", "PIVOT ", "FILTER "]
        .iter()
        .any(|kw| head.starts_with(kw))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl RouterProcessor {
    pub fn new(config: Arc<Config>, collab: Arc<Collaborators>) -> Self {
        Self { config, collab }
    }
}

#[async_trait::async_trait]
impl Processor for RouterProcessor {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn run(&self, ctx: &mut RequestContext, steps: &Steps) -> Result<()> {
        // Tenant-level opt-out: the plain RAG path answers instead.
        if self
            .collab
            .settings
            .get("router.disabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            tracing::debug!("router disabled by settings");
            return Ok(());
        }

        let router_span = steps
            .begin(StepKind::Router, Some(ctx.root_span), None)
            .await;

        match self.dispatch(ctx, steps, router_span).await {
            Ok(strategy) => {
                ctx.set_meta(meta::HANDLED_BY, json!(strategy));
                ctx.request_stop("router");
                steps
                    .complete(router_span, Some(json!({ "strategy": strategy })))
                    .await;
                Ok(())
            }
            Err(e @ Error::Timeout(_)) => {
                // Critical timeout: the request is over.
                steps
                    .fail(router_span, Some(json!({ "error": e.to_string() })))
                    .await;
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "router strategy failed, falling through to standard retrieval");
                steps
                    .error(format!("assisted answering failed: {e}"))
                    .await;
                steps
                    .fail(router_span, Some(json!({ "error": e.to_string() })))
                    .await;
                ctx.set_meta(meta::ROUTER_FAILED, json!(true));
                Ok(())
            }
        }
    }
}

impl RouterProcessor {
    /// Pick and run one strategy. Returns the name of the strategy that
    /// produced the answer.
    async fn dispatch(
        &self,
        ctx: &mut RequestContext,
        steps: &Steps,
        router_span: SpanId,
    ) -> Result<&'static str> {
        // 1. The previous turn left a structured result the user may just
        // want re-shaped. Checked before the tabular branch: cached
        // results only exist on tabular deployments, so the tabular
        // branch would otherwise shadow the shortcut everywhere it can
        // fire.
        if shortcut::try_shortcut(ctx, steps, router_span, &self.collab.llm, &self.config.router)
            .await?
        {
            return Ok("router_shortcut");
        }

        // 2. Schema-backed source present: structured answering.
        let tabular_source = self
            .collab
            .sources
            .iter()
            .find(|s| s.kind() == SourceKind::Tabular && s.schema().is_some());
        if let Some(source) = tabular_source {
            let schema = source.schema().unwrap();
            tabular::run_tabular(
                ctx,
                steps,
                router_span,
                source,
                schema,
                &self.collab,
                &self.config,
            )
            .await?;
            return Ok("router_tabular");
        }

        // 3. General query engine over the configured sources.
        self.run_general(ctx, steps, router_span).await?;
        Ok("router_general")
    }

    /// Tool-using loop: every knowledge source is exposed as a search
    /// tool; the model decides what to query and synthesizes the answer.
    async fn run_general(
        &self,
        ctx: &mut RequestContext,
        steps: &Steps,
        router_span: SpanId,
    ) -> Result<()> {
        let cfg = &self.config.router;

        let outcome = rewrite_query(
            &ctx.query,
            &ctx.history,
            &self.collab.llm,
            &self.config.rewrite,
            steps,
            Some(router_span),
        )
        .await;
        if outcome.fallback_used {
            ctx.set_meta(meta::REWRITE_FALLBACK, json!(true));
        }
        ctx.rewritten_query = Some(outcome.query.clone());

        let tools: Vec<ToolSpec> = self
            .collab
            .sources
            .iter()
            .map(|s| ToolSpec {
                name: format!("search_{}", s.id()),
                description: format!(
                    "Search the '{}' knowledge source for passages relevant to a query.",
                    s.id()
                ),
                parameters: json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"],
                }),
            })
            .collect();

        let mut messages = vec![ChatMessage::system(
            "Answer the user's question. Use the search tools when the \
             question needs source material, then answer from what they \
             return.",
        )];
        for turn in &ctx.history {
            messages.push(ChatMessage::from_turn(turn));
        }
        messages.push(ChatMessage::user(&outcome.query));

        let mut seq = CallSequence::first();
        let mut final_span: Option<SpanId> = None;
        // Everything streamed to the client, across tool rounds. The
        // persisted answer must match what the user saw, not just the
        // closing round.
        let mut transcript = String::new();

        for round in 0..cfg.max_tool_rounds {
            let span = steps.begin(seq.kind(), Some(router_span), None).await;

            let request = ChatRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                ..Default::default()
            };
            let result = tokio::time::timeout(
                std::time::Duration::from_millis(cfg.query_timeout_ms),
                stream_llm(&self.collab.llm, request, steps, true),
            )
            .await;

            let output = match result {
                Ok(Ok(out)) => out,
                Ok(Err(e)) => {
                    steps
                        .fail(span, Some(json!({ "error": e.to_string() })))
                        .await;
                    return Err(e);
                }
                Err(_) => {
                    steps.fail(span, Some(json!({ "error": "timeout" }))).await;
                    return Err(Error::Timeout("router query timed out".into()));
                }
            };

            if let Some(usage) = &output.usage {
                steps.add_tokens(span, usage.prompt_tokens, usage.completion_tokens);
                steps.add_tokens(ctx.root_span, usage.prompt_tokens, usage.completion_tokens);
                ctx.usage.add(usage);
            }
            steps.complete(span, None).await;

            // A first call that already speaks query syntax was never a
            // strategy selection.
            if seq.kind() == StepKind::Selection && is_structured_query_syntax(&output.text) {
                steps.relabel(span, StepKind::Reasoning).await;
            }

            transcript.push_str(&output.text);

            if output.tool_calls.is_empty() {
                final_span = Some(span);
                break;
            }

            messages.push(ChatMessage::Assistant {
                content: output.text.clone(),
                tool_calls: output.tool_calls.clone(),
            });
            for call in &output.tool_calls {
                let content = self.execute_search(call, steps, router_span).await;
                messages.push(ChatMessage::ToolResult {
                    call_id: call.call_id.clone(),
                    content,
                });
            }
            seq = seq.after_tool_use();

            if round + 1 == cfg.max_tool_rounds {
                return Err(Error::Other(format!(
                    "tool round limit ({}) exceeded",
                    cfg.max_tool_rounds
                )));
            }
        }

        // The sub-event queue has drained: the span that produced the
        // final text was in fact the synthesis. Re-emit it under its
        // real kind, same id. (Known approximation for deep tool loops.)
        if let Some(span) = final_span {
            steps.relabel(span, StepKind::Synthesis).await;
        }

        ctx.append_output("router", &transcript);
        Ok(())
    }

    /// Run one search tool call; failures become tool-result text the
    /// model can react to, never request errors.
    async fn execute_search(&self, call: &ToolCall, steps: &Steps, router_span: SpanId) -> String {
        let source_id = call
            .tool_name
            .strip_prefix("search_")
            .unwrap_or(&call.tool_name);
        let Some(source) = self.collab.sources.iter().find(|s| s.id() == source_id) else {
            return format!("error: unknown source '{source_id}'");
        };
        let query = call.arguments["query"].as_str().unwrap_or("").to_string();

        let child = steps
            .begin(StepKind::SourceQuery, Some(router_span), Some(source.id()))
            .await;

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(self.config.retrieval.source_timeout_ms),
            source.search(&query, self.config.retrieval.top_k, None),
        )
        .await;

        match result {
            Ok(Ok(hits)) => {
                steps
                    .complete(child, Some(json!({ "hits": hits.len() })))
                    .await;
                if hits.is_empty() {
                    return "no results".into();
                }
                hits.iter()
                    .enumerate()
                    .map(|(i, h)| format!("[{}] {}", i + 1, h.text))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            }
            Ok(Err(e)) => {
                steps
                    .fail(child, Some(json!({ "error": e.to_string() })))
                    .await;
                format!("error: search failed: {e}")
            }
            Err(_) => {
                steps.fail(child, Some(json!({ "error": "timeout" }))).await;
                "error: search timed out".into()
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_without_tools_is_selection() {
        let seq = CallSequence::first();
        assert_eq!(seq.kind(), StepKind::Selection);
    }

    #[test]
    fn calls_after_tool_use_are_reasoning() {
        let seq = CallSequence::first().after_tool_use();
        assert_eq!(seq.kind(), StepKind::Reasoning);
        assert_eq!(seq.after_tool_use().kind(), StepKind::Reasoning);
    }

    #[test]
    fn query_syntax_detection() {
        assert!(is_structured_query_syntax("SELECT region, sum(sales) FROM t"));
        assert!(is_structured_query_syntax("  with totals as (select 1)"));
        assert!(!is_structured_query_syntax("What were sales by region?"));
        assert!(!is_structured_query_syntax("selecting the right plan"));
    }
}
