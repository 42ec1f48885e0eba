//! Tabular strategy: the question targets a schema-backed source, so the
//! answer comes from a structured query, not similarity search.
//!
//! Flow: ambiguity check (proceed | clarify | facets) → model writes the
//! query → source executes it → synthesis streams prose over the result.
//! The result is cached per conversation so the next turn can reuse it
//! without re-querying.

use std::sync::Arc;

use serde_json::{json, Value};

use sl_domain::config::Config;
use sl_domain::error::{Error, Result};
use sl_domain::event::StepKind;
use sl_domain::item::truncate_str;
use sl_providers::{ChatMessage, ChatRequest, KnowledgeSource, TableSchema};

use crate::chat::Collaborators;
use crate::context::{meta, RequestContext};
use crate::processor::Steps;
use crate::processors::stream_llm;
use crate::spans::SpanId;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ambiguity verdict
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Proceed,
    /// The question is ambiguous; `message` asks the user to narrow it.
    Clarify { message: String },
    /// The question is too broad; offer grouping facets instead.
    Facets { message: String, facets: Vec<String> },
}

fn parse_verdict(text: &str) -> Option<Verdict> {
    // The model may wrap the JSON in prose or a fence.
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let json: Value = serde_json::from_str(&text[start..=end]).ok()?;
    match json["verdict"].as_str()? {
        "proceed" => Some(Verdict::Proceed),
        "clarify" => Some(Verdict::Clarify {
            message: json["message"].as_str().unwrap_or("Could you narrow the question down?").to_string(),
        }),
        "facets" => Some(Verdict::Facets {
            message: json["message"]
                .as_str()
                .unwrap_or("That question spans several groupings.")
                .to_string(),
            facets: json["facets"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
        }),
        _ => None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Strategy entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_tabular(
    ctx: &mut RequestContext,
    steps: &Steps,
    router_span: SpanId,
    source: &Arc<dyn KnowledgeSource>,
    schema: TableSchema,
    collab: &Arc<Collaborators>,
    config: &Arc<Config>,
) -> Result<()> {
    let cfg = &config.router;

    // ── Ambiguity check ───────────────────────────────────────────
    let check_span = steps
        .begin(StepKind::TabularCheck, Some(router_span), None)
        .await;
    let check_prompt = format!(
        "You triage questions against a table.\n{}\n\
         Question: {}\n\
         Reply with JSON only: {{\"verdict\": \"proceed\"|\"clarify\"|\"facets\", \
         \"message\": string, \"facets\": [string]}}. \
         Use \"proceed\" when the question maps to one query, \"clarify\" when \
         it is ambiguous, \"facets\" when it is too broad and should be \
         grouped.",
        schema.describe(),
        ctx.query,
    );
    let verdict = match tokio::time::timeout(
        std::time::Duration::from_millis(cfg.classifier_timeout_ms),
        collab.llm.complete(&check_prompt),
    )
    .await
    {
        Ok(Ok(text)) => parse_verdict(&text).unwrap_or_else(|| {
            tracing::warn!("unparseable ambiguity verdict, proceeding");
            Verdict::Proceed
        }),
        // An unavailable check never blocks the question.
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "ambiguity check failed, proceeding");
            Verdict::Proceed
        }
        Err(_) => {
            tracing::warn!("ambiguity check timed out, proceeding");
            Verdict::Proceed
        }
    };
    steps
        .complete(
            check_span,
            Some(json!({ "verdict": match &verdict {
                Verdict::Proceed => "proceed",
                Verdict::Clarify { .. } => "clarify",
                Verdict::Facets { .. } => "facets",
            }})),
        )
        .await;

    match verdict {
        Verdict::Clarify { message } => {
            steps.token(&message).await;
            ctx.append_output("router", &message);
            steps
                .content_block("clarification", json!({ "message": message }))
                .await;
            return Ok(());
        }
        Verdict::Facets { message, facets } => {
            steps.token(&message).await;
            ctx.append_output("router", &message);
            steps
                .content_block("facets", json!({ "message": message, "facets": facets }))
                .await;
            return Ok(());
        }
        Verdict::Proceed => {}
    }

    // ── Query writing (critical timeout) ──────────────────────────
    let selection_span = steps
        .begin(StepKind::Selection, Some(router_span), Some(source.id()))
        .await;
    let query_prompt = format!(
        "Write one query answering the question against this table.\n{}\n\
         Question: {}\nReply with the query only, no fences, no prose.",
        schema.describe(),
        ctx.query,
    );
    let statement = match tokio::time::timeout(
        std::time::Duration::from_millis(cfg.query_timeout_ms),
        collab.llm.complete(&query_prompt),
    )
    .await
    {
        Ok(Ok(text)) => strip_fences(&text),
        Ok(Err(e)) => {
            steps
                .fail(selection_span, Some(json!({ "error": e.to_string() })))
                .await;
            return Err(e);
        }
        Err(_) => {
            steps
                .fail(selection_span, Some(json!({ "error": "timeout" })))
                .await;
            return Err(Error::Timeout("structured query writing timed out".into()));
        }
    };
    steps
        .complete(
            selection_span,
            Some(json!({ "statement": truncate_str(&statement, 200) })),
        )
        .await;

    // ── Execution ─────────────────────────────────────────────────
    let exec_span = steps
        .begin(StepKind::StructuredQuery, Some(router_span), Some(source.id()))
        .await;
    let table = match source.query_structured(&statement).await {
        Ok(t) => t,
        Err(e) => {
            steps
                .fail(exec_span, Some(json!({ "error": e.to_string() })))
                .await;
            return Err(e);
        }
    };
    steps
        .complete(exec_span, Some(json!({ "rows": table.rows.len() })))
        .await;

    let table_json = json!({
        "source_id": source.id(),
        "statement": statement,
        "columns": table.columns,
        "rows": table.rows,
    });
    collab
        .result_cache
        .put(&ctx.conversation_id, table_json.clone());
    ctx.set_meta(meta::STRUCTURED_BLOCKS, table_json.clone());

    // ── Synthesis (critical timeout) ──────────────────────────────
    let synth_span = steps
        .begin(StepKind::Synthesis, Some(router_span), None)
        .await;
    let request = synthesis_request(&ctx.query, &table_json);
    let output = match tokio::time::timeout(
        std::time::Duration::from_millis(cfg.synthesis_timeout_ms),
        stream_llm(&collab.llm, request, steps, true),
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
            return Err(Error::Timeout("tabular synthesis timed out".into()));
        }
    };
    if let Some(usage) = &output.usage {
        steps.add_tokens(synth_span, usage.prompt_tokens, usage.completion_tokens);
        steps.add_tokens(ctx.root_span, usage.prompt_tokens, usage.completion_tokens);
        ctx.usage.add(usage);
    }
    steps.complete(synth_span, None).await;

    ctx.append_output("router", &output.text);
    Ok(())
}

/// Prose-only synthesis: the table itself reaches the client as a
/// content block from the visualization stage, so the model is never
/// asked to embed it.
fn synthesis_request(question: &str, table_json: &Value) -> ChatRequest {
    ChatRequest {
        messages: vec![
            ChatMessage::system("Explain the query result below in plain language."),
            ChatMessage::user(format!("Question: {question}\nResult: {table_json}")),
        ],
        ..Default::default()
    }
}

fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```sql")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
        .to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
