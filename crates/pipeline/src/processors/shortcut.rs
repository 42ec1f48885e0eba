//! Cached-result shortcut: when the previous turn produced a structured
//! result and the new turn only asks to re-shape or visualize it, skip
//! retrieval and synthesis entirely.

use std::sync::Arc;

use serde_json::json;

use sl_domain::config::RouterConfig;
use sl_domain::error::Result;
use sl_domain::event::StepKind;

use crate::context::{meta, RequestContext};
use crate::processor::Steps;
use crate::spans::SpanId;

const ACK: &str = "Here is the previous result presented the way you asked.";

/// Returns true when the shortcut handled the turn. Classifier trouble of
/// any kind means "not a shortcut" and routing continues.
pub(crate) async fn try_shortcut(
    ctx: &mut RequestContext,
    steps: &Steps,
    router_span: SpanId,
    llm: &Arc<dyn sl_providers::LlmProvider>,
    cfg: &RouterConfig,
) -> Result<bool> {
    let Some(cached) = ctx.meta(meta::CACHED_RESULT) else {
        return Ok(false);
    };
    let statement = cached["statement"].as_str().unwrap_or("").to_string();

    let prompt = format!(
        "The previous turn answered this data question: {statement}\n\
         The user now says: {}\n\
         Does the new message only ask to reformat, re-sort, or visualize \
         the same result, with no new data needed? Answer yes or no.",
        ctx.query,
    );

    let is_shortcut = match tokio::time::timeout(
        std::time::Duration::from_millis(cfg.classifier_timeout_ms),
        llm.complete(&prompt),
    )
    .await
    {
        Ok(Ok(text)) => text.trim().to_ascii_lowercase().starts_with('y'),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "shortcut classifier failed, not a shortcut");
            false
        }
        Err(_) => {
            tracing::debug!("shortcut classifier timed out, not a shortcut");
            false
        }
    };
    if !is_shortcut {
        return Ok(false);
    }

    let span = steps
        .begin(StepKind::Shortcut, Some(router_span), None)
        .await;
    steps.token(ACK).await;
    ctx.append_output("router", ACK);
    // The cached result stays in metadata; the visualization stage turns
    // it into the content block.
    steps.complete(span, Some(json!({ "reused": true }))).await;
    Ok(true)
}
