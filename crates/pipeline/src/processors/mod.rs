//! The fixed chain's stages, in execution order: history load, semantic
//! cache, user persistence, router, standard RAG, then the trailing
//! observers (visualization, analytics, final persistence).

pub mod analytics;
pub mod history;
pub mod persist;
pub mod rag;
pub mod router;
pub mod semantic_cache;
pub mod shortcut;
pub mod tabular;
pub mod visualize;

use std::sync::Arc;

use futures_util::StreamExt;

use sl_domain::error::{Error, Result};
use sl_domain::stream::{LlmDelta, Usage};
use sl_providers::{ChatRequest, ToolCall};

use crate::blocks::{BlockParse, BlockParser};
use crate::processor::Steps;

/// One settled LLM round: the streamed text, the tool calls the model
/// asked for, and usage when the provider reported it.
pub(crate) struct RoundOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

/// Consume one streaming completion. When `emit_tokens` is set, prose is
/// forwarded as `token` events and embedded blocks as `content_block`
/// events as they complete; nothing buffers the whole response.
pub(crate) async fn stream_llm(
    llm: &Arc<dyn sl_providers::LlmProvider>,
    request: ChatRequest,
    steps: &Steps,
    emit_tokens: bool,
) -> Result<RoundOutput> {
    let mut stream = llm.stream_complete(request).await?;

    let mut parser = BlockParser::new();
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = None;

    while let Some(delta) = stream.next().await {
        match delta? {
            LlmDelta::Text { chunk } => {
                text.push_str(&chunk);
                if emit_tokens {
                    emit_parses(steps, parser.push(&chunk)).await?;
                }
            }
            LlmDelta::ToolInvocation {
                call_id,
                tool_name,
                arguments,
            } => {
                tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            LlmDelta::Finished {
                usage: reported, ..
            } => {
                usage = reported;
                break;
            }
        }
    }

    if emit_tokens {
        emit_parses(steps, parser.finish()).await?;
    }

    Ok(RoundOutput {
        text,
        tool_calls,
        usage,
    })
}

async fn emit_parses(steps: &Steps, parses: Vec<BlockParse>) -> Result<()> {
    for parse in parses {
        match parse {
            BlockParse::Text(t) => {
                if !steps.token(&t).await {
                    // Client gone; stop paying for tokens nobody reads.
                    return Err(Error::Other("client disconnected".into()));
                }
            }
            BlockParse::Block { block_type, data } => {
                steps.content_block(&block_type, data).await;
            }
        }
    }
    Ok(())
}
