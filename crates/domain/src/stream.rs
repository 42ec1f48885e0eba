use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Boxed async stream, the shape the provider traits hand back.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One settled increment of a streaming completion.
///
/// Adapters normalize their wire protocol down to this: prose chunks as
/// they arrive, tool invocations only once their arguments are fully
/// assembled, and a closing frame. Transport and protocol failures travel
/// as `Err` items on the stream, never as a variant.
#[derive(Debug, Clone)]
pub enum LlmDelta {
    /// A chunk of answer prose.
    Text { chunk: String },

    /// A tool invocation the model requested, arguments complete.
    ToolInvocation {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// End of the stream. Usage is present when the provider reports it.
    Finished {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
}

/// Token usage for one completion; accumulated across the sub-calls of a
/// request for the root span payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
