use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router / agentic stage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Critical timeout on router query execution; expiry terminates the
    /// whole request with one terminal error event.
    #[serde(default = "d_query_timeout")]
    pub query_timeout_ms: u64,
    /// Critical timeout on the synthesis stream.
    #[serde(default = "d_synthesis_timeout")]
    pub synthesis_timeout_ms: u64,
    /// Timeout on the cached-result shortcut classifier; expiry means
    /// "not a shortcut" and routing continues.
    #[serde(default = "d_classifier_timeout")]
    pub classifier_timeout_ms: u64,
    /// Maximum tool-use rounds in the general strategy before forcing a stop.
    #[serde(default = "d_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: d_query_timeout(),
            synthesis_timeout_ms: d_synthesis_timeout(),
            classifier_timeout_ms: d_classifier_timeout(),
            max_tool_rounds: d_max_tool_rounds(),
        }
    }
}

fn d_query_timeout() -> u64 {
    60_000
}
fn d_synthesis_timeout() -> u64 {
    90_000
}
fn d_classifier_timeout() -> u64 {
    2_000
}
fn d_max_tool_rounds() -> usize {
    8
}
