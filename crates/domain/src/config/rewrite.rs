use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context rewrite
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Below this many history turns the rewrite is skipped entirely
    /// (short history rarely benefits; this saves one LLM round trip).
    #[serde(default = "d_min_history")]
    pub min_history_turns: usize,
    /// Timeout on the rewrite call; expiry falls back to the raw query.
    #[serde(default = "d_timeout")]
    pub timeout_ms: u64,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            min_history_turns: d_min_history(),
            timeout_ms: d_timeout(),
        }
    }
}

fn d_min_history() -> usize {
    2
}
fn d_timeout() -> u64 {
    4_000
}
