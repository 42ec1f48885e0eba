use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retrieval fan-out
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Per-source result-count limit.
    #[serde(default = "d_top_k")]
    pub top_k: usize,
    /// Items scoring below this after the merge are dropped.
    #[serde(default = "d_cutoff")]
    pub similarity_cutoff: f32,
    /// Per-source retrieval timeout.
    #[serde(default = "d_source_timeout")]
    pub source_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: d_top_k(),
            similarity_cutoff: d_cutoff(),
            source_timeout_ms: d_source_timeout(),
        }
    }
}

fn d_top_k() -> usize {
    8
}
fn d_cutoff() -> f32 {
    0.25
}
fn d_source_timeout() -> u64 {
    5_000
}
