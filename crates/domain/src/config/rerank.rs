use serde::{Deserialize, Serialize};

use super::llm::RerankProviderConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reranking stage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Candidate cap sent to the rerank provider.
    #[serde(default = "d_max_candidates")]
    pub max_candidates: usize,
    /// Items kept after reranking (also the fail-open truncation length).
    #[serde(default = "d_top_n")]
    pub top_n: usize,
    /// Items whose reranked score falls below this are dropped.
    #[serde(default = "d_score_cutoff")]
    pub score_cutoff: f32,
    /// Hard timeout on the provider call; expiry falls open.
    #[serde(default = "d_timeout")]
    pub timeout_ms: u64,
    /// Rerank endpoint. Unset = the stage is skipped even when enabled.
    #[serde(default)]
    pub provider: Option<RerankProviderConfig>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: d_true(),
            max_candidates: d_max_candidates(),
            top_n: d_top_n(),
            score_cutoff: d_score_cutoff(),
            timeout_ms: d_timeout(),
            provider: None,
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_max_candidates() -> usize {
    32
}
fn d_top_n() -> usize {
    6
}
fn d_score_cutoff() -> f32 {
    0.1
}
fn d_timeout() -> u64 {
    3_000
}
