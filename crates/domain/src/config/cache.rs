use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Semantic answer cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Minimum cosine similarity between the question embedding and a
    /// cached question for the cached answer to be served.
    #[serde(default = "d_min_similarity")]
    pub min_similarity: f32,
    /// Timeout on the question-embedding call; expiry skips the cache
    /// check (fail-open) rather than delaying the request.
    #[serde(default = "d_embed_timeout")]
    pub embed_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: d_true(),
            min_similarity: d_min_similarity(),
            embed_timeout_ms: d_embed_timeout(),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_min_similarity() -> f32 {
    0.92
}
fn d_embed_timeout() -> u64 {
    1_500
}
