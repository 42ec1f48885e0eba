use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// External provider endpoints
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// OpenAI-compatible LLM endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "d_model")]
    pub model: String,
    /// Env var containing the API key; unset = no auth header.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "d_llm_timeout")]
    pub timeout_ms: u64,
    /// Cap on concurrent in-flight calls to this endpoint.
    #[serde(default = "d_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: d_model(),
            api_key_env: None,
            timeout_ms: d_llm_timeout(),
            max_in_flight: d_max_in_flight(),
        }
    }
}

/// Embedding endpoint configuration (Ollama-compatible `/api/embeddings`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "d_embed_model")]
    pub model: String,
    #[serde(default = "d_embed_timeout")]
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: d_embed_model(),
            timeout_ms: d_embed_timeout(),
        }
    }
}

/// Rerank endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RerankProviderConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_llm_timeout() -> u64 {
    120_000
}
fn d_max_in_flight() -> usize {
    16
}
fn d_embed_model() -> String {
    "nomic-embed-text".into()
}
fn d_embed_timeout() -> u64 {
    1_500
}
