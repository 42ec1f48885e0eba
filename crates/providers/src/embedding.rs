//! Ollama-compatible embedding adapter (`POST /api/embeddings`).

use serde_json::Value;

use sl_domain::config::EmbeddingConfig;
use sl_domain::error::{Error, Result};

use crate::llm::from_reqwest;
use crate::traits::EmbeddingProvider;

pub struct RestEmbedding {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl RestEmbedding {
    pub fn from_config(cfg: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for RestEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        if !resp.status().is_success() {
            return Err(Error::Provider {
                provider: "embedding".into(),
                message: format!("HTTP {}", resp.status()),
            });
        }

        let json: Value = resp.json().await.map_err(from_reqwest)?;
        let raw = json["embedding"].as_array().ok_or_else(|| Error::Provider {
            provider: "embedding".into(),
            message: "response missing embedding array".into(),
        })?;

        let vector: Vec<f32> = raw
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if vector.is_empty() {
            return Err(Error::Provider {
                provider: "embedding".into(),
                message: "empty embedding".into(),
            });
        }
        Ok(vector)
    }
}
