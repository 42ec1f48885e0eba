//! Cross-encoder rerank adapter.
//!
//! Speaks the common rerank wire shape (Cohere/Jina/TEI style): a `results`
//! or `data` array whose entries carry `index` plus `relevance_score` or
//! `score`. Entries with an out-of-range index are dropped.

use serde_json::Value;

use sl_domain::config::RerankProviderConfig;
use sl_domain::error::{Error, Result};

use crate::llm::from_reqwest;
use crate::traits::{RerankHit, RerankProvider};

pub struct RestRerank {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RestRerank {
    pub fn from_config(cfg: &RerankProviderConfig, timeout_ms: u64) -> Result<Self> {
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait::async_trait]
impl RerankProvider for RestRerank {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/rerank", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": top_n,
        });

        let mut rb = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            rb = rb.header("Authorization", format!("Bearer {key}"));
        }

        let resp = rb.send().await.map_err(from_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: "rerank".into(),
                message: format!("HTTP {status}: {text}"),
            });
        }

        let json: Value = resp.json().await.map_err(from_reqwest)?;
        parse_rerank_response(&json, documents.len())
    }
}

/// Extract `(index, score)` pairs from a rerank response body.
fn parse_rerank_response(json: &Value, doc_count: usize) -> Result<Vec<RerankHit>> {
    let entries = json["results"]
        .as_array()
        .or_else(|| json["data"].as_array())
        .ok_or_else(|| Error::Provider {
            provider: "rerank".into(),
            message: "response missing results array".into(),
        })?;

    let mut hits = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(index) = entry["index"].as_u64().map(|i| i as usize) else {
            continue;
        };
        if index >= doc_count {
            tracing::warn!(index, doc_count, "rerank entry index out of range, dropped");
            continue;
        }
        let score = entry["relevance_score"]
            .as_f64()
            .or_else(|| entry["score"].as_f64())
            .unwrap_or(0.0) as f32;
        hits.push(RerankHit {
            index,
            relevance_score: score,
        });
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_results_with_relevance_score() {
        let json: Value = serde_json::from_str(
            r#"{"results":[{"index":2,"relevance_score":0.91},{"index":0,"relevance_score":0.4}]}"#,
        )
        .unwrap();
        let hits = parse_rerank_response(&json, 3).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 2);
        assert!((hits[0].relevance_score - 0.91).abs() < 1e-6);
    }

    #[test]
    fn parses_data_with_plain_score() {
        let json: Value =
            serde_json::from_str(r#"{"data":[{"index":1,"score":0.7}]}"#).unwrap();
        let hits = parse_rerank_response(&json, 2).unwrap();
        assert_eq!(hits[0].index, 1);
        assert!((hits[0].relevance_score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_index_is_dropped() {
        let json: Value = serde_json::from_str(
            r#"{"results":[{"index":5,"relevance_score":0.9},{"index":0,"relevance_score":0.2}]}"#,
        )
        .unwrap();
        let hits = parse_rerank_response(&json, 2).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].index, 0);
    }

    #[test]
    fn missing_arrays_are_an_error() {
        let json: Value = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert!(parse_rerank_response(&json, 1).is_err());
    }
}
