//! REST knowledge-source connector.
//!
//! One instance per configured source. Transient failures (timeouts, 5xx)
//! are retried with exponential backoff up to the configured retry limit;
//! 4xx responses are never retried.

use serde_json::Value;

use sl_domain::config::{KnowledgeSourceConfig, SourceKind};
use sl_domain::error::{Error, Result};

use crate::traits::{ColumnSpec, KnowledgeSource, SearchHit, TableResult, TableSchema};

pub struct RestKnowledgeSource {
    cfg: KnowledgeSourceConfig,
    client: reqwest::Client,
    api_key: Option<String>,
    schema: Option<TableSchema>,
}

impl RestKnowledgeSource {
    pub fn from_config(cfg: KnowledgeSourceConfig, timeout_ms: u64) -> Result<Self> {
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            cfg,
            client,
            api_key,
            schema: None,
        })
    }

    /// Fetch the schema from the source's `/schema` endpoint.
    pub async fn load_schema(&mut self) -> Result<()> {
        let url = format!("{}/schema", self.cfg.base_url.trim_end_matches('/'));
        let json = self.post_with_retry(&url, &Value::Null).await?;
        let name = json["name"]
            .as_str()
            .unwrap_or(&self.cfg.id)
            .to_string();
        let columns = json["columns"]
            .as_array()
            .map(|cols| {
                cols.iter()
                    .map(|c| ColumnSpec {
                        name: c["name"].as_str().unwrap_or_default().to_string(),
                        dtype: c["dtype"].as_str().unwrap_or("text").to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.schema = Some(TableSchema { name, columns });
        Ok(())
    }

    async fn post_with_retry(&self, url: &str, body: &Value) -> Result<Value> {
        let mut attempt: u32 = 0;
        loop {
            let mut rb = self.client.post(url).json(body);
            if let Some(ref key) = self.api_key {
                rb = rb.header("Authorization", format!("Bearer {key}"));
            }

            let err = match rb.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().await.map_err(|e| Error::Source {
                        source_id: self.cfg.id.clone(),
                        message: format!("bad response body: {e}"),
                    });
                }
                Ok(resp) if resp.status().is_server_error() => Error::Source {
                    source_id: self.cfg.id.clone(),
                    message: format!("HTTP {}", resp.status()),
                },
                Ok(resp) => {
                    // Client errors are terminal.
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(Error::Source {
                        source_id: self.cfg.id.clone(),
                        message: format!("HTTP {status}: {text}"),
                    });
                }
                Err(e) => Error::Source {
                    source_id: self.cfg.id.clone(),
                    message: e.to_string(),
                },
            };

            if attempt >= self.cfg.max_retries {
                return Err(err);
            }
            let backoff = 100u64 * (1 << attempt.min(4));
            tracing::debug!(
                source = %self.cfg.id,
                attempt,
                backoff_ms = backoff,
                error = %err,
                "source call failed, retrying"
            );
            tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            attempt += 1;
        }
    }
}

#[async_trait::async_trait]
impl KnowledgeSource for RestKnowledgeSource {
    fn id(&self) -> &str {
        &self.cfg.id
    }

    fn kind(&self) -> SourceKind {
        self.cfg.kind
    }

    fn schema(&self) -> Option<TableSchema> {
        self.schema.clone()
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Value>,
    ) -> Result<Vec<SearchHit>> {
        let url = format!("{}/search", self.cfg.base_url.trim_end_matches('/'));
        let top_k = self.cfg.top_k.unwrap_or(top_k);
        let mut body = serde_json::json!({
            "query": query,
            "top_k": top_k,
        });
        if let Some(f) = filters {
            body["filters"] = f.clone();
        }

        let json = self.post_with_retry(&url, &body).await?;
        let hits = json["hits"]
            .as_array()
            .or_else(|| json["results"].as_array())
            .ok_or_else(|| Error::Source {
                source_id: self.cfg.id.clone(),
                message: "response missing hits array".into(),
            })?;

        hits.iter()
            .map(|h| {
                serde_json::from_value(h.clone()).map_err(|e| Error::Source {
                    source_id: self.cfg.id.clone(),
                    message: format!("bad hit: {e}"),
                })
            })
            .collect()
    }

    async fn query_structured(&self, statement: &str) -> Result<TableResult> {
        if self.cfg.kind != SourceKind::Tabular {
            return Err(Error::Source {
                source_id: self.cfg.id.clone(),
                message: "structured queries not supported".into(),
            });
        }
        let url = format!("{}/query", self.cfg.base_url.trim_end_matches('/'));
        let body = serde_json::json!({ "statement": statement });
        let json = self.post_with_retry(&url, &body).await?;
        serde_json::from_value(json).map_err(|e| Error::Source {
            source_id: self.cfg.id.clone(),
            message: format!("bad query result: {e}"),
        })
    }
}
