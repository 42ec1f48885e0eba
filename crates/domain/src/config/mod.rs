mod cache;
mod llm;
mod rerank;
mod retrieval;
mod rewrite;
mod router;
mod sources;

pub use cache::*;
pub use llm::*;
pub use rerank::*;
pub use retrieval::*;
pub use rewrite::*;
pub use router::*;
pub use sources::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Configured knowledge sources; empty = one default document source.
    #[serde(default)]
    pub sources: Vec<KnowledgeSourceConfig>,
    /// Bounded conversation window loaded at the head of the chain.
    #[serde(default = "d_history_window")]
    pub history_window: usize,
}

fn d_history_window() -> usize {
    12
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            rewrite: RewriteConfig::default(),
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            sources: Vec::new(),
            history_window: d_history_window(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.retrieval.top_k == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "retrieval.top_k".into(),
                message: "top_k must be greater than 0".into(),
            });
        }

        if !(0.0..=1.0).contains(&self.retrieval.similarity_cutoff) {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "retrieval.similarity_cutoff".into(),
                message: "similarity_cutoff must be within [0.0, 1.0]".into(),
            });
        }

        if self.rerank.enabled && self.rerank.top_n == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "rerank.top_n".into(),
                message: "top_n must be greater than 0 when rerank is enabled".into(),
            });
        }

        if self.llm.base_url.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "llm.base_url".into(),
                message: "base_url must not be empty".into(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for src in &self.sources {
            if !seen.insert(&src.id) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "sources".into(),
                    message: format!("duplicate source id '{}'", src.id),
                });
            }
        }

        if self.sources.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "sources".into(),
                message: "no knowledge sources configured; using the default source".into(),
            });
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_warns_only_about_sources() {
        let mut config = Config::default();
        config.llm.base_url = "http://localhost:11434".into();
        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ConfigSeverity::Warning);
    }

    #[test]
    fn duplicate_source_ids_rejected() {
        let mut config = Config::default();
        config.llm.base_url = "http://localhost".into();
        config.sources.push(KnowledgeSourceConfig {
            id: "docs".into(),
            ..Default::default()
        });
        config.sources.push(KnowledgeSourceConfig {
            id: "docs".into(),
            ..Default::default()
        });
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|e| e.severity == ConfigSeverity::Error && e.message.contains("duplicate")));
    }

    #[test]
    fn bad_cutoff_rejected() {
        let mut config = Config::default();
        config.llm.base_url = "http://localhost".into();
        config.retrieval.similarity_cutoff = 1.5;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|e| e.field == "retrieval.similarity_cutoff"));
    }
}
