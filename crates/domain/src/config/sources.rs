use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Knowledge sources
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Free-text documents searched by embedding similarity.
    #[default]
    Document,
    /// Schema-backed (spreadsheet/SQL-like) source that accepts
    /// structured queries.
    Tabular,
}

/// One configured knowledge source (connector).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnowledgeSourceConfig {
    pub id: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Embedding space the source was indexed in; informational for the
    /// retrieval strategy resolution.
    #[serde(default)]
    pub embedding_space: Option<String>,
    /// Per-source override of the fan-out result limit.
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
}

impl KnowledgeSourceConfig {
    /// The implicit source wired when the config lists none: a document
    /// store at the conventional local address.
    pub fn fallback() -> Self {
        Self {
            id: "default".into(),
            kind: SourceKind::Document,
            base_url: "http://localhost:8100".into(),
            api_key_env: None,
            embedding_space: None,
            top_k: None,
            max_retries: d_max_retries(),
        }
    }
}

fn d_max_retries() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_a_plain_document_source() {
        let cfg = KnowledgeSourceConfig::fallback();
        assert_eq!(cfg.id, "default");
        assert_eq!(cfg.kind, SourceKind::Document);
        assert!(!cfg.base_url.is_empty());
        assert!(cfg.api_key_env.is_none());
    }
}
