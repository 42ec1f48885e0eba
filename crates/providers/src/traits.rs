use serde_json::Value;

use sl_domain::config::SourceKind;
use sl_domain::error::{Error, Result};
use sl_domain::item::{ChatTurn, Role};
use sl_domain::stream::{BoxStream, LlmDelta};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat request / message types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool call emitted by the model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// A tool the model may invoke.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// One message in a provider-agnostic chat request.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System { content: String },
    User { content: String },
    Assistant {
        content: String,
        tool_calls: Vec<ToolCall>,
    },
    ToolResult { call_id: String, content: String },
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn from_turn(turn: &ChatTurn) -> Self {
        match turn.role {
            Role::System => Self::system(&turn.content),
            Role::User => Self::user(&turn.content),
            Role::Assistant => Self::Assistant {
                content: turn.content.clone(),
                tool_calls: Vec::new(),
            },
        }
    }
}

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Model override. `None` = the adapter's configured default.
    pub model: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM completion endpoint.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// One-shot completion for short internal prompts (rewrite, verdicts,
    /// classifiers).
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Streaming chat completion with optional tool use.
    async fn stream_complete(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<LlmDelta>>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Embedding / rerank providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// One scored entry of a rerank response, aligned to the submitted
/// document list by `index`.
#[derive(Debug, Clone, Copy)]
pub struct RerankHit {
    pub index: usize,
    pub relevance_score: f32,
}

#[async_trait::async_trait]
pub trait RerankProvider: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Knowledge sources
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One raw hit returned by a knowledge source.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SearchHit {
    pub content_id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    pub score: f32,
}

/// Schema of a tabular source.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub dtype: String,
}

impl TableSchema {
    /// Render the schema for inclusion in an LLM prompt.
    pub fn describe(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.dtype))
            .collect();
        format!("table {}: {}", self.name, cols.join(", "))
    }
}

/// Result of a structured query against a tabular source.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TableResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// An external searchable content provider (one connector/configuration).
#[async_trait::async_trait]
pub trait KnowledgeSource: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Structured-query schema, when the source is schema-backed.
    fn schema(&self) -> Option<TableSchema> {
        None
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&Value>,
    ) -> Result<Vec<SearchHit>>;

    /// Execute a structured query (tabular sources only).
    async fn query_structured(&self, _statement: &str) -> Result<TableResult> {
        Err(Error::Source {
            source_id: self.id().to_string(),
            message: "structured queries not supported".into(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stores (consumed, never implemented by the core)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chat history persistence.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append_turn(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        metadata: Option<Value>,
    ) -> Result<()>;

    /// The most recent turns, oldest first, at most `limit`.
    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatTurn>>;
}

/// A previously answered question close enough to serve verbatim.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub question: String,
    pub answer: String,
    pub similarity: f32,
}

/// Semantic answer cache keyed by question embedding.
#[async_trait::async_trait]
pub trait SemanticCache: Send + Sync {
    async fn lookup(&self, embedding: &[f32]) -> Result<Option<CachedAnswer>>;

    async fn store(&self, embedding: Vec<f32>, question: &str, answer: &str) -> Result<()>;
}

/// Per-conversation cache of the last turn's structured result, used by
/// the visualization shortcut.
pub trait ResultCache: Send + Sync {
    fn get(&self, conversation_id: &str) -> Option<Value>;
    fn put(&self, conversation_id: &str, value: Value);
}

/// Opaque key-value lookup for per-tenant knobs.
pub trait SettingsResolver: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
}
