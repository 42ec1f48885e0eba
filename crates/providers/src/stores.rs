//! In-memory store implementations, used by the CLI and the test suites.
//! Production deployments supply their own backends through the traits.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use sl_domain::error::Result;
use sl_domain::item::{ChatTurn, Role};

use crate::traits::{
    CachedAnswer, HistoryStore, ResultCache, SemanticCache, SettingsResolver,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vector math
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryHistory {
    turns: RwLock<HashMap<String, Vec<ChatTurn>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistory {
    async fn append_turn(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let turn = ChatTurn {
            role,
            content: text.to_string(),
            metadata,
        };
        self.turns
            .write()
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<ChatTurn>> {
        let turns = self.turns.read();
        let Some(all) = turns.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Semantic cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct CacheEntry {
    embedding: Vec<f32>,
    question: String,
    answer: String,
}

/// Brute-force nearest-neighbor cache. Fine for the entry counts the CLI
/// sees; swap for a vector store behind the same trait at scale.
pub struct MemorySemanticCache {
    min_similarity: f32,
    entries: RwLock<Vec<CacheEntry>>,
}

impl MemorySemanticCache {
    pub fn new(min_similarity: f32) -> Self {
        Self {
            min_similarity,
            entries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl SemanticCache for MemorySemanticCache {
    async fn lookup(&self, embedding: &[f32]) -> Result<Option<CachedAnswer>> {
        let entries = self.entries.read();
        let best = entries
            .iter()
            .map(|e| (cosine_similarity(embedding, &e.embedding), e))
            .filter(|(sim, _)| *sim >= self.min_similarity)
            .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.map(|(similarity, entry)| CachedAnswer {
            question: entry.question.clone(),
            answer: entry.answer.clone(),
            similarity,
        }))
    }

    async fn store(&self, embedding: Vec<f32>, question: &str, answer: &str) -> Result<()> {
        self.entries.write().push(CacheEntry {
            embedding,
            question: question.to_string(),
            answer: answer.to_string(),
        });
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result cache / settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryResultCache {
    results: RwLock<HashMap<String, Value>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultCache for MemoryResultCache {
    fn get(&self, conversation_id: &str) -> Option<Value> {
        self.results.read().get(conversation_id).cloned()
    }

    fn put(&self, conversation_id: &str, value: Value) {
        self.results
            .write()
            .insert(conversation_id.to_string(), value);
    }
}

/// Settings resolver backed by a fixed map.
#[derive(Default)]
pub struct StaticSettings {
    values: HashMap<String, Value>,
}

impl StaticSettings {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

impl SettingsResolver for StaticSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
