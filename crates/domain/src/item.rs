//! Retrieved items, conversation turns, and the source references emitted
//! on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Item identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stable identity of a retrieved item, derived from its origin.
///
/// Identity, not content equality, governs deduplication: two items with
/// identical text but different origins are distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub source_id: String,
    pub content_id: String,
}

impl ItemId {
    pub fn new(source_id: impl Into<String>, content_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            content_id: content_id.into(),
        }
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_id, self.content_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retrieved item
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One retrieved piece of context, accumulated across retrieval sub-stages
/// and mutated in place by reranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub id: ItemId,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    pub score: f32,
}

/// Wire shape of one entry in the `sources` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub source_id: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl SourceRef {
    pub fn from_item(item: &RetrievedItem) -> Self {
        Self {
            id: item.id.to_string(),
            source_id: item.id.source_id.clone(),
            score: item.score,
            title: item
                .metadata
                .get("title")
                .and_then(|v| v.as_str())
                .map(String::from),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation turns
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One turn of the bounded conversation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Truncate a string to at most `max_bytes`, appending "..." when cut.
/// Never splits a UTF-8 character.
pub fn truncate_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_equality_is_origin_based() {
        let a = ItemId::new("docs", "42");
        let b = ItemId::new("wiki", "42");
        assert_ne!(a, b);
        assert_eq!(a, ItemId::new("docs", "42"));
    }

    #[test]
    fn source_ref_picks_up_title() {
        let item = RetrievedItem {
            id: ItemId::new("docs", "1"),
            text: "body".into(),
            metadata: serde_json::json!({ "title": "Quarterly report" }),
            score: 0.7,
        };
        let sr = SourceRef::from_item(&item);
        assert_eq!(sr.id, "docs:1");
        assert_eq!(sr.title.as_deref(), Some("Quarterly report"));
    }

    #[test]
    fn truncate_unicode_safe() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
        let t = truncate_str("héllo", 2);
        assert!(t.ends_with("..."));
        assert!(t.len() <= 5);
    }
}
