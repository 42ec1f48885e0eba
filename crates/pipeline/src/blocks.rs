//! Incremental detection of fenced structured blocks inside a token
//! stream.
//!
//! A block looks like:
//!
//! ````text
//! ```block:table
//! { "columns": [...], "rows": [...] }
//! ```
//! ````
//!
//! Ordinary code fences pass through as text. The parser holds back only
//! the minimal suffix that could still turn into a block marker, so prose
//! keeps streaming with no buffering of the whole response.

use serde_json::Value;

const MARKER: &str = "```block:";
const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq)]
pub enum BlockParse {
    Text(String),
    Block { block_type: String, data: Value },
}

enum State {
    Text,
    InBlock { block_type: String },
}

pub struct BlockParser {
    buf: String,
    state: State,
}

impl Default for BlockParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockParser {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            state: State::Text,
        }
    }

    /// Feed one chunk; returns everything that became unambiguous.
    pub fn push(&mut self, chunk: &str) -> Vec<BlockParse> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        loop {
            match &self.state {
                State::Text => {
                    if let Some(pos) = self.buf.find(MARKER) {
                        let header_start = pos + MARKER.len();
                        let Some(nl_rel) = self.buf[header_start..].find('\n') else {
                            // Marker seen, type still arriving. Release the
                            // text before it and wait.
                            if pos > 0 {
                                let text: String = self.buf.drain(..pos).collect();
                                out.push(BlockParse::Text(text));
                            }
                            break;
                        };
                        let nl = header_start + nl_rel;
                        if pos > 0 {
                            out.push(BlockParse::Text(self.buf[..pos].to_string()));
                        }
                        let block_type = self.buf[header_start..nl].trim().to_string();
                        self.buf.drain(..=nl);
                        self.state = State::InBlock { block_type };
                    } else {
                        // Hold only a suffix that could still become the
                        // marker.
                        let hold = ambiguous_suffix_len(&self.buf, MARKER);
                        let emit = self.buf.len() - hold;
                        if emit > 0 {
                            let text: String = self.buf.drain(..emit).collect();
                            out.push(BlockParse::Text(text));
                        }
                        break;
                    }
                }
                State::InBlock { block_type } => {
                    let Some(pos) = self.buf.find(FENCE) else {
                        // Block data is only surfaced complete; buffer it.
                        break;
                    };
                    let raw = self.buf[..pos].to_string();
                    let mut after = pos + FENCE.len();
                    if self.buf[after..].starts_with('\n') {
                        after += 1;
                    }
                    let block_type = block_type.clone();
                    self.buf.drain(..after);
                    self.state = State::Text;
                    out.push(finish_block(block_type, raw));
                }
            }
        }

        out
    }

    /// Flush trailing state at end of stream. An unterminated block is
    /// surfaced as text, never dropped.
    pub fn finish(mut self) -> Vec<BlockParse> {
        let mut out = Vec::new();
        match self.state {
            State::Text => {
                if !self.buf.is_empty() {
                    out.push(BlockParse::Text(std::mem::take(&mut self.buf)));
                }
            }
            State::InBlock { block_type } => {
                out.push(BlockParse::Text(format!(
                    "{MARKER}{block_type}\n{}",
                    self.buf
                )));
            }
        }
        out
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of `pat`.
fn ambiguous_suffix_len(s: &str, pat: &str) -> usize {
    let max = pat.len().saturating_sub(1).min(s.len());
    for k in (1..=max).rev() {
        if s.ends_with(&pat[..k]) {
            return k;
        }
    }
    0
}

fn finish_block(block_type: String, raw: String) -> BlockParse {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(data) => BlockParse::Block { block_type, data },
        Err(e) => {
            tracing::warn!(%block_type, error = %e, "block body is not valid JSON, passing through as text");
            BlockParse::Text(format!("{MARKER}{block_type}\n{raw}{FENCE}"))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&str]) -> Vec<BlockParse> {
        let mut parser = BlockParser::new();
        let mut out = Vec::new();
        for c in chunks {
            out.extend(parser.push(c));
        }
        out.extend(parser.finish());
        out
    }

    fn text_of(parses: &[BlockParse]) -> String {
        parses
            .iter()
            .filter_map(|p| match p {
                BlockParse::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plain_text_streams_through() {
        let out = collect(&["Hello ", "world"]);
        assert_eq!(text_of(&out), "Hello world");
        assert!(out.iter().all(|p| matches!(p, BlockParse::Text(_))));
    }

    #[test]
    fn block_split_across_chunks() {
        let out = collect(&[
            "Revenue summary:\n``",
            "`block:ta",
            "ble\n{\"rows\":",
            "[[1,2]]}\n``",
            "`\nDone.",
        ]);
        let blocks: Vec<_> = out
            .iter()
            .filter(|p| matches!(p, BlockParse::Block { .. }))
            .collect();
        assert_eq!(blocks.len(), 1);
        match blocks[0] {
            BlockParse::Block { block_type, data } => {
                assert_eq!(block_type, "table");
                assert_eq!(data["rows"][0][1], 2);
            }
            _ => unreachable!(),
        }
        assert_eq!(text_of(&out), "Revenue summary:\nDone.");
    }

    #[test]
    fn ordinary_fence_passes_through() {
        let out = collect(&["Use this:\n```rust\nfn main() {}\n```\nend"]);
        assert!(out.iter().all(|p| matches!(p, BlockParse::Text(_))));
        assert_eq!(text_of(&out), "Use this:\n```rust\nfn main() {}\n```\nend");
    }

    #[test]
    fn ambiguous_suffix_is_held_then_released() {
        let mut parser = BlockParser::new();
        // "```bl" could still become "```block:" — nothing but the prior
        // prose may be released.
        let first = parser.push("maybe ```bl");
        assert_eq!(text_of(&first), "maybe ");
        // "```bla" can no longer be the marker.
        let second = parser.push("a");
        assert_eq!(text_of(&second), "```bla");
    }

    #[test]
    fn unterminated_block_surfaces_as_text() {
        let out = collect(&["intro\n```block:chart\n{\"x\": 1}"]);
        assert_eq!(text_of(&out), "intro\n```block:chart\n{\"x\": 1}");
    }

    #[test]
    fn invalid_json_body_falls_back_to_text() {
        let out = collect(&["```block:table\nnot json at all\n```"]);
        assert!(out.iter().all(|p| matches!(p, BlockParse::Text(_))));
        assert!(text_of(&out).contains("not json at all"));
    }

    #[test]
    fn two_blocks_with_prose_between() {
        let out = collect(&[
            "```block:table\n{\"a\":1}\n```\nand also\n```block:chart\n{\"b\":2}\n```",
        ]);
        let blocks: Vec<_> = out
            .iter()
            .filter_map(|p| match p {
                BlockParse::Block { block_type, .. } => Some(block_type.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(blocks, vec!["table", "chart"]);
        assert_eq!(text_of(&out), "\nand also\n");
    }
}
