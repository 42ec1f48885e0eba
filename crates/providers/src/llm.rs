//! OpenAI-compatible chat completions adapter.
//!
//! Works with OpenAI, Ollama, vLLM, and any endpoint that follows the chat
//! completions contract. Streaming responses arrive as SSE: chunks are
//! buffered, split on `\n\n`, and each `data:` payload is parsed into
//! [`LlmDelta`]s. Tool-call fragments are assembled across deltas and
//! surface only once complete.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use sl_domain::config::LlmConfig;
use sl_domain::error::{Error, Result};
use sl_domain::stream::{BoxStream, LlmDelta, Usage};

use crate::traits::{ChatMessage, ChatRequest, LlmProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatLlm {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    /// Caps concurrent in-flight calls so a rate-limited upstream is not
    /// overwhelmed by parallel requests.
    permits: Arc<Semaphore>,
}

impl OpenAiCompatLlm {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            api_key,
            client,
            permits: Arc::new(Semaphore::new(cfg.max_in_flight.max(1))),
        })
    }

    fn authed_post(&self) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut rb = self.client.post(url).header("Content-Type", "application/json");
        if let Some(ref key) = self.api_key {
            rb = rb.header("Authorization", format!("Bearer {key}"));
        }
        rb
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_wire).collect();
        let model = req.model.clone().unwrap_or_else(|| self.model.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatLlm {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("llm permit pool closed".into()))?;

        let req = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            ..Default::default()
        };
        let body = self.build_body(&req, false);

        let resp = self
            .authed_post()
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: "llm".into(),
                message: format!("HTTP {status}: {text}"),
            });
        }

        let json: Value = resp.json().await.map_err(from_reqwest)?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(content)
    }

    async fn stream_complete(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<LlmDelta>>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("llm permit pool closed".into()))?;

        let body = self.build_body(&req, true);
        let resp = self
            .authed_post()
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: "llm".into(),
                message: format!("HTTP {status}: {text}"),
            });
        }

        let stream = async_stream::stream! {
            // Held for the lifetime of the stream, not just the connect.
            let _permit = permit;
            let mut response = resp;
            let mut buffer = String::new();
            let mut state = StreamState::default();
            let mut finished_emitted = false;

            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        for data in drain_data_lines(&mut buffer) {
                            for event in state.parse_data(&data) {
                                if matches!(&event, Ok(LlmDelta::Finished { .. })) {
                                    finished_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    Ok(None) => {
                        if !buffer.trim().is_empty() {
                            buffer.push_str("\n\n");
                            for data in drain_data_lines(&mut buffer) {
                                for event in state.parse_data(&data) {
                                    if matches!(&event, Ok(LlmDelta::Finished { .. })) {
                                        finished_emitted = true;
                                    }
                                    yield event;
                                }
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        yield Err(from_reqwest(e));
                        break;
                    }
                }
            }

            if !finished_emitted {
                yield Ok(LlmDelta::Finished { usage: None, finish_reason: Some("stop".into()) });
            }
        };

        Ok(Box::pin(stream))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn msg_to_wire(msg: &ChatMessage) -> Value {
    match msg {
        ChatMessage::System { content } => {
            serde_json::json!({ "role": "system", "content": content })
        }
        ChatMessage::User { content } => {
            serde_json::json!({ "role": "user", "content": content })
        }
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut obj = serde_json::json!({ "role": "assistant" });
            obj["content"] = if content.is_empty() {
                Value::Null
            } else {
                Value::String(content.clone())
            };
            if !tool_calls.is_empty() {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.call_id,
                            "type": "function",
                            "function": {
                                "name": tc.tool_name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                obj["tool_calls"] = Value::Array(calls);
            }
            obj
        }
        ChatMessage::ToolResult { call_id, content } => serde_json::json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": content,
        }),
    }
}

pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract complete `data:` payloads from an SSE buffer. The buffer is
/// drained in place; a trailing partial event stays for the next call.
fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Per-stream parser state: tool-call deltas are keyed by choice index
/// until an id arrives, then by id.
#[derive(Default)]
struct StreamState {
    /// index -> (call_id, tool_name) for calls announced so far.
    announced: std::collections::HashMap<u64, (String, String)>,
    /// call_id -> accumulated argument JSON.
    args: std::collections::HashMap<String, String>,
}

impl StreamState {
    fn parse_data(&mut self, data: &str) -> Vec<Result<LlmDelta>> {
        if data == "[DONE]" {
            return Vec::new(); // closing frame comes from the usage chunk or fallback
        }

        let json: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                return vec![Err(Error::Provider {
                    provider: "llm".into(),
                    message: format!("bad SSE payload: {e}"),
                })]
            }
        };

        let mut events = Vec::new();

        // Usage-only chunk (stream_options.include_usage).
        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            let usage = Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
            };
            // Flush unfinished tool calls before the closing frame.
            events.extend(self.flush_tool_calls());
            events.push(Ok(LlmDelta::Finished {
                usage: Some(usage),
                finish_reason: json["choices"][0]["finish_reason"]
                    .as_str()
                    .map(String::from),
            }));
            return events;
        }

        let Some(delta) = json["choices"][0].get("delta") else {
            return events;
        };

        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                events.push(Ok(LlmDelta::Text { chunk: text.into() }));
            }
        }

        // Tool-call fragments only update assembly state; nothing is
        // emitted until the arguments are complete.
        if let Some(calls) = delta["tool_calls"].as_array() {
            for tc in calls {
                let idx = tc["index"].as_u64().unwrap_or(0);
                if let Some(id) = tc["id"].as_str() {
                    let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                    self.announced.insert(idx, (id.to_string(), name));
                    self.args.insert(id.to_string(), String::new());
                }
                if let Some(delta_args) = tc["function"]["arguments"].as_str() {
                    if let Some((call_id, _)) = self.announced.get(&idx) {
                        if let Some(buf) = self.args.get_mut(call_id) {
                            buf.push_str(delta_args);
                        }
                    }
                }
            }
        }

        if json["choices"][0]["finish_reason"].as_str() == Some("tool_calls") {
            events.extend(self.flush_tool_calls());
        }

        events
    }

    /// Emit one `ToolInvocation` per assembled call, in choice order.
    fn flush_tool_calls(&mut self) -> Vec<Result<LlmDelta>> {
        let mut events = Vec::new();
        let mut announced: Vec<_> = self.announced.drain().collect();
        announced.sort_by_key(|(idx, _)| *idx);
        for (_, (call_id, tool_name)) in announced {
            let raw = self.args.remove(&call_id).unwrap_or_default();
            let arguments = if raw.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&raw).unwrap_or_else(|e| {
                    tracing::warn!(call_id = %call_id, error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object");
                    Value::Object(Default::default())
                })
            };
            events.push(Ok(LlmDelta::ToolInvocation {
                call_id,
                tool_name,
                arguments,
            }));
        }
        events
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_single_complete_event() {
        let mut buf = String::from("event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_partial_event_stays_in_buffer() {
        let mut buf = String::from("data: complete\n\ndata: partial");
        assert_eq!(drain_data_lines(&mut buf), vec!["complete"]);
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn parse_token_delta() {
        let mut state = StreamState::default();
        let events =
            state.parse_data(r#"{"choices":[{"delta":{"content":"Hel"},"index":0}]}"#);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            LlmDelta::Text { chunk } if chunk == "Hel"
        ));
    }

    #[test]
    fn tool_calls_assemble_silently_until_complete() {
        let mut state = StreamState::default();
        let start = state.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"search","arguments":""}}]}}]}"#,
        );
        // Fragments never surface; the invocation appears only assembled.
        assert!(start.is_empty());

        state.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":"}}]}}]}"#,
        );
        state.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"rust\"}"}}]}}]}"#,
        );

        let finish =
            state.parse_data(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let invocation = finish
            .iter()
            .find_map(|e| match e.as_ref().unwrap() {
                LlmDelta::ToolInvocation {
                    call_id,
                    tool_name,
                    arguments,
                } => Some((call_id.clone(), tool_name.clone(), arguments.clone())),
                _ => None,
            })
            .expect("assembled invocation");
        assert_eq!(invocation.0, "c1");
        assert_eq!(invocation.1, "search");
        assert_eq!(invocation.2["q"], "rust");
    }

    #[test]
    fn usage_chunk_closes_the_stream() {
        let mut state = StreamState::default();
        let events = state.parse_data(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        );
        let usage = events
            .iter()
            .find_map(|e| match e.as_ref().unwrap() {
                LlmDelta::Finished { usage, .. } => usage.clone(),
                _ => None,
            })
            .expect("closing frame with usage");
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn done_sentinel_produces_nothing() {
        let mut state = StreamState::default();
        assert!(state.parse_data("[DONE]").is_empty());
    }

    #[test]
    fn malformed_tool_args_default_to_empty_object() {
        let mut state = StreamState::default();
        state.parse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c9","function":{"name":"t","arguments":"{not json"}}]}}]}"#,
        );
        let finish =
            state.parse_data(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let args = finish
            .iter()
            .find_map(|e| match e.as_ref().unwrap() {
                LlmDelta::ToolInvocation { arguments, .. } => Some(arguments.clone()),
                _ => None,
            })
            .unwrap();
        assert!(args.as_object().unwrap().is_empty());
    }
}
