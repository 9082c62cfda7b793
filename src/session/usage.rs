//! Usage and plaintext extraction from upstream responses.
//!
//! Understands three shapes: chat-completions (`usage.total_tokens`, or
//! prompt + completion), the Responses API (`response.completed` carrying
//! `response.usage`), and Anthropic messages (`message_start` input plus
//! `message_delta` output).

use serde_json::Value;

use crate::client::{SseEvent, SseScanner};

#[derive(Debug, Default)]
pub struct UsageTracker {
    scanner: SseScanner,
    reported: Option<u64>,
    anthropic_input: Option<u64>,
    text: String,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes one event-stream chunk.
    pub fn observe_chunk(&mut self, chunk: &[u8]) {
        for event in self.scanner.feed(chunk) {
            self.observe_event(&event);
        }
    }

    pub fn finish_stream(&mut self) {
        if let Some(event) = self.scanner.finish() {
            self.observe_event(&event);
        }
    }

    /// Whether the stream carried its `[DONE]` marker.
    pub fn stream_done(&self) -> bool {
        self.scanner.is_done()
    }

    /// Observes a complete, non-streamed body.
    pub fn observe_body(&mut self, body: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return;
        };
        if let Some(tokens) = value.get("usage").and_then(usage_total) {
            self.reported = Some(tokens);
        }
        collect_body_text(&value, &mut self.text);
    }

    pub fn reported_tokens(&self) -> Option<u64> {
        self.reported
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Extracted text, or the raw body when nothing could be extracted.
    pub fn content(&self, raw: &[u8]) -> String {
        if self.text.is_empty() {
            String::from_utf8_lossy(raw).into_owned()
        } else {
            self.text.clone()
        }
    }

    fn observe_event(&mut self, event: &SseEvent) {
        if event.is_done() {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            tracing::trace!(data = %event.data, "Skipping non-JSON event");
            return;
        };

        match value.get("type").and_then(Value::as_str) {
            Some("response.completed") => {
                if let Some(tokens) = value.pointer("/response/usage").and_then(usage_total) {
                    self.reported = Some(tokens);
                }
            }
            Some("response.output_text.delta") => {
                if let Some(delta) = value.get("delta").and_then(Value::as_str) {
                    self.text.push_str(delta);
                }
            }
            Some("message_start") => {
                self.anthropic_input = value
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64);
            }
            Some("content_block_delta") => {
                if let Some(text) = value.pointer("/delta/text").and_then(Value::as_str) {
                    self.text.push_str(text);
                }
            }
            Some("message_delta") => {
                if let Some(output) = value.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    self.reported = Some(self.anthropic_input.unwrap_or(0) + output);
                }
            }
            _ => {
                if let Some(tokens) = value.get("usage").and_then(usage_total) {
                    self.reported = Some(tokens);
                }
                for choice in choices(&value) {
                    if let Some(content) = choice.pointer("/delta/content").and_then(Value::as_str) {
                        self.text.push_str(content);
                    }
                }
            }
        }
    }
}

fn choices(value: &Value) -> impl Iterator<Item = &Value> {
    value
        .get("choices")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn usage_total(usage: &Value) -> Option<u64> {
    if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
        return Some(total);
    }
    let pair = |a: &str, b: &str| -> Option<u64> {
        let first = usage.get(a).and_then(Value::as_u64);
        let second = usage.get(b).and_then(Value::as_u64);
        match (first, second) {
            (None, None) => None,
            (x, y) => Some(x.unwrap_or(0) + y.unwrap_or(0)),
        }
    };
    pair("prompt_tokens", "completion_tokens").or_else(|| pair("input_tokens", "output_tokens"))
}

fn collect_body_text(value: &Value, out: &mut String) {
    for choice in choices(value) {
        if let Some(content) = choice.pointer("/message/content").and_then(Value::as_str) {
            out.push_str(content);
        }
    }
    if let Some(text) = value.get("output_text").and_then(Value::as_str) {
        out.push_str(text);
        return;
    }
    let blocks = value
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .chain(value.get("content").and_then(Value::as_array).into_iter().flatten());
    for block in blocks {
        if let Some(text) = block.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
}
