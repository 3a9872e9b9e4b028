//! Demultiplexer for the agent CLI's NDJSON output stream.
//!
//! The agent binary emits one JSON object per line. Lines arrive in
//! arbitrary read-sized pieces, so [`StreamDemux`] buffers bytes until a
//! newline completes a line, then hands the line to [`demux_line`].
//! Malformed lines are logged and dropped; they never fail a run.

use operon_core::StreamChunk;
use serde_json::Value;
use tracing::debug;

/// Splits raw subprocess output into complete lines and demultiplexes
/// each into typed chunks.
#[derive(Debug, Default)]
pub struct StreamDemux {
    buffer: Vec<u8>,
}

impl StreamDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes from the subprocess pipe.
    ///
    /// Returns the chunks for every line completed by this read. A
    /// partial trailing line stays buffered for the next call.
    pub fn push(&mut self, data: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(data);
        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            chunks.extend(demux_line(&line));
        }
        chunks
    }

    /// Flushes any unterminated final line once the pipe is closed.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        demux_line(&line)
    }
}

/// Maps one stream line to zero or more chunks.
///
/// Unknown event types and unparseable lines yield nothing. A `result`
/// event yields its cost update (when usage data is present) strictly
/// before the `Done` chunk so downstream cost accounting always lands
/// before run finalization.
pub fn demux_line(line: &str) -> Vec<StreamChunk> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            debug!(error = %err, "Dropping unparseable stream line");
            return Vec::new();
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => demux_assistant(&value),
        Some("user") => demux_tool_results(&value),
        Some("result") => demux_result(&value),
        Some("error") => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown stream error")
                .to_string();
            vec![StreamChunk::Error { message }]
        }
        other => {
            debug!(event_type = ?other, "Ignoring stream event");
            Vec::new()
        }
    }
}

fn demux_assistant(value: &Value) -> Vec<StreamChunk> {
    let Some(content) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut chunks = Vec::new();
    for item in content {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    chunks.push(StreamChunk::AssistantText {
                        text: text.to_string(),
                    });
                }
            }
            Some("thinking") => {
                if let Some(text) = item.get("thinking").and_then(Value::as_str) {
                    chunks.push(StreamChunk::AssistantThinking {
                        text: text.to_string(),
                    });
                }
            }
            Some("tool_use") => {
                let name = item
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let input = item.get("input").cloned().unwrap_or(Value::Null);
                chunks.push(StreamChunk::ToolUse { name, input });
            }
            _ => {}
        }
    }
    chunks
}

fn demux_tool_results(value: &Value) -> Vec<StreamChunk> {
    let Some(content) = value
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut chunks = Vec::new();
    for item in content {
        if item.get("type").and_then(Value::as_str) != Some("tool_result") {
            continue;
        }
        let ok = !item
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        chunks.push(StreamChunk::ToolResult {
            ok,
            content: flatten_tool_content(item.get("content")),
        });
    }
    chunks
}

/// Tool result content is either a plain string or an array of content
/// blocks; either way we keep only the text.
fn flatten_tool_content(content: Option<&Value>) -> Option<String> {
    match content {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(items)) => {
            let texts: Vec<&str> = items
                .iter()
                .filter(|i| i.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|i| i.get("text").and_then(Value::as_str))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

fn demux_result(value: &Value) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();

    let usage = value.get("usage");
    let cost_usd = value
        .get("total_cost_usd")
        .or_else(|| value.get("cost_usd"))
        .and_then(Value::as_f64);
    if usage.is_some() || cost_usd.is_some() {
        let input_tokens = sum_u64(
            usage,
            &[
                "input_tokens",
                "cache_creation_input_tokens",
                "cache_read_input_tokens",
            ],
        );
        let output_tokens = sum_u64(usage, &["output_tokens"]);
        chunks.push(StreamChunk::CostUpdate {
            input_tokens,
            output_tokens,
            cost_usd: cost_usd.unwrap_or(0.0),
        });
    }

    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || value
            .get("subtype")
            .and_then(Value::as_str)
            .map(|s| s != "success")
            .unwrap_or(false);
    chunks.push(StreamChunk::Done {
        exit_code: if is_error { 1 } else { 0 },
    });
    chunks
}

fn sum_u64(usage: Option<&Value>, keys: &[&str]) -> u64 {
    let Some(usage) = usage else { return 0 };
    keys.iter()
        .filter_map(|k| usage.get(k).and_then(Value::as_u64))
        .sum()
}
