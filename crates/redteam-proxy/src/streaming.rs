//! Server-Sent Events (SSE) accumulation.
//!
//! While stream chunks are copied through to the client, the accumulator
//! parses `data:` lines on the side so that streamed events still get token
//! usage (and therefore cost) when the provider reports it in the final
//! chunk. OpenAI-style `choices[].delta` and Anthropic-style `usage`
//! payloads are both understood loosely via untyped JSON.

use serde_json::Value;

/// Extract the JSON payload from an SSE `data:` line.
///
/// Returns `None` for blank lines, comment lines, non-data fields, and the
/// terminal `data: [DONE]` sentinel.
pub fn extract_sse_data(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let payload = trimmed.strip_prefix("data:")?.trim_start();
    if payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

/// Accumulates usage and token counts from a streaming SSE response.
///
/// Feed it raw bytes from the upstream response; it splits on newlines,
/// parses complete SSE data lines, and tracks usage metrics. The raw bytes
/// themselves are captured separately by the forwarder.
#[derive(Debug, Default)]
pub struct StreamingAccumulator {
    /// Buffer for incomplete lines across chunk boundaries.
    line_buffer: String,
    /// Number of non-empty content deltas observed.
    pub observed_deltas: u32,
    /// Provider-reported prompt tokens, if seen.
    pub prompt_tokens: Option<u32>,
    /// Provider-reported completion tokens, if seen.
    pub completion_tokens: Option<u32>,
    /// Whether `data: [DONE]` was received.
    pub done: bool,
}

impl StreamingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a raw byte chunk from the upstream response.
    pub fn process_chunk(&mut self, bytes: &[u8]) {
        self.line_buffer.push_str(&String::from_utf8_lossy(bytes));

        while let Some(newline_pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer[..newline_pos].to_string();
            self.line_buffer = self.line_buffer[newline_pos + 1..].to_string();

            if line.trim().strip_prefix("data:").map(str::trim) == Some("[DONE]") {
                self.done = true;
                continue;
            }
            let Some(json_str) = extract_sse_data(&line) else {
                continue;
            };
            let Ok(chunk) = serde_json::from_str::<Value>(json_str) else {
                continue;
            };
            self.ingest(&chunk);
        }
    }

    fn ingest(&mut self, chunk: &Value) {
        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(content) = choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .and_then(Value::as_str)
                {
                    if !content.is_empty() {
                        self.observed_deltas += 1;
                    }
                }
            }
        }
        // Usage may appear at the top level (OpenAI final chunk, Anthropic
        // message_delta) either as prompt/completion or input/output names.
        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            let read = |keys: [&str; 2]| {
                keys.iter()
                    .find_map(|k| usage.get(*k).and_then(Value::as_u64))
                    .map(|n| n as u32)
            };
            if let Some(p) = read(["prompt_tokens", "input_tokens"]) {
                self.prompt_tokens = Some(p);
            }
            if let Some(c) = read(["completion_tokens", "output_tokens"]) {
                self.completion_tokens = Some(c);
            }
        }
    }

    /// Completion tokens: provider-reported if present, else the delta count.
    pub fn final_completion_tokens(&self) -> u32 {
        self.completion_tokens.unwrap_or(self.observed_deltas)
    }
}
