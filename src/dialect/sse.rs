//! SSE frame state machine (spec.md §4.3, §9 design note 3).
//!
//! Models the first-bytes discriminator (`data: `, `event:`, `: `) as a
//! small buffering state machine rather than a regex, so a frame split
//! across two upstream reads is handled correctly — the buffer only yields
//! a frame once a blank-line terminator has been seen.

use serde_json::Value;

use super::anthropic::map_stop_reason;
use super::generate_content::translate_chunk;
use super::thinking::strip_thinking_blocks;

/// One parsed SSE field line.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Data(String),
    Event(String),
    Comment(String),
}

/// Accumulates bytes across reads and yields complete frames (one or more
/// field lines terminated by a blank line) as they become available.
#[derive(Default)]
pub struct FrameBuffer {
    pending: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-read bytes; returns every complete frame now available,
    /// in order. Any trailing partial frame stays buffered for the next call.
    pub fn push(&mut self, chunk: &str) -> Vec<Vec<Field>> {
        self.pending.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(boundary) = find_frame_boundary(&self.pending) {
            let raw_frame = self.pending[..boundary.frame_end].to_string();
            self.pending.drain(..boundary.consume_end);
            let fields: Vec<Field> = raw_frame.lines().filter_map(parse_field_line).collect();
            if !fields.is_empty() {
                frames.push(fields);
            }
        }
        frames
    }
}

struct Boundary {
    frame_end: usize,
    consume_end: usize,
}

fn find_frame_boundary(buf: &str) -> Option<Boundary> {
    let idx = buf.find("\n\n").map(|i| (i, 2)).or_else(|| buf.find("\r\n\r\n").map(|i| (i, 4)))?;
    Some(Boundary { frame_end: idx.0, consume_end: idx.0 + idx.1 })
}

fn parse_field_line(line: &str) -> Option<Field> {
    let line = line.trim_end_matches('\r');
    if let Some(rest) = line.strip_prefix("data:") {
        Some(Field::Data(rest.trim_start_matches(' ').to_string()))
    } else if let Some(rest) = line.strip_prefix("event:") {
        Some(Field::Event(rest.trim_start_matches(' ').to_string()))
    } else if let Some(rest) = line.strip_prefix(':') {
        Some(Field::Comment(rest.to_string()))
    } else if line.is_empty() {
        None
    } else {
        // Unrecognized line shape; treat conservatively as a comment so it
        // is never forwarded as data.
        Some(Field::Comment(line.to_string()))
    }
}

/// True if a `data:` payload is a vendor keepalive/comment frame disguised
/// as data (e.g. `data: : PROCESSING`) rather than real content — spec.md
/// §4.3: these must be dropped, not forwarded to a strict OpenAI-compatible
/// client.
pub fn is_vendor_keepalive_payload(payload: &str) -> bool {
    payload.trim_start().starts_with(':')
}

/// Re-serialize a field list back into a full SSE frame with a blank-line
/// terminator.
pub fn render_frame(fields: &[Field]) -> String {
    let mut out = String::new();
    for field in fields {
        match field {
            Field::Data(d) => out.push_str(&format!("data: {d}\n")),
            Field::Event(e) => out.push_str(&format!("event: {e}\n")),
            Field::Comment(c) => out.push_str(&format!(":{c}\n")),
        }
    }
    out.push('\n');
    out
}

/// If upstream already emits A-shaped SSE (the aggregator gateway case),
/// scan each frame: drop vendor keepalive frames, and strip thinking blocks
/// from any content found in a delta. Returns `None` for frames that should
/// not be forwarded at all.
pub fn passthrough_a_frame(fields: Vec<Field>) -> Option<Vec<Field>> {
    let data_payloads: Vec<&String> = fields
        .iter()
        .filter_map(|f| match f {
            Field::Data(d) => Some(d),
            _ => None,
        })
        .collect();

    if data_payloads.iter().any(|d| is_vendor_keepalive_payload(d)) {
        return None;
    }
    if data_payloads.iter().any(|d| d.trim() == "[DONE]") {
        return Some(fields);
    }

    let cleaned: Vec<Field> = fields
        .into_iter()
        .map(|f| match f {
            Field::Data(d) => {
                let stripped = strip_content_field(&d);
                Field::Data(stripped)
            }
            other => other,
        })
        .collect();
    Some(cleaned)
}

/// Parse a `data:` JSON payload, strip thinking blocks from
/// `choices[].delta.content` if present, and re-serialize. Non-JSON or
/// unrecognized shapes pass through unchanged.
fn strip_content_field(payload: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(payload) else {
        return payload.to_string();
    };
    if let Some(choices) = value.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices.iter_mut() {
            if let Some(content) = choice["delta"]["content"].as_str() {
                let stripped = strip_thinking_blocks(content);
                choice["delta"]["content"] = Value::String(stripped);
            }
        }
    }
    value.to_string()
}

/// Stateful translator for dialect C → A streaming: tracks whether the
/// leading `{role:"assistant"}` delta has already been emitted, since
/// `generate-content` frames don't carry a role marker of their own
/// (spec.md §5: role frame precedes content frames within a response).
pub struct CToATranslator {
    role_sent: bool,
    id: String,
    model: String,
}

impl CToATranslator {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self { role_sent: false, id: id.into(), model: model.into() }
    }

    /// Translate one `generate-content` JSON chunk into the ordered A-shaped
    /// delta frames it produces (role frame first if not yet sent, then
    /// content, then finish_reason).
    pub fn translate(&mut self, chunk: &Value) -> Vec<Value> {
        let parsed = translate_chunk(chunk);
        let mut out = Vec::new();

        if !self.role_sent && (parsed.role.is_some() || parsed.content.is_some()) {
            out.push(self.delta_frame(serde_json::json!({ "role": "assistant" }), None));
            self.role_sent = true;
        }
        if let Some(content) = parsed.content {
            out.push(self.delta_frame(serde_json::json!({ "content": content }), None));
        }
        if let Some(finish_reason) = parsed.finish_reason {
            out.push(self.delta_frame(serde_json::json!({}), Some(finish_reason)));
        }
        out
    }

    fn delta_frame(&self, delta: Value, finish_reason: Option<String>) -> Value {
        serde_json::json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}

/// Stateful translator for dialect B → A streaming: Anthropic's event
/// stream is keyed by a `type` field on each `data:` payload
/// (`content_block_delta`, `message_delta`, …) rather than by an SSE
/// `event:` line, so only the payload is consulted here.
pub struct BToATranslator {
    role_sent: bool,
    id: String,
    model: String,
}

impl BToATranslator {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self { role_sent: false, id: id.into(), model: model.into() }
    }

    /// Translate one Anthropic event payload into the ordered A-shaped
    /// delta frames it produces, if any.
    pub fn translate(&mut self, payload: &Value) -> Vec<Value> {
        let mut out = Vec::new();
        match payload["type"].as_str() {
            Some("content_block_delta") if payload["delta"]["type"] == "text_delta" => {
                let text = payload["delta"]["text"].as_str().unwrap_or_default();
                if text.is_empty() {
                    return out;
                }
                let content = strip_thinking_blocks(text);
                if !self.role_sent {
                    out.push(self.delta_frame(serde_json::json!({ "role": "assistant" }), None));
                    self.role_sent = true;
                }
                out.push(self.delta_frame(serde_json::json!({ "content": content }), None));
            }
            Some("message_delta") => {
                if let Some(stop_reason) = payload["delta"]["stop_reason"].as_str() {
                    out.push(self.delta_frame(serde_json::json!({}), Some(map_stop_reason(stop_reason).to_string())));
                }
            }
            _ => {}
        }
        out
    }

    fn delta_frame(&self, delta: Value, finish_reason: Option<String>) -> Value {
        serde_json::json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}
