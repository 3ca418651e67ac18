//! Dialect B translation — the "messages" dialect: separate top-level
//! `system` field, `input_tokens`/`output_tokens` usage.
//!
//! Adapted from the teacher's `backends/anthropic.rs` `to_anthropic`/
//! `from_anthropic` functions, which were already pure `Value -> Value`
//! transforms — exactly the shape design note 9 requires for every dialect
//! adapter. Generalized here to route through [`super::normalize`] first and
//! to accept the already-resolved native model name rather than trusting
//! the caller's `model` field.

use anyhow::Context;
use serde_json::{json, Value};

use super::normalize::normalize_messages;

const DEFAULT_MAX_TOKENS: u64 = 8_192;
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A → B request translation (spec.md §4.3): extract consecutive
/// `system`-role messages into a top-level `system` string; coerce
/// remaining messages to alternating `user`/`assistant`; default
/// `max_tokens` if absent. Pure: does not mutate `request`.
pub fn to_anthropic(request: &Value, native_model: &str) -> anyhow::Result<Value> {
    let raw_messages = request["messages"].as_array().context("`messages` array is required")?;
    let normalized = normalize_messages(raw_messages);

    let max_tokens = request["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(normalized.len());
    for msg in normalized {
        if msg["role"] == "system" {
            if let Some(content) = msg["content"].as_str() {
                system_parts.push(content.to_string());
            }
        } else {
            messages.push(msg);
        }
    }

    let mut req = json!({
        "model": native_model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !system_parts.is_empty() {
        req["system"] = json!(system_parts.join("\n\n"));
    }
    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(stop) = request.get("stop") {
        req["stop_sequences"] = stop.clone();
    }
    if let Some(stream) = request["stream"].as_bool() {
        req["stream"] = json!(stream);
    }

    Ok(req)
}

/// B → A (non-stream) response translation (spec.md §4.3).
pub fn from_anthropic(resp: &Value) -> anyhow::Result<Value> {
    let text = resp["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .map(super::thinking::strip_thinking_blocks)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let model = resp["model"].as_str().unwrap_or("unknown");
    let finish_reason = map_stop_reason(resp["stop_reason"].as_str().unwrap_or("stop"));

    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

/// `end_turn → stop`, others pass through (spec.md §4.3).
pub(super) fn map_stop_reason(reason: &str) -> &str {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        other => other,
    }
}
