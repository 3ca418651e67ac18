//! Dialect adapters (C5): pure translation between the client-facing
//! OpenAI-compatible wire shape (dialect A) and whatever dialect the
//! resolved upstream actually speaks (spec.md §4.3).
//!
//! Every function here is `(&Value, ...) -> Value`, never mutating its
//! input — design note 9. `router.rs` is the only caller that owns a
//! mutable request; by the time a body reaches this module it is read-only.

pub mod anthropic;
pub mod generate_content;
pub mod normalize;
pub mod sse;
pub mod thinking;

use anyhow::Context;
use serde_json::{json, Value};

use crate::registry::Dialect;

/// The outbound request body plus whatever out-of-band dispatch info the
/// chosen dialect needs (today: only C's streaming path split).
pub struct TranslatedRequest {
    pub body: Value,
    /// `true` if the caller asked for a streamed response — for dialect C
    /// this selects `streamGenerateContent` over `generateContent`.
    pub stream: bool,
}

/// Translate a client (dialect A) request body into the shape `target`
/// expects, rewriting the model field to `native_model` — the bare
/// provider-native name for a direct dispatch, or the aggregator gateway's
/// own catalog id (C10) when the request is gateway-routed.
pub fn translate_request(body: &Value, target: Dialect, native_model: &str) -> anyhow::Result<TranslatedRequest> {
    match target {
        Dialect::A => Ok(TranslatedRequest { body: to_openai(body, native_model)?, stream: body["stream"].as_bool().unwrap_or(false) }),
        Dialect::B => Ok(TranslatedRequest { body: anthropic::to_anthropic(body, native_model)?, stream: body["stream"].as_bool().unwrap_or(false) }),
        Dialect::C => {
            let (translated, stream) = generate_content::to_generate_content(body, native_model)?;
            Ok(TranslatedRequest { body: translated, stream })
        }
    }
}

/// Dialect A passthrough translation: normalize messages and rewrite the
/// model field to the resolved native name, but leave the wire shape
/// otherwise untouched (the client already speaks this dialect).
fn to_openai(body: &Value, native_model: &str) -> anyhow::Result<Value> {
    let raw_messages = body["messages"].as_array().context("`messages` array is required")?;
    let normalized = normalize::normalize_messages(raw_messages);

    let mut out = body.clone();
    out["messages"] = json!(normalized);
    out["model"] = json!(native_model);
    Ok(out)
}

/// Translate a non-streaming upstream response back into dialect A.
pub fn translate_response(resp: &Value, source: Dialect) -> anyhow::Result<Value> {
    match source {
        Dialect::A => Ok(strip_thinking_in_place_copy(resp)),
        Dialect::B => anthropic::from_anthropic(resp),
        Dialect::C => from_generate_content(resp),
    }
}

/// A-shaped responses still need thinking blocks stripped from message
/// content before reaching the client (spec.md §8 invariant #10).
fn strip_thinking_in_place_copy(resp: &Value) -> Value {
    let mut out = resp.clone();
    if let Some(choices) = out.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices.iter_mut() {
            if let Some(content) = choice["message"]["content"].as_str() {
                let stripped = thinking::strip_thinking_blocks(content);
                choice["message"]["content"] = json!(stripped);
            }
        }
    }
    out
}

/// C → A (non-stream) response translation: a `generate-content` response
/// carries a single `candidates[0]` with the full answer in one shot rather
/// than chunks, so we can reuse [`generate_content::translate_chunk`].
fn from_generate_content(resp: &Value) -> anyhow::Result<Value> {
    let parsed = generate_content::translate_chunk(resp);
    let usage = &resp["usageMetadata"];
    let prompt_tokens = usage["promptTokenCount"].as_u64().unwrap_or(0);
    let completion_tokens = usage["candidatesTokenCount"].as_u64().unwrap_or(0);

    Ok(json!({
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": parsed.content.unwrap_or_default() },
            "finish_reason": parsed.finish_reason.unwrap_or_else(|| "stop".to_string()),
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_request_dialect_a_rewrites_model_and_normalizes() {
        let body = json!({
            "model": "auto",
            "messages": [{"role": "developer", "content": "be terse"}],
        });
        let out = translate_request(&body, Dialect::A, "gpt-5-mini").unwrap();
        assert_eq!(out.body["model"], "gpt-5-mini");
        assert_eq!(out.body["messages"][0]["role"], "system");
    }

    #[test]
    fn translate_request_dialect_a_does_not_mutate_input() {
        let body = json!({"model": "auto", "messages": [{"role": "user", "content": "hi"}]});
        let _ = translate_request(&body, Dialect::A, "gpt-5-mini").unwrap();
        assert_eq!(body["model"], "auto");
    }

    #[test]
    fn translate_request_dialect_b_delegates_to_anthropic_adapter() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let out = translate_request(&body, Dialect::B, "claude-haiku").unwrap();
        assert_eq!(out.body["model"], "claude-haiku");
    }

    #[test]
    fn translate_request_dialect_c_reports_stream_flag() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}], "stream": true});
        let out = translate_request(&body, Dialect::C, "gemini-pro").unwrap();
        assert!(out.stream);
        assert!(out.body.get("stream").is_none());
    }

    #[test]
    fn translate_response_dialect_a_strips_thinking_blocks() {
        let resp = json!({
            "choices": [{"message": {"role": "assistant", "content": "<think>x</think>answer"}}]
        });
        let out = translate_response(&resp, Dialect::A).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "answer");
    }

    #[test]
    fn translate_response_dialect_c_builds_usage_from_generate_content_shape() {
        let resp = json!({
            "candidates": [{"finishReason": "STOP", "content": {"parts": [{"text": "hi"}]}}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5},
        });
        let out = translate_response(&resp, Dialect::C).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "hi");
        assert_eq!(out["usage"]["total_tokens"], 15);
    }
}
