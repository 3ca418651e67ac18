//! Dialect C translation — the streamed "generate-content" dialect:
//! content-part message trees, SSE query-parameter streaming flag, alternate
//! SSE field names (spec.md §4.3).

use anyhow::Context;
use serde_json::{json, Value};

use super::normalize::{ensure_first_message_is_user, normalize_messages};

/// A → C request translation: transform each message to the provider's
/// content-part tree; the `stream` flag is reported back to the caller as a
/// query-parameter suffix rather than a body field (Google's
/// `generateContent` vs `streamGenerateContent` path split).
pub fn to_generate_content(request: &Value, native_model: &str) -> anyhow::Result<(Value, bool)> {
    let raw_messages = request["messages"].as_array().context("`messages` array is required")?;
    let normalized = ensure_first_message_is_user(normalize_messages(raw_messages));

    let mut system_instruction: Option<Value> = None;
    let mut contents = Vec::with_capacity(normalized.len());

    for msg in normalized {
        let role = msg["role"].as_str().unwrap_or("user");
        let text = msg["content"].as_str().unwrap_or_default();
        if role == "system" {
            system_instruction = Some(json!({ "parts": [{ "text": text }] }));
            continue;
        }
        let google_role = if role == "assistant" { "model" } else { "user" };
        contents.push(json!({
            "role": google_role,
            "parts": [{ "text": text }],
        }));
    }

    let mut body = json!({ "contents": contents, "model": native_model });
    if let Some(sys) = system_instruction {
        body["systemInstruction"] = sys;
    }
    if let Some(max_tokens) = request["max_tokens"].as_u64() {
        body["generationConfig"] = json!({ "maxOutputTokens": max_tokens });
    }

    let stream = request["stream"].as_bool().unwrap_or(false);
    Ok((body, stream))
}

/// One `generate-content` SSE frame's JSON payload, translated to zero or
/// more A-shaped OpenAI delta frames. `finish_reason` is carried separately
/// so the caller (the SSE state machine in [`super::sse`]) can order it
/// after content frames per spec.md §5's "role precedes content precedes
/// tool_calls precedes finish_reason" guarantee.
pub struct TranslatedChunk {
    pub role: Option<&'static str>,
    pub content: Option<String>,
    pub finish_reason: Option<String>,
}

/// Parse one `generate-content` JSON chunk into the fields an A-shaped delta
/// frame needs.
pub fn translate_chunk(chunk: &Value) -> TranslatedChunk {
    let candidate = &chunk["candidates"][0];
    let text: Option<String> = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|s| !s.is_empty())
        .map(|s| super::thinking::strip_thinking_blocks(&s));

    let finish_reason = candidate["finishReason"].as_str().map(map_finish_reason);

    TranslatedChunk {
        role: text.as_ref().map(|_| "assistant"),
        content: text,
        finish_reason,
    }
}

fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        other => return other.to_lowercase(),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_generate_content_moves_system_message_to_system_instruction() {
        let req = json!({
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ]
        });
        let (body, stream) = to_generate_content(&req, "gemini-pro").unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(body["contents"][0]["role"], "user");
        assert!(!stream);
    }

    #[test]
    fn to_generate_content_maps_assistant_role_to_model() {
        let req = json!({"messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
        ]});
        let (body, _) = to_generate_content(&req, "m").unwrap();
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[test]
    fn to_generate_content_injects_synthetic_first_user_message() {
        let req = json!({"messages": [
            {"role": "system", "content": "sys"},
            {"role": "assistant", "content": "hello"},
        ]});
        let (body, _) = to_generate_content(&req, "m").unwrap();
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[test]
    fn to_generate_content_reports_stream_flag_separately() {
        let req = json!({"messages": [{"role": "user", "content": "hi"}], "stream": true});
        let (body, stream) = to_generate_content(&req, "m").unwrap();
        assert!(stream);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn translate_chunk_extracts_text_and_strips_thinking() {
        let chunk = json!({
            "candidates": [{
                "content": {"parts": [{"text": "<think>x</think>answer"}]},
            }]
        });
        let out = translate_chunk(&chunk);
        assert_eq!(out.content.as_deref(), Some("answer"));
        assert_eq!(out.role, Some("assistant"));
    }

    #[test]
    fn translate_chunk_maps_finish_reasons() {
        let chunk = json!({"candidates": [{"finishReason": "STOP", "content": {"parts": []}}]});
        let out = translate_chunk(&chunk);
        assert_eq!(out.finish_reason.as_deref(), Some("stop"));
    }
}
