//! Message normalization applied before dispatch, regardless of target
//! dialect (spec.md §4.3 "Message normalization").
//!
//! Operates on the already-parsed `messages` array as a pure
//! `Vec<Value> -> Vec<Value>` transform, in keeping with design note 9:
//! request translation must never mutate the caller's body in place.

use serde_json::{json, Value};

use once_cell::sync::Lazy;
use regex::Regex;

static TOOL_CALL_ID_INVALID_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("tool-call-id pattern must compile"));

/// Replace characters outside `[A-Za-z0-9_-]` with `_` — required by at
/// least one dialect's strict validator (spec.md §4.3).
pub fn sanitize_tool_call_id(id: &str) -> String {
    TOOL_CALL_ID_INVALID_CHARS.replace_all(id, "_").into_owned()
}

/// `developer → system`, `model → assistant`; anything else collapses to
/// `user` (spec.md §4.3).
pub fn remap_role(role: &str) -> &'static str {
    match role {
        "system" | "developer" => "system",
        "assistant" | "model" => "assistant",
        "user" => "user",
        "tool" => "tool",
        _ => "user",
    }
}

/// Apply role remapping and tool-call-id sanitization to every message,
/// returning a new array — the input is never mutated.
pub fn normalize_messages(messages: &[Value]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let mut out = msg.clone();
            if let Some(role) = msg.get("role").and_then(Value::as_str) {
                out["role"] = json!(remap_role(role));
            }
            if let Some(tool_calls) = out.get_mut("tool_calls").and_then(Value::as_array_mut) {
                for call in tool_calls.iter_mut() {
                    if let Some(id) = call.get("id").and_then(Value::as_str).map(str::to_string) {
                        call["id"] = json!(sanitize_tool_call_id(&id));
                    }
                }
            }
            if let Some(id) = out.get("tool_call_id").and_then(Value::as_str).map(str::to_string) {
                out["tool_call_id"] = json!(sanitize_tool_call_id(&id));
            }
            ensure_reasoning_content(&mut out);
            out
        })
        .collect()
}

/// When `thinking` is set on an assistant message carrying tool calls,
/// ensure a `reasoning_content` field exists, even if empty (spec.md §4.3).
fn ensure_reasoning_content(msg: &mut Value) {
    let is_assistant = msg.get("role").and_then(Value::as_str) == Some("assistant");
    let has_tool_calls = msg.get("tool_calls").map(|v| !v.is_null()).unwrap_or(false);
    let has_thinking = msg.get("thinking").map(|v| !v.is_null()).unwrap_or(false);
    if is_assistant && has_tool_calls && has_thinking && msg.get("reasoning_content").is_none() {
        msg["reasoning_content"] = json!("");
    }
}

/// For dialect C, guarantee the first non-system message has role `user`,
/// injecting a synthetic placeholder if it does not (spec.md §4.3).
pub fn ensure_first_message_is_user(messages: Vec<Value>) -> Vec<Value> {
    let first_non_system = messages.iter().find(|m| m.get("role").and_then(Value::as_str) != Some("system"));
    match first_non_system.and_then(|m| m.get("role")).and_then(Value::as_str) {
        Some("user") | None => messages,
        _ => {
            let insert_at = messages
                .iter()
                .position(|m| m.get("role").and_then(Value::as_str) != Some("system"))
                .unwrap_or(messages.len());
            let mut out = messages;
            out.insert(insert_at, json!({ "role": "user", "content": "(continuing conversation)" }));
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_tool_call_id("call:abc.123"), "call_abc_123");
        assert_eq!(sanitize_tool_call_id("call-abc_123"), "call-abc_123");
    }

    #[test]
    fn remap_role_translates_developer_and_model() {
        assert_eq!(remap_role("developer"), "system");
        assert_eq!(remap_role("model"), "assistant");
        assert_eq!(remap_role("assistant"), "assistant");
    }

    #[test]
    fn remap_role_collapses_unknown_roles_to_user() {
        assert_eq!(remap_role("narrator"), "user");
    }

    #[test]
    fn normalize_messages_sanitizes_tool_call_ids() {
        let messages = vec![json!({
            "role": "assistant",
            "tool_calls": [{"id": "call:weird.id", "type": "function"}],
        })];
        let out = normalize_messages(&messages);
        assert_eq!(out[0]["tool_calls"][0]["id"], "call_weird_id");
    }

    #[test]
    fn normalize_messages_remaps_roles() {
        let messages = vec![json!({"role": "developer", "content": "be terse"})];
        let out = normalize_messages(&messages);
        assert_eq!(out[0]["role"], "system");
    }

    #[test]
    fn ensure_reasoning_content_added_when_thinking_and_tool_calls_present() {
        let messages = vec![json!({
            "role": "assistant",
            "thinking": "pondering...",
            "tool_calls": [{"id": "x"}],
        })];
        let out = normalize_messages(&messages);
        assert_eq!(out[0]["reasoning_content"], "");
    }

    #[test]
    fn ensure_first_message_is_user_injects_synthetic_when_missing() {
        let messages = vec![
            json!({"role": "system", "content": "sys"}),
            json!({"role": "assistant", "content": "hi"}),
        ];
        let out = ensure_first_message_is_user(messages);
        assert_eq!(out[1]["role"], "user");
        assert_eq!(out[1]["content"], "(continuing conversation)");
    }

    #[test]
    fn ensure_first_message_is_user_noop_when_already_user() {
        let messages = vec![
            json!({"role": "system", "content": "sys"}),
            json!({"role": "user", "content": "hi"}),
        ];
        let out = ensure_first_message_is_user(messages.clone());
        assert_eq!(out, messages);
    }

    #[test]
    fn original_input_is_not_mutated() {
        let messages = vec![json!({"role": "developer", "content": "x"})];
        let _ = normalize_messages(&messages);
        assert_eq!(messages[0]["role"], "developer");
    }
}
