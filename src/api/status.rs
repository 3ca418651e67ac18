//! `GET /health` (port 8080) — spec.md §6.
//!
//! Unlike the teacher's original `/status` (which deliberately hides backend
//! names), this endpoint's shape is specified down to the field names:
//! `{status, configuredProviders[], gatewayFallback, accessibleProviders[],
//! modelCount}`. `configuredProviders` lists every provider with a direct key
//! in [`crate::config::keys::ApiKeysConfig`]; `accessibleProviders` is the
//! (possibly larger) set reachable once the gateway fallback is counted too.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::keyresolver;
use crate::registry::ProviderPrefix;
use crate::router::RouterState;

const ALL_PROVIDERS: [ProviderPrefix; 6] = [
    ProviderPrefix::OpenAI,
    ProviderPrefix::Anthropic,
    ProviderPrefix::Google,
    ProviderPrefix::Groq,
    ProviderPrefix::DeepSeek,
    ProviderPrefix::Mistral,
];

/// `GET /health` — liveness plus a provider-reachability summary.
pub async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let routing = state.routing();
    let keys = state.keys();

    let configured_providers: Vec<&str> = ALL_PROVIDERS
        .iter()
        .filter(|p| keys.key_for(**p).is_some())
        .map(|p| p.as_str())
        .collect();

    let gateway_fallback = routing.gateway.api_key().is_some() && routing.gateway.base_url.is_some();

    let accessible_providers: Vec<&str> = ALL_PROVIDERS
        .iter()
        .filter(|p| {
            let dummy_model = crate::registry::Model {
                id: format!("{p}/probe"),
                provider: **p,
                context_window: 1,
                input_price: 0.0,
                output_price: 0.0,
                agentic: false,
            };
            keyresolver::is_resolvable(&dummy_model, &keys, &routing.gateway)
        })
        .map(|p| p.as_str())
        .collect();

    let model_count = routing.registry.models.len();

    Json(json!({
        "status": "ok",
        "configuredProviders": configured_providers,
        "gatewayFallback": gateway_fallback,
        "accessibleProviders": accessible_providers,
        "modelCount": model_count,
    }))
}
