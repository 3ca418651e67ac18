//! Admin API (port 8081) — operator-facing introspection endpoints.
//!
//! Separated onto its own port so it can be network-restricted independently
//! of the client API (e.g. accessible only from the internal network, never
//! exposed to the internet), and gated by [`super::admin_auth`] when an
//! admin token is configured.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::router::RouterState;

/// Build the admin-facing axum router (port 8081).
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/metrics", get(super::metrics::metrics))
        .with_state(state)
}

/// GET /admin/health — liveness plus registry size.
pub async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let routing = state.routing();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "models": routing.registry.models.len(),
        "tiers": routing.registry.tiers.len(),
    }))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// GET /admin/traffic?limit=N — recent N traffic entries (default 100).
pub async fn traffic(State(state): State<Arc<RouterState>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = state.traffic.recent(q.limit).await;
    let stats = state.traffic.stats().await;
    Json(json!({ "stats": stats, "entries": entries }))
}

/// GET /admin/config — the current routing config with secrets redacted
/// (env var names are shown, resolved values are not).
pub async fn config(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let routing = state.routing();
    let keys = state.keys();

    let models: Vec<Value> = routing
        .registry
        .models
        .values()
        .map(|m| {
            json!({
                "id": m.id,
                "provider": m.provider.as_str(),
                "context_window": m.context_window,
                "input_price": m.input_price,
                "output_price": m.output_price,
                "agentic": m.agentic,
            })
        })
        .collect();

    let tiers: Value = routing
        .registry
        .tiers
        .iter()
        .map(|(tier, cfg)| (tier.to_string(), json!({ "primary": cfg.primary, "fallback": cfg.fallback })))
        .collect::<serde_json::Map<_, _>>()
        .into();

    let configured_key_providers: Vec<&str> = keys.providers.keys().map(String::as_str).collect();

    Json(json!({
        "gateway": {
            "client_port": routing.gateway.client_port,
            "admin_port": routing.gateway.admin_port,
            "base_url": routing.gateway.base_url,
            "api_key_env": routing.gateway.api_key_env,
            "catalog_cache_ttl_secs": routing.gateway.catalog_cache_ttl_secs,
            "traffic_log_capacity": routing.gateway.traffic_log_capacity,
            "rate_limit_rpm": routing.gateway.rate_limit_rpm,
        },
        "models": models,
        "tiers": tiers,
        "aliases": routing.registry.aliases,
        "configured_key_providers": configured_key_providers,
    }))
}
