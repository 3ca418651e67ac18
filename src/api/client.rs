//! Client-facing API (port 8080) — the endpoint agents talk to.
//!
//! This is intentionally a thin layer: all routing logic lives in
//! [`crate::router`]. Handlers translate HTTP concerns (status codes, JSON
//! bodies, SSE framing) into calls to the router and back.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::router::{passthrough_request, route_chat_completions, RouteOutcome, RouterState};

/// Build the client-facing axum router (port 8080).
///
/// The `/v1/{*rest}` wildcard sits behind the two named `/v1/...` routes
/// above it; axum prefers the more specific literal match, so those two
/// still take `/v1/chat/completions` and `/v1/models` themselves.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/health", get(crate::api::status::health))
        .route("/stats", get(crate::api::stats::stats))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/{*rest}", any(passthrough))
        .with_state(state)
}

/// POST /v1/chat/completions — RECEIVE → ... → COMPLETE (spec.md §4.4).
pub async fn chat_completions(
    State(state): State<Arc<RouterState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    match route_chat_completions(&state, body, &headers).await {
        Ok(RouteOutcome::NonStream { body, .. }) => (StatusCode::OK, Json(body)).into_response(),
        Ok(RouteOutcome::Stream { stream, .. }) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(e) => {
            let (status, body) = e.into_response_parts();
            (status, Json(body)).into_response()
        }
    }
}

/// Any other `/v1/*` path — passthrough after translation (spec.md §6):
/// forwarded to the resolved upstream base URL verbatim, with only the
/// outbound `model` field rewritten when the body names one.
pub async fn passthrough(
    State(state): State<Arc<RouterState>>,
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> impl IntoResponse {
    let path_and_query = match query {
        Some(q) => format!("{}?{}", uri.path(), q),
        None => uri.path().to_string(),
    };
    match passthrough_request(&state, method, &path_and_query, body).await {
        Ok((status, content_type, bytes)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = content_type.unwrap_or_else(|| "application/json".to_string());
            (status, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(e) => {
            let (status, body) = e.into_response_parts();
            (status, Json(body)).into_response()
        }
    }
}

/// GET /v1/models — models filtered to the accessible set, `auto` always
/// present (spec.md §6).
pub async fn list_models(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let routing = state.routing();
    let keys = state.keys();

    let mut data: Vec<Value> = routing
        .registry
        .models
        .values()
        .filter(|m| crate::keyresolver::is_resolvable(m, &keys, &routing.gateway))
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "created": 0,
                "owned_by": m.provider.as_str(),
            })
        })
        .collect();

    data.push(json!({ "id": "auto", "object": "model", "created": 0, "owned_by": "model-router" }));

    Json(json!({ "object": "list", "data": data }))
}
