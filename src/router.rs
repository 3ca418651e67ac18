//! Proxy Server (C9) — the request state machine described in spec.md §4.4:
//! RECEIVE → CLASSIFY → RESOLVE_KEY → DEDUP_CHECK → DISPATCH → STREAM →
//! COMPLETE, with FALLBACK_NEXT looping back into DISPATCH on a retryable
//! upstream failure.
//!
//! `RouterState` wires together every other component (C1-C2, C4, C6-C8,
//! C10) behind the same `RwLock<Arc<_>>` pointer-swap the teacher uses for
//! `RouterState::config_lock`, so a hot config reload never blocks an
//! in-flight request against a half-updated config.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use once_cell::sync::Lazy;
use regex::RegexSet;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::classifier;
use crate::config::keys::ApiKeysConfig;
use crate::config::routing::RoutingConfig;
use crate::dedup::{CompletedResponse, DedupLookup, DedupStore};
use crate::dialect::{
    self,
    sse::{passthrough_a_frame, render_frame, BToATranslator, CToATranslator, Field, FrameBuffer},
};
use crate::error::ProxyError;
use crate::gateway_catalog::GatewayCatalog;
use crate::keyresolver::{self, ResolvedAccess};
use crate::ratelimit::RateLimitMap;
use crate::registry::{Dialect, Model, ModelRegistry, Tier};
use crate::selector;
use crate::session::SessionStore;
use crate::traffic::{RoutingDecision, TrafficLog, UsageEntry};

/// spec.md §4.4 FALLBACK_NEXT: "at most `MAX_FALLBACK_ATTEMPTS` dispatch
/// attempts per request."
pub const MAX_FALLBACK_ATTEMPTS: usize = 3;
/// spec.md §5: per-request deadline from dispatch to either completion or
/// exhaustion of the fallback chain.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 180_000;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// Assumed completion length when the client sets no `max_tokens` — used
/// only for cost estimation, never to cap an actual request.
const DEFAULT_OUTPUT_TOKEN_ESTIMATE: u64 = 1024;

/// Chat-completions stream body: a boxed byte stream the axum handler hands
/// straight to `axum::body::Body::from_stream`.
pub type SseStream = std::pin::Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

pub struct RouterState {
    routing_lock: RwLock<Arc<RoutingConfig>>,
    pub routing_path: PathBuf,
    keys_lock: RwLock<Arc<ApiKeysConfig>>,
    pub keys_path: PathBuf,
    pub catalog: Arc<GatewayCatalog>,
    pub dedup: DedupStore,
    pub sessions: SessionStore,
    pub rate_limits: RateLimitMap,
    pub traffic: Arc<TrafficLog>,
    /// Per-client-IP abuse guard on the client port — ambient, distinct
    /// from [`RateLimitMap`]'s per-model cooldown marks. `None` disables it.
    pub rate_limiter: Option<Arc<crate::api::rate_limit::RateLimiter>>,
    /// Resolved admin-API bearer token, if `gateway.admin_token_env` names a
    /// set environment variable. `None` disables admin auth.
    pub admin_token: Option<String>,
    http: Client,
    pub started_at: Instant,
}

impl RouterState {
    pub fn new(
        routing: Arc<RoutingConfig>,
        routing_path: PathBuf,
        keys: Arc<ApiKeysConfig>,
        keys_path: PathBuf,
        catalog: Arc<GatewayCatalog>,
        traffic: Arc<TrafficLog>,
        http: Client,
    ) -> Self {
        let stores = routing.stores.clone();
        let rate_limiter = routing.gateway.rate_limit_rpm.map(|rpm| Arc::new(crate::api::rate_limit::RateLimiter::new(rpm)));
        let admin_token = routing.gateway.admin_token_env.as_deref().and_then(|var| std::env::var(var).ok());
        Self {
            dedup: DedupStore::new(Duration::from_secs(stores.dedup_ttl_secs), stores.dedup_max_entries),
            sessions: SessionStore::new(Duration::from_secs(stores.session_ttl_secs), stores.session_max_entries),
            rate_limits: RateLimitMap::new(Duration::from_secs(stores.rate_limit_cooldown_secs)),
            routing_lock: RwLock::new(routing),
            routing_path,
            keys_lock: RwLock::new(keys),
            keys_path,
            catalog,
            traffic,
            rate_limiter,
            admin_token,
            http,
            started_at: Instant::now(),
        }
    }

    pub fn routing(&self) -> Arc<RoutingConfig> {
        self.routing_lock.read().expect("routing config lock poisoned").clone()
    }

    pub fn replace_routing(&self, new: Arc<RoutingConfig>) {
        *self.routing_lock.write().expect("routing config lock poisoned") = new;
    }

    pub fn keys(&self) -> Arc<ApiKeysConfig> {
        self.keys_lock.read().expect("keys lock poisoned").clone()
    }

    pub fn replace_keys(&self, new: Arc<ApiKeysConfig>) {
        *self.keys_lock.write().expect("keys lock poisoned") = new;
    }
}

/// What CLASSIFY produced for one request — enough for DISPATCH to proceed
/// and for COMPLETE to log a [`RoutingDecision`].
struct ClassifyOutcome {
    decision: RoutingDecision,
    /// Tier-appropriate candidate chain, primary first.
    candidates: Vec<String>,
}

/// Result of a full `route_chat_completions` call.
pub enum RouteOutcome {
    NonStream { body: Value, entry: UsageEntry },
    Stream { stream: SseStream, entry: UsageEntry },
}

/// `model ∈ {"auto", "<providerPrefix>/auto"}` — spec.md §4.1: the only
/// values that trigger classification; anything else names a model directly.
fn is_auto_route(model_hint: &str) -> bool {
    model_hint == "auto" || model_hint.ends_with("/auto")
}

/// spec.md §4.2: "agentic" means the request already carries `tools` and has
/// made at least one prior tool call in this conversation.
fn is_agentic(body: &Value) -> bool {
    let has_tools = body.get("tools").and_then(Value::as_array).map(|t| !t.is_empty()).unwrap_or(false);
    if !has_tools {
        return false;
    }
    body["messages"]
        .as_array()
        .map(|msgs| {
            msgs.iter()
                .any(|m| m["role"] == "assistant" && m.get("tool_calls").map(|t| !t.is_null()).unwrap_or(false))
        })
        .unwrap_or(false)
}

fn extract_prompts(body: &Value) -> (String, Option<String>) {
    let mut user_parts = Vec::new();
    let mut system_parts = Vec::new();
    if let Some(messages) = body["messages"].as_array() {
        for m in messages {
            let Some(content) = m["content"].as_str() else { continue };
            match m["role"].as_str() {
                Some("system") | Some("developer") => system_parts.push(content),
                Some("user") => user_parts.push(content),
                _ => {}
            }
        }
    }
    let system_prompt = (!system_parts.is_empty()).then(|| system_parts.join("\n"));
    (user_parts.join("\n"), system_prompt)
}

/// `(estimatedInputTokens, estimatedOutputTokens)` for cost projection —
/// spec.md §3 `RoutingDecision.costEstimate`.
fn estimate_request_tokens(body: &Value, user_tokens: u64) -> (u64, u64) {
    let system_tokens = body["messages"]
        .as_array()
        .map(|msgs| {
            msgs.iter()
                .filter(|m| m["role"] == "system" || m["role"] == "developer")
                .filter_map(|m| m["content"].as_str())
                .map(classifier::estimate_tokens)
                .sum()
        })
        .unwrap_or(0);
    let output_tokens = body["max_tokens"].as_u64().unwrap_or(DEFAULT_OUTPUT_TOKEN_ESTIMATE);
    (user_tokens + system_tokens, output_tokens)
}

fn most_expensive_in_tier<'a>(registry: &'a ModelRegistry, tier: Tier, agentic: bool) -> Option<&'a Model> {
    registry
        .tier_config(tier, agentic)?
        .chain()
        .filter_map(|id| registry.get(id))
        .max_by(|a, b| a.input_price.partial_cmp(&b.input_price).unwrap_or(std::cmp::Ordering::Equal))
}

fn context_window_ok(model: &Model, estimated_input_tokens: u64, estimated_output_tokens: u64) -> bool {
    model.context_window as u64 >= estimated_input_tokens + estimated_output_tokens
}

/// CLASSIFY: session pin first, then classifier + selector widening —
/// spec.md §4.4 and §4.6.
fn classify(state: &RouterState, body: &Value, headers: &HeaderMap) -> Result<ClassifyOutcome, ProxyError> {
    let routing = state.routing();
    let keys = state.keys();
    let model_hint = body["model"].as_str().unwrap_or("auto");
    let session_id = SessionStore::session_id_from_headers(headers);

    if !is_auto_route(model_hint) {
        let model = routing
            .registry
            .get(model_hint)
            .ok_or_else(|| ProxyError::Routing(format!("unknown model `{model_hint}`")))?;
        let decision = RoutingDecision::new("explicit", model.id.clone(), 0.0, 0.0, "client-specified model");
        return Ok(ClassifyOutcome { decision, candidates: vec![model.id.clone()] });
    }

    if let Some(sid) = &session_id {
        if let Some(pinned) = state.sessions.get_session(sid) {
            if let Some(model) = routing.registry.get(&pinned.model) {
                state.sessions.touch_session(sid);
                let decision = RoutingDecision::new(pinned.tier.to_string(), model.id.clone(), 0.0, 0.0, "reused session pin")
                    .with_note("resolved via session pin");
                let mut candidates: Vec<String> = routing
                    .registry
                    .tier_config(pinned.tier, false)
                    .map(|c| c.chain().map(str::to_string).collect())
                    .unwrap_or_default();
                candidates.retain(|id| id != &model.id);
                candidates.insert(0, model.id.clone());
                return Ok(ClassifyOutcome { decision, candidates });
            }
        }
    }

    let (user_prompt, system_prompt) = extract_prompts(body);
    let user_tokens = classifier::estimate_tokens(&user_prompt);
    let result = classifier::classify(&user_prompt, system_prompt.as_deref(), user_tokens, &routing.scoring);
    let agentic = is_agentic(body);
    let (est_in, est_out) = estimate_request_tokens(body, user_tokens);

    let (tier, tier_cfg) = selector::widen_until_resolvable(&routing.registry, result.tier, agentic, |id| {
        routing
            .registry
            .get(id)
            .map(|m| keyresolver::is_resolvable(m, &keys, &routing.gateway) && context_window_ok(m, est_in, est_out))
            .unwrap_or(false)
    })
    .ok_or(ProxyError::NoProviderConfigured)?;

    let candidates: Vec<String> = tier_cfg.chain().map(str::to_string).collect();
    let primary = routing.registry.get(&candidates[0]).ok_or(ProxyError::NoProviderConfigured)?;
    let baseline = most_expensive_in_tier(&routing.registry, tier, agentic);
    let cost = primary.estimate_cost(est_in, est_out);
    let baseline_cost = baseline.map(|m| m.estimate_cost(est_in, est_out)).unwrap_or(cost);

    let mut decision = RoutingDecision::new(
        tier.to_string(),
        primary.id.clone(),
        cost,
        baseline_cost,
        format!("classified {tier} (score {:.2})", result.score),
    );
    if tier != result.tier {
        decision = decision.with_note(format!("widened {} -> {tier} (no reachable provider)", result.tier));
    }

    if let Some(sid) = &session_id {
        state.sessions.set_session(sid, &primary.id, tier);
    }

    Ok(ClassifyOutcome { decision, candidates })
}

/// spec.md §4.4 FALLBACK_NEXT: retryable statuses `{400,401,402,403,429,500,
/// 502,503,504}`, and for 4xx ones only when the body matches a known
/// transient-error-class pattern (plain validation 400s are not retried).
const RETRYABLE_STATUSES: [u16; 9] = [400, 401, 402, 403, 429, 500, 502, 503, 504];

static ERROR_CLASS_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bbilling\b",
        r"(?i)\bquota\b",
        r"(?i)rate.?limit",
        r"(?i)\bcapacity\b",
        r"(?i)invalid.{0,20}api.?key",
        r"(?i)\bunauthorized\b",
        r"(?i)model.{0,20}(not found|unavailable|does not exist)",
        r"(?i)\boverloaded\b",
    ])
    .expect("error-class patterns must compile")
});

/// Decide whether an upstream `(status, body)` pair is eligible for
/// FALLBACK_NEXT — spec.md §4.4.
pub fn classify_upstream_error(status: u16, body: &str) -> bool {
    if !RETRYABLE_STATUSES.contains(&status) {
        return false;
    }
    status >= 500 || ERROR_CLASS_PATTERNS.is_match(body)
}

/// Pick the next fallback candidate: reachable, context-window-sufficient,
/// not-rate-limited preferred over least-recently-throttled — spec.md §4.4,
/// §4.7.
fn pick_fallback_candidate<'a>(
    registry: &'a ModelRegistry,
    candidates: &[String],
    keys: &ApiKeysConfig,
    gateway: &crate::config::routing::GatewayConfig,
    rate_limits: &RateLimitMap,
    estimated_input_tokens: u64,
    estimated_output_tokens: u64,
) -> Option<&'a Model> {
    let reachable: Vec<&Model> = candidates
        .iter()
        .filter_map(|id| registry.get(id))
        .filter(|m| keyresolver::is_resolvable(m, keys, gateway))
        .filter(|m| context_window_ok(m, estimated_input_tokens, estimated_output_tokens))
        .collect();

    let ids: Vec<&str> = reachable.iter().map(|m| m.id.as_str()).collect();
    let (not_limited, limited) = rate_limits.prioritize(&ids);
    let chosen_id = not_limited.first().copied().or_else(|| rate_limits.least_recently_throttled(&limited));
    chosen_id.and_then(|id| reachable.into_iter().find(|m| m.id == id))
}

/// Resolve the model name to send upstream. Gateway-routed requests use the
/// aggregator's own catalog id (C10, spec.md §4.9) when one is mapped;
/// direct requests (and unmapped gateway models) fall back to the
/// provider-native name.
fn dispatch_model_name(catalog: &GatewayCatalog, model: &Model, access: &ResolvedAccess) -> String {
    if access.via_gateway {
        catalog.snapshot().get(&model.id).cloned().unwrap_or_else(|| model.native_name().to_string())
    } else {
        model.native_name().to_string()
    }
}

fn upstream_url(access: &ResolvedAccess, dialect: Dialect, model_name: &str, stream: bool) -> String {
    let base = access.base_url.trim_end_matches('/');
    match dialect {
        Dialect::A => format!("{base}/v1/chat/completions"),
        Dialect::B => format!("{base}/v1/messages"),
        Dialect::C => {
            let method = if stream { "streamGenerateContent" } else { "generateContent" };
            format!("{base}/v1beta/models/{model_name}:{method}")
        }
    }
}

/// DISPATCH (non-streaming branch): translate, send, translate the response
/// back to dialect A.
async fn dispatch_non_stream(
    http: &Client,
    access: &ResolvedAccess,
    model_name: &str,
    body: &Value,
    dialect: Dialect,
) -> Result<Value, ProxyError> {
    let translated = dialect::translate_request(body, dialect, model_name).map_err(ProxyError::Internal)?;
    let url = upstream_url(access, dialect, model_name, false);
    let mut req = http.post(&url).json(&translated.body).timeout(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS));
    for (name, value) in keyresolver::auth_headers(access) {
        req = req.header(name, value);
    }

    let response = req.send().await.map_err(to_proxy_error)?;
    let status = response.status();
    let text = response.text().await.map_err(to_proxy_error)?;

    if !status.is_success() {
        return Err(ProxyError::Upstream { status: status.as_u16(), body: text });
    }
    let upstream_json: Value = serde_json::from_str(&text).map_err(|e| ProxyError::BadUpstream(e.to_string()))?;
    dialect::translate_response(&upstream_json, dialect).map_err(|e| ProxyError::BadUpstream(e.to_string()))
}

fn to_proxy_error(e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::UpstreamTimeout
    } else {
        ProxyError::Internal(e.into())
    }
}

/// DISPATCH (streaming branch): opens the upstream connection, then hands
/// off to a background task that races a 2s heartbeat ticker against the
/// upstream byte stream (spec.md §5): the first heartbeat fires as soon as
/// the task starts, later ones only while no upstream byte has arrived yet.
async fn dispatch_stream(
    http: &Client,
    access: &ResolvedAccess,
    model: &Model,
    model_name: &str,
    body: &Value,
    dialect: Dialect,
) -> Result<SseStream, ProxyError> {
    let translated = dialect::translate_request(body, dialect, model_name).map_err(ProxyError::Internal)?;
    let url = upstream_url(access, dialect, model_name, translated.stream);
    let mut req = http.post(&url).json(&translated.body).timeout(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS));
    for (name, value) in keyresolver::auth_headers(access) {
        req = req.header(name, value);
    }

    let response = req.send().await.map_err(to_proxy_error)?;
    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(ProxyError::Upstream { status: status.as_u16(), body: body_text });
    }

    let (tx, rx) = mpsc::channel::<anyhow::Result<Bytes>>(32);
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let model_id = model.id.clone();

    tokio::spawn(async move {
        let mut upstream = response.bytes_stream();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut buffer = FrameBuffer::new();
        let mut translator = StreamTranslator::for_dialect(dialect, id, model_id);
        let mut first_byte_seen = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick(), if !first_byte_seen => {
                    if tx.send(Ok(Bytes::from_static(b": heartbeat\n\n"))).await.is_err() {
                        return;
                    }
                }
                chunk = upstream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            first_byte_seen = true;
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if forward_stream_chunk(&tx, &mut buffer, &mut translator, dialect, &text).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            // Headers are already flushed at this point, so the
                            // only orderly way to end the response is an error
                            // frame followed by [DONE] (spec.md §4.4, §7) —
                            // never a raw stream abort.
                            let frame = format!("data: {{\"error\":{{\"code\":\"upstream_error\",\"message\":{}}}}}\n\n", json!(e.to_string()));
                            let _ = tx.send(Ok(Bytes::from(frame))).await;
                            let _ = tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await;
                            return;
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = tx.send(Ok(Bytes::from_static(b"data: [DONE]\n\n"))).await;
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
    Ok(Box::pin(stream))
}

/// The per-stream translator state, dispatched on the resolved upstream
/// dialect — dialect A needs no stateful translator (it's a frame-by-frame
/// passthrough), dialects B and C each accumulate role-sent state across
/// the life of one stream.
enum StreamTranslator {
    A,
    B(BToATranslator),
    C(CToATranslator),
}

impl StreamTranslator {
    fn for_dialect(dialect: Dialect, id: String, model: String) -> Self {
        match dialect {
            Dialect::A => StreamTranslator::A,
            Dialect::B => StreamTranslator::B(BToATranslator::new(id, model)),
            Dialect::C => StreamTranslator::C(CToATranslator::new(id, model)),
        }
    }
}

/// Translate and forward one already-decoded chunk of upstream bytes to the
/// client channel. Returns `Err` once the receiver has gone away so the
/// caller can stop the background task (client disconnect cancellation).
async fn forward_stream_chunk(
    tx: &mpsc::Sender<anyhow::Result<Bytes>>,
    buffer: &mut FrameBuffer,
    translator: &mut StreamTranslator,
    dialect: Dialect,
    text: &str,
) -> Result<(), ()> {
    for fields in buffer.push(text) {
        match dialect {
            Dialect::A => {
                if let Some(cleaned) = passthrough_a_frame(fields) {
                    let rendered = render_frame(&cleaned);
                    if tx.send(Ok(Bytes::from(rendered))).await.is_err() {
                        return Err(());
                    }
                }
            }
            Dialect::C => {
                let StreamTranslator::C(translator) = translator else { unreachable!("dialect C always pairs with a C translator") };
                for field in &fields {
                    if let Field::Data(payload) = field {
                        if payload.trim() == "[DONE]" {
                            continue;
                        }
                        let Ok(parsed) = serde_json::from_str::<Value>(payload) else { continue };
                        for frame in translator.translate(&parsed) {
                            let rendered = format!("data: {frame}\n\n");
                            if tx.send(Ok(Bytes::from(rendered))).await.is_err() {
                                return Err(());
                            }
                        }
                    }
                }
            }
            Dialect::B => {
                let StreamTranslator::B(translator) = translator else { unreachable!("dialect B always pairs with a B translator") };
                for field in &fields {
                    if let Field::Data(payload) = field {
                        let Ok(parsed) = serde_json::from_str::<Value>(payload) else { continue };
                        for frame in translator.translate(&parsed) {
                            let rendered = format!("data: {frame}\n\n");
                            if tx.send(Ok(Bytes::from(rendered))).await.is_err() {
                                return Err(());
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

enum Dispatched {
    NonStream(Value),
    Stream(SseStream),
}

fn log_completion(state: &RouterState, decision: RoutingDecision, started_at: Instant, success: bool, error: Option<&str>) -> UsageEntry {
    let latency_ms = started_at.elapsed().as_millis() as u64;
    let mut entry = UsageEntry::new(decision, latency_ms, success);
    if let Some(err) = error {
        entry = entry.with_error(err);
    }
    state.traffic.push(entry.clone());
    if !success {
        warn!(latency_ms, error, "request failed after exhausting fallback chain");
    }
    entry
}

/// Any `/v1/*` path other than `/v1/chat/completions` and `/v1/models` —
/// spec.md §6: "passthrough after translation". These endpoints don't share
/// the chat-completion message shape dialect adapters translate, so the
/// only translation that applies uniformly is rewriting the outbound
/// `model` field to the resolved dialect-native (or gateway-catalog) id;
/// the body is otherwise forwarded verbatim and the upstream response is
/// relayed unchanged.
pub async fn passthrough_request(
    state: &RouterState,
    method: reqwest::Method,
    path_and_query: &str,
    body: Bytes,
) -> Result<(u16, Option<String>, Bytes), ProxyError> {
    let routing = state.routing();
    let keys = state.keys();

    let mut body_json: Option<Value> = serde_json::from_slice(&body).ok();
    let requested_model = body_json.as_ref().and_then(|b| b["model"].as_str()).map(str::to_string);

    let access = match requested_model.as_deref().and_then(|id| routing.registry.get(id)) {
        Some(model) => {
            let access = keyresolver::resolve(model, &keys, &routing.gateway).ok_or(ProxyError::NoProviderConfigured)?;
            let model_name = dispatch_model_name(&state.catalog, model, &access);
            if let Some(Value::Object(map)) = body_json.as_mut() {
                map.insert("model".to_string(), json!(model_name));
            }
            access
        }
        None => {
            let base_url = routing.gateway.base_url.clone().ok_or(ProxyError::NoProviderConfigured)?;
            let api_key = routing.gateway.api_key().ok_or(ProxyError::NoProviderConfigured)?;
            ResolvedAccess {
                api_key,
                base_url,
                provider: crate::registry::ProviderPrefix::OpenAI,
                via_gateway: true,
                client_id_header: routing.gateway.client_id_header.clone(),
            }
        }
    };

    let url = format!("{}{}", access.base_url.trim_end_matches('/'), path_and_query);
    let outbound_body = match &body_json {
        Some(v) => serde_json::to_vec(v).unwrap_or_else(|_| body.to_vec()),
        None => body.to_vec(),
    };

    let mut req = state
        .http
        .request(method, &url)
        .timeout(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
        .body(outbound_body);
    for (name, value) in keyresolver::auth_headers(&access) {
        req = req.header(name, value);
    }

    let response = req.send().await.map_err(to_proxy_error)?;
    let status = response.status().as_u16();
    let content_type = response.headers().get(reqwest::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
    let bytes = response.bytes().await.map_err(to_proxy_error)?;
    Ok((status, content_type, bytes))
}

/// The full RECEIVE → CLASSIFY → RESOLVE_KEY → DEDUP_CHECK → DISPATCH →
/// STREAM → COMPLETE state machine, with FALLBACK_NEXT looping back into
/// DISPATCH on a retryable failure (spec.md §4.4).
pub async fn route_chat_completions(state: &RouterState, body: Value, headers: &HeaderMap) -> Result<RouteOutcome, ProxyError> {
    let started_at = Instant::now();
    let outcome = classify(state, &body, headers)?;
    let routing = state.routing();
    let keys = state.keys();
    let stream_requested = body["stream"].as_bool().unwrap_or(false);

    let mut decision = outcome.decision;
    let mut candidates = outcome.candidates;
    if candidates.is_empty() {
        return Err(ProxyError::NoProviderConfigured);
    }
    let mut model_id = candidates.remove(0);

    let mut attempts = 0usize;
    loop {
        attempts += 1;
        let model = routing.registry.get(&model_id).ok_or(ProxyError::NoProviderConfigured)?.clone();
        let access = keyresolver::resolve(&model, &keys, &routing.gateway).ok_or(ProxyError::NoProviderConfigured)?;
        let dialect = model.provider.native_dialect();
        let model_name = dispatch_model_name(&state.catalog, &model, &access);

        let translated = dialect::translate_request(&body, dialect, &model_name).map_err(ProxyError::Internal)?;
        let canonical_bytes = serde_json::to_vec(&translated.body).unwrap_or_default();
        let dedup_key = DedupStore::hash_body(&canonical_bytes);

        // Loops at most once more: an inflight holder that abandons (client
        // disconnect) removes its slot entirely, so a waiter that wakes up
        // empty-handed must re-enter to become the new dispatcher itself
        // rather than assume someone else still holds it.
        let guard = loop {
            match state.dedup.lookup_or_mark_inflight(&dedup_key) {
                DedupLookup::Completed(resp) => {
                    let json_body: Value = serde_json::from_slice(&resp.body).unwrap_or_else(|_| json!({}));
                    decision = decision.with_note("dedup replay");
                    let entry = log_completion(state, decision, started_at, true, None);
                    return Ok(RouteOutcome::NonStream { body: json_body, entry });
                }
                DedupLookup::Inflight(mut rx) => {
                    if rx.changed().await.is_ok() {
                        if let Some(resp) = rx.borrow().clone() {
                            let json_body: Value = serde_json::from_slice(&resp.body).unwrap_or_else(|_| json!({}));
                            decision = decision.with_note("dedup replay");
                            let entry = log_completion(state, decision, started_at, true, None);
                            return Ok(RouteOutcome::NonStream { body: json_body, entry });
                        }
                    }
                    // Sender abandoned without completing; retry the lookup.
                }
                DedupLookup::Miss(guard) => break guard,
            }
        };

        let dispatch_result = if stream_requested {
            dispatch_stream(&state.http, &access, &model, &model_name, &body, dialect).await.map(Dispatched::Stream)
        } else {
            dispatch_non_stream(&state.http, &access, &model_name, &body, dialect).await.map(Dispatched::NonStream)
        };

        match dispatch_result {
            Ok(Dispatched::NonStream(resp_body)) => {
                let bytes = serde_json::to_vec(&resp_body).unwrap_or_default();
                state.dedup.complete(guard, CompletedResponse { status: 200, headers: vec![], body: bytes });
                let entry = log_completion(state, decision, started_at, true, None);
                return Ok(RouteOutcome::NonStream { body: resp_body, entry });
            }
            Ok(Dispatched::Stream(stream)) => {
                // Streamed bodies are not byte-cached for replay in this
                // pass; the inflight slot is released so a concurrent
                // duplicate dispatches its own request instead of hanging.
                state.dedup.abandon(guard);
                let entry = log_completion(state, decision, started_at, true, None);
                return Ok(RouteOutcome::Stream { stream, entry });
            }
            Err(ProxyError::Upstream { status, body: err_body })
                if classify_upstream_error(status, &err_body) && attempts < MAX_FALLBACK_ATTEMPTS =>
            {
                state.dedup.abandon(guard);
                if status == 429 {
                    state.rate_limits.mark_rate_limited(&model.id);
                }
                let (est_in, est_out) = estimate_request_tokens(&body, classifier::estimate_tokens(&extract_prompts(&body).0));
                match pick_fallback_candidate(&routing.registry, &candidates, &keys, &routing.gateway, &state.rate_limits, est_in, est_out) {
                    Some(next) => {
                        decision = decision.with_note(format!("fallback {} -> {} ({status})", model.id, next.id));
                        candidates.retain(|id| id != &next.id);
                        model_id = next.id.clone();
                        continue;
                    }
                    None => {
                        log_completion(state, decision, started_at, false, Some(&err_body));
                        return Err(ProxyError::Upstream { status, body: err_body });
                    }
                }
            }
            Err(e) => {
                state.dedup.abandon(guard);
                let message = e.to_string();
                log_completion(state, decision, started_at, false, Some(&message));
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys::ProviderKey;
    use crate::registry::{ProviderPrefix, TierConfig};
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn model(id: &str, provider: ProviderPrefix, ctx: u32) -> Model {
        Model { id: id.into(), provider, context_window: ctx, input_price: 1.0, output_price: 2.0, agentic: false }
    }

    fn registry_with(models: Vec<Model>, tiers: Vec<(Tier, TierConfig)>) -> ModelRegistry {
        let mut m = HashMap::new();
        for model in models {
            m.insert(model.id.clone(), model);
        }
        ModelRegistry { models: m, tiers: tiers.into_iter().collect(), agentic_tiers: HashMap::new(), aliases: HashMap::new() }
    }

    fn routing_config(registry: ModelRegistry) -> RoutingConfig {
        RoutingConfig {
            gateway: crate::config::routing::GatewayConfig::default(),
            registry,
            scoring: Default::default(),
            stores: Default::default(),
        }
    }

    fn keys_with(provider: &str, key: &str, base_url: &str) -> ApiKeysConfig {
        let mut providers = HashMap::new();
        providers.insert(provider.to_string(), ProviderKey { api_key: key.into(), base_url: Some(base_url.into()) });
        ApiKeysConfig { providers }
    }

    fn test_state(routing: RoutingConfig, keys: ApiKeysConfig) -> RouterState {
        RouterState::new(
            Arc::new(routing),
            PathBuf::from("routing.toml"),
            Arc::new(keys),
            PathBuf::from("keys.json"),
            Arc::new(GatewayCatalog::new(Client::new(), "https://unused.example")),
            Arc::new(TrafficLog::new(100)),
            Client::new(),
        )
    }

    #[test]
    fn is_auto_route_matches_bare_and_prefixed_auto() {
        assert!(is_auto_route("auto"));
        assert!(is_auto_route("gateway/auto"));
        assert!(!is_auto_route("openai/gpt-5-mini"));
    }

    #[test]
    fn is_agentic_requires_tools_and_a_prior_tool_call() {
        let no_tools = json!({"messages": []});
        assert!(!is_agentic(&no_tools));

        let tools_no_history = json!({"tools": [{"type": "function"}], "messages": []});
        assert!(!is_agentic(&tools_no_history));

        let agentic = json!({
            "tools": [{"type": "function"}],
            "messages": [{"role": "assistant", "tool_calls": [{"id": "1"}]}],
        });
        assert!(is_agentic(&agentic));
    }

    #[test]
    fn classify_upstream_error_retries_5xx_unconditionally() {
        assert!(classify_upstream_error(500, "anything"));
        assert!(classify_upstream_error(503, ""));
    }

    #[test]
    fn classify_upstream_error_requires_pattern_match_for_4xx() {
        assert!(!classify_upstream_error(400, "missing required field `messages`"));
        assert!(classify_upstream_error(429, "rate limit exceeded, please retry"));
        assert!(classify_upstream_error(401, "invalid API key"));
    }

    #[test]
    fn classify_upstream_error_rejects_non_retryable_status() {
        assert!(!classify_upstream_error(404, "quota exceeded"));
    }

    #[test]
    fn pick_fallback_candidate_skips_context_window_too_small() {
        let registry = registry_with(
            vec![model("p/small-ctx", ProviderPrefix::OpenAI, 100), model("p/big-ctx", ProviderPrefix::OpenAI, 1_000_000)],
            vec![],
        );
        let keys = keys_with("openai", "k", "https://api.example");
        let gw = crate::config::routing::GatewayConfig::default();
        let rl = RateLimitMap::new(Duration::from_secs(60));
        let chosen = pick_fallback_candidate(
            &registry,
            &["p/small-ctx".into(), "p/big-ctx".into()],
            &keys,
            &gw,
            &rl,
            50_000,
            1_000,
        );
        assert_eq!(chosen.unwrap().id, "p/big-ctx");
    }

    #[test]
    fn pick_fallback_candidate_prefers_not_rate_limited() {
        let registry = registry_with(
            vec![model("p/a", ProviderPrefix::OpenAI, 1_000_000), model("p/b", ProviderPrefix::OpenAI, 1_000_000)],
            vec![],
        );
        let keys = keys_with("openai", "k", "https://api.example");
        let gw = crate::config::routing::GatewayConfig::default();
        let rl = RateLimitMap::new(Duration::from_secs(60));
        rl.mark_rate_limited("p/a");
        let chosen = pick_fallback_candidate(&registry, &["p/a".into(), "p/b".into()], &keys, &gw, &rl, 10, 10);
        assert_eq!(chosen.unwrap().id, "p/b");
    }

    #[tokio::test]
    async fn non_stream_dispatch_routes_and_translates_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hi there"}}]
            })))
            .mount(&server)
            .await;

        let registry = registry_with(
            vec![model("openai/gpt-5-mini", ProviderPrefix::OpenAI, 128_000)],
            vec![(Tier::Simple, TierConfig { primary: "openai/gpt-5-mini".into(), fallback: vec![] })],
        );
        let routing = routing_config(registry);
        let keys = keys_with("openai", "sk-test", &server.uri());
        let state = test_state(routing, keys);

        let body = json!({"model": "auto", "messages": [{"role": "user", "content": "Hi!"}]});
        let outcome = route_chat_completions(&state, body, &HeaderMap::new()).await.unwrap();
        match outcome {
            RouteOutcome::NonStream { body, entry } => {
                assert_eq!(body["choices"][0]["message"]["content"], "hi there");
                assert!(entry.success);
            }
            RouteOutcome::Stream { .. } => panic!("expected non-stream outcome"),
        }
    }

    #[tokio::test]
    async fn explicit_model_with_no_fallback_chain_surfaces_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("service overloaded"))
            .mount(&server)
            .await;

        let registry = registry_with(vec![model("openai/only", ProviderPrefix::OpenAI, 128_000)], vec![]);
        let routing = routing_config(registry);
        let keys = keys_with("openai", "sk-test", &server.uri());
        let state = test_state(routing, keys);

        let body = json!({"model": "openai/only", "messages": [{"role": "user", "content": "hi"}]});
        let result = route_chat_completions(&state, body, &HeaderMap::new()).await;
        assert!(matches!(result, Err(ProxyError::Upstream { status: 503, .. })));
    }

    #[tokio::test]
    async fn retryable_failure_falls_back_to_next_candidate_in_auto_chain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("capacity exhausted"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "from fallback"}}]
            })))
            .mount(&server)
            .await;

        let registry = registry_with(
            vec![model("openai/primary", ProviderPrefix::OpenAI, 128_000), model("openai/fallback", ProviderPrefix::OpenAI, 128_000)],
            vec![(Tier::Simple, TierConfig { primary: "openai/primary".into(), fallback: vec!["openai/fallback".into()] })],
        );
        let routing = routing_config(registry);
        let keys = keys_with("openai", "sk-test", &server.uri());
        let state = test_state(routing, keys);

        let body = json!({"model": "auto", "messages": [{"role": "user", "content": "hi"}]});
        let outcome = route_chat_completions(&state, body, &HeaderMap::new()).await.unwrap();
        let RouteOutcome::NonStream { body, entry } = outcome else { panic!("expected non-stream") };
        assert_eq!(body["choices"][0]["message"]["content"], "from fallback");
        assert!(entry.decision.notes.iter().any(|n| n.contains("fallback")));
    }

    #[tokio::test]
    async fn duplicate_inflight_request_gets_coalesced_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"choices": [{"message": {"role": "assistant", "content": "first"}}]}))
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let registry = registry_with(
            vec![model("openai/gpt-5-mini", ProviderPrefix::OpenAI, 128_000)],
            vec![(Tier::Simple, TierConfig { primary: "openai/gpt-5-mini".into(), fallback: vec![] })],
        );
        let routing = routing_config(registry);
        let keys = keys_with("openai", "sk-test", &server.uri());
        let state = Arc::new(test_state(routing, keys));

        let body = json!({"model": "auto", "messages": [{"role": "user", "content": "same request"}]});
        let s1 = state.clone();
        let b1 = body.clone();
        let h1 = tokio::spawn(async move { route_chat_completions(&s1, b1, &HeaderMap::new()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let s2 = state.clone();
        let b2 = body.clone();
        let h2 = tokio::spawn(async move { route_chat_completions(&s2, b2, &HeaderMap::new()).await });

        let (r1, r2) = tokio::join!(h1, h2);
        let r1 = r1.unwrap().unwrap();
        let r2 = r2.unwrap().unwrap();
        let RouteOutcome::NonStream { body: b1, .. } = r1 else { panic!("expected non-stream") };
        let RouteOutcome::NonStream { body: b2, .. } = r2 else { panic!("expected non-stream") };
        assert_eq!(b1["choices"][0]["message"]["content"], b2["choices"][0]["message"]["content"]);
    }

    #[tokio::test]
    async fn gateway_routed_dispatch_uses_catalog_mapped_model_name() {
        std::env::set_var("TEST_ROUTER_GW_KEY", "gwkey");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gateway/claude-opus-v2"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "hi"}],
                "role": "assistant",
                "stop_reason": "end_turn",
            })))
            .mount(&server)
            .await;

        let registry = registry_with(
            vec![model("anthropic/claude-opus", ProviderPrefix::Anthropic, 200_000)],
            vec![(Tier::Complex, TierConfig { primary: "anthropic/claude-opus".into(), fallback: vec![] })],
        );
        let mut routing = routing_config(registry);
        routing.gateway.api_key_env = Some("TEST_ROUTER_GW_KEY".into());
        routing.gateway.base_url = Some(server.uri());
        let keys = ApiKeysConfig { providers: HashMap::new() };

        let catalog = GatewayCatalog::new(Client::new(), &server.uri());
        catalog.refresh(&["anthropic/claude-opus".to_string()]).await.unwrap();

        let state = RouterState::new(
            Arc::new(routing),
            PathBuf::from("routing.toml"),
            Arc::new(keys),
            PathBuf::from("keys.json"),
            Arc::new(catalog),
            Arc::new(TrafficLog::new(100)),
            Client::new(),
        );

        let body = json!({"model": "anthropic/claude-opus", "messages": [{"role": "user", "content": "hi"}]});
        let outcome = route_chat_completions(&state, body, &HeaderMap::new()).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::NonStream { .. }));

        let requests = server.received_requests().await.unwrap();
        let post_request = requests.iter().find(|r| r.method.to_string() == "POST").expect("POST request");
        let sent: Value = serde_json::from_slice(&post_request.body).unwrap();
        assert_eq!(sent["model"], "gateway/claude-opus-v2");
    }
}
