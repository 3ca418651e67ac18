use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

mod api;
mod classifier;
mod config;
mod dedup;
mod dialect;
mod error;
mod gateway_catalog;
mod keyresolver;
mod ratelimit;
mod registry;
mod router;
mod selector;
mod session;
mod traffic;

use config::{ApiKeysConfig, RoutingConfig};
use gateway_catalog::GatewayCatalog;
use router::RouterState;
use traffic::TrafficLog;

/// How long a listener retries `EADDRINUSE` before giving up — spec.md §5
/// "Listen bind": probe the existing listener's `/health` first; if it
/// isn't ours, retry up to 5 times at 1-second intervals.
const BIND_RETRY_ATTEMPTS: u32 = 5;
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period `close()` gives in-flight connections before the process
/// exits anyway — spec.md §5 "Resource bounds".
const SHUTDOWN_GRACE: Duration = Duration::from_secs(4);

/// Idle timeout applied to every connection on both listeners — spec.md §5
/// "Resource bounds": "each server connection carries a 5-minute idle
/// timeout." `tower_http`'s `TimeoutLayer` is a per-request timeout, the
/// closest primitive axum's `serve` exposes without reaching into hyper
/// directly; documented as an approximation, not a literal idle-socket timer.
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match std::env::args().nth(1).as_deref() {
        Some("--healthcheck") => return healthcheck().await,
        Some("--version") | Some("-v") => {
            println!("model-router {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | Some("-h") => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    let port_override = parse_port_override(std::env::args().collect::<Vec<_>>());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_router=info,tower_http=warn".into()),
        )
        .init();

    if let Err(err) = run(port_override).await {
        tracing::error!(error = %err, "fatal error during startup");
        std::process::exit(1);
    }
    Ok(())
}

fn print_help() {
    println!(
        "model-router — local reverse-proxy that routes chat-completions requests\n\n\
         USAGE:\n    model-router [--port <n>]\n\n\
         OPTIONS:\n    \
         --port <n>       Override the client-API listen port\n    \
         --version, -v    Print the version and exit\n    \
         --help, -h       Print this help and exit\n    \
         --healthcheck    Probe the local /healthz endpoint and exit 0/1 (Docker HEALTHCHECK)\n"
    );
}

fn parse_port_override(args: Vec<String>) -> Option<u16> {
    let idx = args.iter().position(|a| a == "--port")?;
    args.get(idx + 1)?.parse().ok()
}

async fn run(port_override: Option<u16>) -> anyhow::Result<()> {
    let routing_path = std::env::var("MODEL_ROUTER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/model-router/routing.toml"));
    let keys_path = std::env::var("MODEL_ROUTER_KEYS")
        .map(PathBuf::from)
        .or_else(|_| ApiKeysConfig::default_path().context("HOME not set; cannot locate default keys path"))
        .unwrap_or_else(|_| PathBuf::from("config.json"));

    let mut routing = RoutingConfig::load(&routing_path)
        .with_context(|| format!("loading routing config from {}", routing_path.display()))?;
    if let Some(port) = port_override {
        routing.gateway.client_port = port;
    }
    let keys = ApiKeysConfig::load(&keys_path)
        .with_context(|| format!("loading API keys from {}", keys_path.display()))?;

    if keys.providers.is_empty() && routing.gateway.api_key().is_none() {
        anyhow::bail!(
            "no API keys configured: set up {} or a gateway.api_key_env value in {}",
            keys_path.display(),
            routing_path.display()
        );
    }

    info!(
        client_port = routing.gateway.client_port,
        admin_port = routing.gateway.admin_port,
        models = routing.registry.models.len(),
        "model-router starting"
    );

    let traffic_log = Arc::new(TrafficLog::new(routing.gateway.traffic_log_capacity));
    let http = reqwest::Client::builder().build().context("building HTTP client")?;

    let catalog = Arc::new(GatewayCatalog::new(
        http.clone(),
        routing.gateway.base_url.as_deref().unwrap_or_default(),
    ));
    if routing.gateway.base_url.is_some() {
        let local_ids: Vec<String> = routing.registry.models.keys().cloned().collect();
        catalog.clone().spawn_refresher(local_ids, Duration::from_secs(routing.gateway.catalog_cache_ttl_secs));
    }

    let routing = Arc::new(routing);
    let keys = Arc::new(keys);

    let state = Arc::new(RouterState::new(
        Arc::clone(&routing),
        routing_path.clone(),
        Arc::clone(&keys),
        keys_path.clone(),
        catalog,
        Arc::clone(&traffic_log),
        http,
    ));

    tokio::spawn(config_watcher(Arc::clone(&state)));

    let client_addr: SocketAddr = format!("0.0.0.0:{}", routing.gateway.client_port).parse()?;
    let admin_addr: SocketAddr = format!("0.0.0.0:{}", routing.gateway.admin_port).parse()?;

    let client_listener = match bind_with_probe(client_addr).await? {
        Some(l) => l,
        None => {
            info!(%client_addr, "client API already running, exiting");
            return Ok(());
        }
    };
    let admin_listener = match bind_with_probe(admin_addr).await? {
        Some(l) => l,
        None => {
            info!(%admin_addr, "admin API already running, exiting");
            return Ok(());
        }
    };

    info!(%client_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), api::rate_limit::rate_limit_middleware))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer())
        .layer(tower_http::timeout::TimeoutLayer::new(CONNECTION_IDLE_TIMEOUT));
    let admin_app = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), api::admin_auth::admin_auth_middleware))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer())
        .layer(tower_http::timeout::TimeoutLayer::new(CONNECTION_IDLE_TIMEOUT));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let client_rx = shutdown_tx.subscribe();
    let admin_rx = shutdown_tx.subscribe();

    let client_server = tokio::spawn(async move {
        axum::serve(client_listener, client_app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(wait_for_shutdown(client_rx))
            .await
    });
    let admin_server = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(wait_for_shutdown(admin_rx))
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = client_server.await;
        let _ = admin_server.await;
    })
    .await
    .is_err()
    {
        warn!("graceful shutdown grace period elapsed, exiting anyway");
    }

    Ok(())
}

async fn wait_for_shutdown(mut rx: tokio::sync::broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}

/// Bind `addr`, retrying through an existing `/health`-reporting listener on
/// `EADDRINUSE` (spec.md §5 "Listen bind"). Returns `None` when another
/// already-healthy instance owns the port — the caller should treat this as
/// a no-op and exit cleanly rather than binding twice.
async fn bind_with_probe(addr: SocketAddr) -> anyhow::Result<Option<TcpListener>> {
    for attempt in 1..=BIND_RETRY_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(Some(listener)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if probe_existing(addr).await {
                    return Ok(None);
                }
                warn!(%addr, attempt, "address in use, retrying");
                tokio::time::sleep(BIND_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e).with_context(|| format!("binding {addr}")),
        }
    }
    anyhow::bail!("failed to bind {addr} after {BIND_RETRY_ATTEMPTS} attempts: address still in use")
}

async fn probe_existing(addr: SocketAddr) -> bool {
    let url = format!("http://127.0.0.1:{}/health", addr.port());
    let Ok(resp) = reqwest::get(&url).await else { return false };
    if !resp.status().is_success() {
        return false;
    }
    matches!(resp.json::<serde_json::Value>().await, Ok(body) if body["status"] == "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `model-router --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("MODEL_ROUTER_CLIENT_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls both config files every 5 seconds and hot-reloads
/// on change, independently — matches the teacher's mtime-polling
/// `config_watcher`, generalized to two independently reloadable sources.
async fn config_watcher(state: Arc<RouterState>) {
    let routing_path = state.routing_path.clone();
    let keys_path = state.keys_path.clone();

    let mut last_routing_mtime = std::fs::metadata(&routing_path).and_then(|m| m.modified()).ok();
    let mut last_keys_mtime = std::fs::metadata(&keys_path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await; // first tick fires immediately; skip to avoid reloading at startup

    loop {
        interval.tick().await;

        let routing_mtime = std::fs::metadata(&routing_path).and_then(|m| m.modified()).ok();
        if routing_mtime != last_routing_mtime {
            match RoutingConfig::load(&routing_path) {
                Ok(new_cfg) => {
                    state.replace_routing(Arc::new(new_cfg));
                    info!(path = %routing_path.display(), "routing config hot-reloaded");
                    last_routing_mtime = routing_mtime;
                }
                Err(e) => warn!(path = %routing_path.display(), error = %e, "routing config reload failed, keeping previous config"),
            }
        }

        let keys_mtime = std::fs::metadata(&keys_path).and_then(|m| m.modified()).ok();
        if keys_mtime != last_keys_mtime {
            match ApiKeysConfig::load(&keys_path) {
                Ok(new_keys) => {
                    state.replace_keys(Arc::new(new_keys));
                    info!(path = %keys_path.display(), "API keys hot-reloaded");
                    last_keys_mtime = keys_mtime;
                }
                Err(e) => warn!(path = %keys_path.display(), error = %e, "API keys reload failed, keeping previous keys"),
            }
        }
    }
}
