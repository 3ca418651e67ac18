//! Prometheus-compatible `/metrics` endpoint (admin port).
//!
//! All metrics are derived from the in-memory ring-buffer window kept by
//! [`crate::traffic::TrafficLog`]. Because the buffer has a fixed capacity,
//! values represent a **sliding window** of recent requests rather than
//! lifetime counters — `TYPE gauge` throughout, since values can decrease as
//! old entries rotate out.
//!
//! Metric families:
//! - `router_window_size`        — entries currently in the ring buffer
//! - `router_requests`           — per-tier/model/outcome request counts
//! - `router_latency_ms_sum`     — sum of latencies per tier/model (for avg)
//! - `router_latency_ms_count`   — denominator matching the sum above
//! - `router_escalations_total`  — requests rerouted/fell back at least once
//! - `router_errors_total`       — requests that returned an error
//! - `router_savings_ratio_sum`  — sum of per-request cost savings ratios

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::router::RouterState;

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let entries = state.traffic.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut escalations: u64 = 0;
    let mut errors: u64 = 0;
    let mut savings_sum: f64 = 0.0;

    // (tier, model, success) -> count
    let mut request_counts: HashMap<(String, String, bool), u64> = HashMap::new();
    // (tier, model) -> (latency_sum_ms, count)
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        if e.escalated { escalations += 1; }
        if !e.success { errors += 1; }
        savings_sum += e.decision.savings;

        *request_counts.entry((e.decision.tier.clone(), e.decision.model.clone(), e.success)).or_default() += 1;

        let lat = latency.entry((e.decision.tier.clone(), e.decision.model.clone())).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP router_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE router_window_size gauge\n");
    out.push_str(&format!("router_window_size {window_size}\n\n"));

    out.push_str("# HELP router_requests Request count in the current window, labelled by tier, model, and outcome.\n");
    out.push_str("# TYPE router_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, model, success), count) in req_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "router_requests{{tier=\"{tier}\",model=\"{model}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    out.push_str("# HELP router_latency_ms_sum Sum of request latency (ms) in the current window, grouped by tier and model.\n");
    out.push_str("# TYPE router_latency_ms_sum gauge\n");
    out.push_str("# HELP router_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE router_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((tier, model), (sum, count)) in lat_rows {
        out.push_str(&format!("router_latency_ms_sum{{tier=\"{tier}\",model=\"{model}\"}} {sum}\n"));
        out.push_str(&format!("router_latency_ms_count{{tier=\"{tier}\",model=\"{model}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP router_escalations_total Requests rerouted or retried onto a fallback model in the current window.\n");
    out.push_str("# TYPE router_escalations_total gauge\n");
    out.push_str(&format!("router_escalations_total {escalations}\n\n"));

    out.push_str("# HELP router_errors_total Requests that returned an error in the current window.\n");
    out.push_str("# TYPE router_errors_total gauge\n");
    out.push_str(&format!("router_errors_total {errors}\n\n"));

    out.push_str("# HELP router_savings_ratio_sum Sum of per-request cost savings ratios (cost vs. tier baseline) in the current window.\n");
    out.push_str("# TYPE router_savings_ratio_sum gauge\n");
    out.push_str(&format!("router_savings_ratio_sum {savings_sum}\n"));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
}
