//! `GET /stats?days=N` (port 8080) — aggregated usage JSON backed by the
//! in-process [`crate::traffic::TrafficLog`] ring buffer (spec.md §6).
//! Unlike the distilled spec's "external stats collaborator" framing, this
//! crate has no such service to delegate to — the proxy owns the ring
//! buffer directly, matching the teacher's own in-process `/admin/traffic`.

use std::sync::Arc;

use axum::{extract::{Query, State}, response::IntoResponse, Json};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::router::RouterState;
use crate::traffic::TrafficLog;

#[derive(Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_days")]
    days: i64,
}
fn default_days() -> i64 {
    7
}

/// `GET /stats?days=N` — usage/cost summary over the last `days` days.
pub async fn stats(State(state): State<Arc<RouterState>>, Query(q): Query<StatsQuery>) -> impl IntoResponse {
    let since = Utc::now() - ChronoDuration::days(q.days.max(0));
    let entries = state.traffic.recent_since(since).await;
    let summary = TrafficLog::stats_for(&entries);

    Json(json!({
        "days": q.days,
        "stats": summary,
        "entries": entries,
    }))
}
