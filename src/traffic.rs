//! In-memory usage/cost log backing `/stats` (spec.md §3 `RoutingDecision`,
//! §6 `/stats?days=N`).
//!
//! [`TrafficLog`] keeps the teacher's fixed-capacity ring-buffer shape
//! (`src/traffic.rs`, pre-rewrite): once full, the oldest entry is evicted to
//! make room for the newest, giving a bounded, O(1) memory footprint
//! regardless of request volume. The entry shape itself is new — it carries
//! a `RoutingDecision` (tier, model, cost estimate, baseline, savings) rather
//! than the teacher's profile/backend-name record.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`UsageEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push]
/// uses a non-blocking `try_lock` so it never delays the request path; on
/// contention the entry is silently dropped (spec.md §7: "external
/// collaborators … may never block or fail a request").
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<UsageEntry>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Record a completed request. Best-effort, non-blocking.
    pub fn push(&self, entry: UsageEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<UsageEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Recent entries with `timestamp >= since`, newest first — backs
    /// `/stats?days=N`.
    pub async fn recent_since(&self, since: DateTime<Utc>) -> Vec<UsageEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().filter(|e| e.timestamp >= since).cloned().collect()
    }

    /// Compute aggregate statistics over the given entries.
    pub fn stats_for(entries: &[UsageEntry]) -> TrafficStats {
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let escalation_count = entries.iter().filter(|e| e.escalated).count();
        let total_cost: f64 = entries.iter().map(|e| e.decision.cost_estimate).sum();
        let total_baseline: f64 = entries.iter().map(|e| e.decision.baseline_cost).sum();
        let avg_savings = if total_baseline > 0.0 { (total_baseline - total_cost) / total_baseline } else { 0.0 };

        let mut tier_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries {
            *tier_counts.entry(entry.decision.tier.clone()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count,
            escalation_count,
            avg_latency_ms,
            total_cost,
            avg_savings,
            tier_counts,
        }
    }

    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let snapshot: Vec<UsageEntry> = entries.iter().cloned().collect();
        Self::stats_for(&snapshot)
    }
}

/// spec.md §3 `RoutingDecision`, produced per non-pinned request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub tier: String,
    pub model: String,
    /// Projected cost for this request at the chosen model's pricing.
    pub cost_estimate: f64,
    /// Cost of the most-expensive tier-appropriate model — the baseline
    /// against which savings are measured.
    pub baseline_cost: f64,
    /// `(baseline - cost) / baseline`, clamped to `[0, 1]`.
    pub savings: f64,
    pub reasoning: String,
    /// Appended on rerouting / fallback (spec.md §3).
    #[serde(default)]
    pub notes: Vec<String>,
}

impl RoutingDecision {
    /// Build a decision from cost figures, computing `savings` per spec.md
    /// §8 invariant 12 (`savings ∈ [0, 1]`, `costEstimate ≤ baselineCost`).
    pub fn new(tier: impl Into<String>, model: impl Into<String>, cost_estimate: f64, baseline_cost: f64, reasoning: impl Into<String>) -> Self {
        let baseline_cost = baseline_cost.max(cost_estimate);
        let savings = if baseline_cost > 0.0 {
            ((baseline_cost - cost_estimate) / baseline_cost).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self { tier: tier.into(), model: model.into(), cost_estimate, baseline_cost, savings, reasoning: reasoning.into(), notes: Vec::new() }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// One logged request: a [`RoutingDecision`] plus request-level outcome data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub decision: RoutingDecision,
    pub escalated: bool,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl UsageEntry {
    pub fn new(decision: RoutingDecision, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            request_id: None,
            escalated: !decision.notes.is_empty(),
            decision,
            latency_ms,
            success,
            error: None,
        }
    }

    pub fn with_request_id(mut self, id: &str) -> Self {
        self.request_id = Some(id.to_string());
        self
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_string());
        self.success = false;
        self
    }
}

#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub escalation_count: usize,
    pub avg_latency_ms: f64,
    pub total_cost: f64,
    pub avg_savings: f64,
    pub tier_counts: std::collections::HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(tier: &str, cost: f64, baseline: f64, latency_ms: u64) -> UsageEntry {
        let decision = RoutingDecision::new(tier, "m", cost, baseline, "test");
        UsageEntry::new(decision, latency_ms, true)
    }

    #[test]
    fn routing_decision_clamps_savings_into_unit_interval() {
        let d = RoutingDecision::new("simple", "m", 1.0, 2.0, "cheap");
        assert!((0.0..=1.0).contains(&d.savings));
        assert_eq!(d.savings, 0.5);
    }

    #[test]
    fn routing_decision_never_reports_cost_above_baseline() {
        // cost accidentally larger than baseline — baseline is raised to match.
        let d = RoutingDecision::new("simple", "m", 5.0, 2.0, "x");
        assert!(d.cost_estimate <= d.baseline_cost);
        assert_eq!(d.savings, 0.0);
    }

    #[test]
    fn routing_decision_zero_baseline_yields_zero_savings() {
        let d = RoutingDecision::new("simple", "m", 0.0, 0.0, "free");
        assert_eq!(d.savings, 0.0);
    }

    #[tokio::test]
    async fn push_and_retrieve_single_entry() {
        let log = TrafficLog::new(10);
        log.push(make_entry("simple", 0.01, 0.05, 42));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].decision.tier, "simple");
        assert_eq!(recent[0].latency_ms, 42);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = TrafficLog::new(10);
        log.push(make_entry("simple", 0.01, 0.02, 1));
        log.push(make_entry("medium", 0.02, 0.04, 2));
        log.push(make_entry("complex", 0.03, 0.06, 3));

        let recent = log.recent(10).await;
        assert_eq!(recent[0].decision.tier, "complex");
        assert_eq!(recent[2].decision.tier, "simple");
    }

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = TrafficLog::new(3);
        log.push(make_entry("oldest", 0.0, 0.0, 1));
        log.push(make_entry("middle", 0.0, 0.0, 2));
        log.push(make_entry("newest", 0.0, 0.0, 3));
        log.push(make_entry("extra", 0.0, 0.0, 4));

        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert!(!all.iter().any(|e| e.decision.tier == "oldest"));
        assert!(all.iter().any(|e| e.decision.tier == "extra"));
    }

    #[tokio::test]
    async fn stats_averages_latency_and_cost_correctly() {
        let log = TrafficLog::new(10);
        log.push(make_entry("simple", 0.10, 0.20, 100));
        log.push(make_entry("simple", 0.10, 0.20, 200));
        log.push(make_entry("medium", 0.20, 0.20, 300));

        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert!((stats.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert!((stats.total_cost - 0.40).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stats_counts_requests_per_tier() {
        let log = TrafficLog::new(10);
        log.push(make_entry("simple", 0.0, 0.0, 10));
        log.push(make_entry("simple", 0.0, 0.0, 20));
        log.push(make_entry("complex", 0.0, 0.0, 30));

        let stats = log.stats().await;
        assert_eq!(stats.tier_counts["simple"], 2);
        assert_eq!(stats.tier_counts["complex"], 1);
    }

    #[tokio::test]
    async fn recent_since_filters_by_timestamp() {
        let log = TrafficLog::new(10);
        log.push(make_entry("simple", 0.0, 0.0, 1));
        let future_cutoff = Utc::now() + chrono::Duration::seconds(60);
        let none = log.recent_since(future_cutoff).await;
        assert!(none.is_empty());
        let all = log.recent_since(Utc::now() - chrono::Duration::seconds(60)).await;
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn entry_has_unique_ids() {
        let a = make_entry("simple", 0.0, 0.0, 1);
        let b = make_entry("simple", 0.0, 0.0, 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn with_error_marks_entry_unsuccessful() {
        let entry = make_entry("simple", 0.0, 0.0, 1).with_error("boom");
        assert!(!entry.success);
        assert_eq!(entry.error.as_deref(), Some("boom"));
    }
}
