//! Session Store (C7) — pins a chosen model for a session id's lifetime so
//! that repeat `auto` requests from the same client reuse it (spec.md §4.6).
//!
//! Same `dashmap::DashMap` mechanism as [`crate::ratelimit`] and the
//! teacher's per-IP bucket map; TTL sweeping happens lazily on read/write
//! rather than via a background task, matching the rate limiter's lazy
//! style in `api/rate_limit.rs`.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use dashmap::DashMap;

use crate::registry::Tier;

/// `{sessionId, model, tier, firstSeen, lastSeen}` — spec.md §3 `SessionEntry`.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub model: String,
    pub tier: Tier,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

pub struct SessionStore {
    entries: DashMap<String, SessionEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl SessionStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { entries: DashMap::new(), ttl, max_entries }
    }

    /// `getSessionId(headers)` — first of `X-Session-Id`, `X-Request-Session`,
    /// or a `session` cookie.
    pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
        for name in ["x-session-id", "x-request-session"] {
            if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
                return Some(v.to_string());
            }
        }
        let cookie = headers.get("cookie")?.to_str().ok()?;
        cookie.split(';').find_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            (k.trim() == "session").then(|| v.trim().to_string())
        })
    }

    /// `setSession(id, model, tier)`.
    pub fn set_session(&self, id: &str, model: &str, tier: Tier) {
        self.sweep_if_over_capacity();
        let now = Instant::now();
        self.entries.insert(
            id.to_string(),
            SessionEntry { model: model.to_string(), tier, first_seen: now, last_seen: now },
        );
    }

    /// `touchSession(id)` — refreshes `lastSeen` without changing the pin.
    pub fn touch_session(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.last_seen = Instant::now();
        }
    }

    /// `getSession(id)` — `None` if absent or expired (expired entries are
    /// removed as a side effect, keeping eviction O(1) amortized).
    pub fn get_session(&self, id: &str) -> Option<SessionEntry> {
        let expired = self.entries.get(id).map(|e| e.last_seen.elapsed() > self.ttl)?;
        if expired {
            self.entries.remove(id);
            return None;
        }
        self.entries.get(id).map(|e| e.clone())
    }

    fn sweep_if_over_capacity(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let ttl = self.ttl;
        self.entries.retain(|_, v| v.last_seen.elapsed() <= ttl);
        if self.entries.len() >= self.max_entries {
            // Still over capacity after a TTL sweep — evict the single
            // oldest entry so the map trends back under the bound.
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|e| e.last_seen)
                .map(|e| e.key().clone())
            {
                self.entries.remove(&oldest);
            }
        }
    }
}
