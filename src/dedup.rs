//! Dedup Store (C6) — short-TTL store keyed by byte-hash of the outbound
//! request, coalescing concurrent duplicates (spec.md §3, §4.5).
//!
//! Two states per key, never both at once: `inflight` (a
//! `tokio::sync::watch` channel later duplicates subscribe to) and
//! `completed` (buffered bytes retained for a TTL). The `DashMap` mechanism
//! matches [`crate::session::SessionStore`] and the teacher's per-IP bucket
//! map; the inflight-coalescing channel itself has no teacher analogue (the
//! teacher dispatches every request independently) and is modeled on
//! design note 9's "two cooperating tasks sharing a channel" instruction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

/// Buffered status + headers + body captured for replay.
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

enum Slot {
    Inflight(watch::Receiver<Option<Arc<CompletedResponse>>>),
    Completed { response: Arc<CompletedResponse>, completed_at: Instant },
}

pub struct DedupStore {
    slots: DashMap<String, Slot>,
    ttl: Duration,
    max_entries: usize,
}

/// A handle returned by [`DedupStore::lookup_or_mark_inflight`]; the caller must call
/// exactly one of [`InflightGuard::complete`] or [`InflightGuard::abandon`]
/// (spec.md §4.5: "every markInflight must be followed by exactly one
/// complete or removeInflight").
pub struct InflightGuard {
    key: String,
    sender: watch::Sender<Option<Arc<CompletedResponse>>>,
}

impl InflightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

pub enum DedupLookup {
    /// No entry existed for this key; the caller now holds the only
    /// [`InflightGuard`] for it and must dispatch.
    Miss(InflightGuard),
    /// A request for this key is in flight; await the returned receiver.
    Inflight(watch::Receiver<Option<Arc<CompletedResponse>>>),
    /// A completed response is cached and still within its TTL.
    Completed(Arc<CompletedResponse>),
}

impl DedupStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { slots: DashMap::new(), ttl, max_entries }
    }

    /// Stable hash over the canonicalized outbound body — the dedup key.
    pub fn hash_body(body: &[u8]) -> String {
        let digest = Sha256::digest(body);
        hex_encode(&digest)
    }

    /// `getCached`/`getInflight`/`markInflight` combined into a single
    /// atomic operation via `DashMap`'s `entry` API, which holds the
    /// per-shard lock for the key across the whole match — two concurrent
    /// callers for the same key can never both observe a miss and both
    /// mark themselves inflight (spec.md §4.5, invariant #6).
    pub fn lookup_or_mark_inflight(&self, key: &str) -> DedupLookup {
        self.sweep_if_over_capacity();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut entry) => match entry.get() {
                Slot::Inflight(rx) => DedupLookup::Inflight(rx.clone()),
                Slot::Completed { response, completed_at } => {
                    if completed_at.elapsed() < self.ttl {
                        DedupLookup::Completed(response.clone())
                    } else {
                        let (tx, rx) = watch::channel(None);
                        entry.insert(Slot::Inflight(rx));
                        DedupLookup::Miss(InflightGuard { key: key.to_string(), sender: tx })
                    }
                }
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(Slot::Inflight(rx));
                DedupLookup::Miss(InflightGuard { key: key.to_string(), sender: tx })
            }
        }
    }

    /// `complete(key, response)` — atomic `inflight → completed` transition.
    pub fn complete(&self, guard: InflightGuard, response: CompletedResponse) {
        let response = Arc::new(response);
        let _ = guard.sender.send(Some(response.clone()));
        self.slots.insert(
            guard.key.clone(),
            Slot::Completed { response, completed_at: Instant::now() },
        );
    }

    /// `removeInflight(key)` — called on client disconnect; no completed
    /// entry is recorded and later duplicates see a fresh miss.
    pub fn abandon(&self, guard: InflightGuard) {
        let _ = guard.sender.send(None);
        self.slots.remove(&guard.key);
    }

    fn sweep_if_over_capacity(&self) {
        if self.slots.len() < self.max_entries {
            return;
        }
        let ttl = self.ttl;
        self.slots.retain(|_, slot| match slot {
            Slot::Inflight(_) => true,
            Slot::Completed { completed_at, .. } => completed_at.elapsed() <= ttl,
        });
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}
