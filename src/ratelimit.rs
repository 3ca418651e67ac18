//! Rate-Limit Map (C8) — per-model cooldown marks, used to deprioritize
//! recently-throttled models in the fallback chain (spec.md §4.7).
//!
//! This is a distinct concept from `api::rate_limit`'s per-client-IP token
//! bucket (which protects the proxy's own HTTP port from abuse): C8 tracks
//! which *upstream models* recently returned 429, not which *clients* are
//! sending too many requests. Both reuse the teacher's `dashmap::DashMap`
//! mechanism (`api/rate_limit.rs`'s per-IP `Bucket` map) for lock-free
//! concurrent access, but the semantics here are lazy-expiring marks, not
//! token buckets.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// `{modelId, hitAt}` — spec.md §3 `RateLimitMark`.
pub struct RateLimitMap {
    marks: DashMap<String, Instant>,
    cooldown: Duration,
}

impl RateLimitMap {
    pub fn new(cooldown: Duration) -> Self {
        Self { marks: DashMap::new(), cooldown }
    }

    /// `markRateLimited(model)` — records `now`.
    pub fn mark_rate_limited(&self, model: &str) {
        self.marks.insert(model.to_string(), Instant::now());
    }

    /// `isRateLimited(model)` — true iff an unexpired mark exists. Expired
    /// marks are removed lazily, here, on lookup.
    pub fn is_rate_limited(&self, model: &str) -> bool {
        let expired = match self.marks.get(model) {
            Some(hit_at) => hit_at.elapsed() >= self.cooldown,
            None => return false,
        };
        if expired {
            self.marks.remove(model);
            false
        } else {
            true
        }
    }

    /// How long ago `model` was marked, or `None` if never marked / expired.
    fn hit_age(&self, model: &str) -> Option<Duration> {
        self.marks.get(model).map(|m| m.elapsed())
    }

    /// `prioritize(list)` — partitions into `{notLimited ∷ limited}`,
    /// preserving original order within each partition. Among the limited
    /// partition, ties are irrelevant to ordering here; callers that need
    /// the single least-recently-throttled candidate use
    /// [`RateLimitMap::least_recently_throttled`].
    pub fn prioritize<'a>(&self, list: &[&'a str]) -> (Vec<&'a str>, Vec<&'a str>) {
        let mut not_limited = Vec::new();
        let mut limited = Vec::new();
        for &model in list {
            if self.is_rate_limited(model) {
                limited.push(model);
            } else {
                not_limited.push(model);
            }
        }
        (not_limited, limited)
    }

    /// Among `list` (assumed all currently rate-limited), the one whose mark
    /// is oldest — spec.md §4.4 FALLBACK_NEXT: "if all candidates are
    /// rate-limited, take the least-recently-throttled".
    pub fn least_recently_throttled<'a>(&self, list: &[&'a str]) -> Option<&'a str> {
        list.iter()
            .copied()
            .max_by_key(|m| self.hit_age(m).unwrap_or(Duration::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_model_is_not_rate_limited() {
        let map = RateLimitMap::new(Duration::from_secs(60));
        assert!(!map.is_rate_limited("openai/gpt-5-mini"));
    }

    #[test]
    fn marked_model_is_rate_limited_until_cooldown_expires() {
        let map = RateLimitMap::new(Duration::from_millis(50));
        map.mark_rate_limited("openai/gpt-5-mini");
        assert!(map.is_rate_limited("openai/gpt-5-mini"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!map.is_rate_limited("openai/gpt-5-mini"));
    }

    #[test]
    fn prioritize_partitions_preserving_order() {
        let map = RateLimitMap::new(Duration::from_secs(60));
        map.mark_rate_limited("b");
        let (not_limited, limited) = map.prioritize(&["a", "b", "c"]);
        assert_eq!(not_limited, vec!["a", "c"]);
        assert_eq!(limited, vec!["b"]);
    }

    #[test]
    fn least_recently_throttled_picks_oldest_mark() {
        let map = RateLimitMap::new(Duration::from_secs(60));
        map.mark_rate_limited("recent");
        std::thread::sleep(Duration::from_millis(20));
        // Re-mark "recent" to make it newer than a separately-marked model.
        let map2 = RateLimitMap::new(Duration::from_secs(60));
        map2.mark_rate_limited("older");
        std::thread::sleep(Duration::from_millis(30));
        map2.mark_rate_limited("newer");
        let oldest = map2.least_recently_throttled(&["older", "newer"]);
        assert_eq!(oldest, Some("older"));
        let _ = map;
    }
}
