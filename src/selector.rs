//! Selector (C4) — tier + agentic hint → primary model + ordered fallback
//! list, widening to neighboring tiers when the selected tier has no
//! reachable model.
//!
//! Grounded on the pack's `smart_router.rs` resolution logic: pure,
//! synchronous functions, no HTTP, no async, just deterministic decisions
//! over already-loaded configuration. `select` itself never widens — it
//! returns the registry's raw `TierConfig` chain; widening is the caller's
//! job (`widen_until_resolvable`) because "resolvable" depends on C2's key
//! state, which the registry does not know about.

use crate::registry::{ModelRegistry, Tier, TierConfig};

/// `select(tier, agentic?) → (primaryModel, [fallbacks])` — spec.md §4.2.
pub fn select(registry: &ModelRegistry, tier: Tier, agentic: bool) -> Option<&TierConfig> {
    registry.tier_config(tier, agentic)
}

/// Widen from `tier` to the next tier up, then down, in that order, until a
/// tier is found for which `is_resolvable` returns true for at least one
/// model in its chain (spec.md §4.2: "the returned list is never empty").
///
/// `is_resolvable` is supplied by the caller (the proxy server, consulting
/// C2's key state) so this module stays free of I/O.
pub fn widen_until_resolvable<'a>(
    registry: &'a ModelRegistry,
    tier: Tier,
    agentic: bool,
    mut is_resolvable: impl FnMut(&str) -> bool,
) -> Option<(Tier, &'a TierConfig)> {
    let mut any_resolvable = |t: Tier| -> Option<&'a TierConfig> {
        let cfg = select(registry, t, agentic)?;
        cfg.chain().any(|m| is_resolvable(m)).then_some(cfg)
    };

    if let Some(cfg) = any_resolvable(tier) {
        return Some((tier, cfg));
    }

    let mut up = tier;
    while let Some(next) = up.next_up() {
        if let Some(cfg) = any_resolvable(next) {
            return Some((next, cfg));
        }
        up = next;
    }

    let mut down = tier;
    while let Some(next) = down.next_down() {
        if let Some(cfg) = any_resolvable(next) {
            return Some((next, cfg));
        }
        down = next;
    }

    None
}
