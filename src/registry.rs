//! Model registry (C1) — the static catalog of models the router can choose
//! from, and the tier ladders that map a classified [`Tier`] to a primary
//! model plus its ordered fallback chain.
//!
//! Registry entries are immutable after load, exactly like the teacher's
//! `Config` (see `main.rs`'s `Arc<Config>` + hot-reload swap) — this module
//! only defines the shapes; loading and validation live in
//! [`crate::config::routing`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Which wire dialect a provider speaks natively.
///
/// `nativeDialect(p)` from spec.md §4.8 — used by the key resolver to
/// decide whether a request needs dialect translation before it can go out
/// over a direct (non-gateway) connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// OpenAI-compatible chat-completions — the wire shape the client speaks.
    A,
    /// Anthropic-style "messages" dialect: top-level `system`, `input_tokens`/`output_tokens`.
    B,
    /// Streamed "generate-content" dialect over SSE with alternate field names.
    C,
}

/// Known upstream providers. Each maps to exactly one native [`Dialect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPrefix {
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
    Google,
    Groq,
    #[serde(rename = "deepseek")]
    DeepSeek,
    Mistral,
    /// The aggregator gateway itself — always dialect A.
    Gateway,
}

impl ProviderPrefix {
    /// Parse the `<providerPrefix>` segment of a model id (`"<prefix>/<name>"`).
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "openai" => Self::OpenAI,
            "anthropic" => Self::Anthropic,
            "google" => Self::Google,
            "groq" => Self::Groq,
            "deepseek" => Self::DeepSeek,
            "mistral" => Self::Mistral,
            "gateway" => Self::Gateway,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Groq => "groq",
            Self::DeepSeek => "deepseek",
            Self::Mistral => "mistral",
            Self::Gateway => "gateway",
        }
    }

    /// The wire dialect this provider speaks natively — spec.md §4.8 point 1.
    pub fn native_dialect(&self) -> Dialect {
        match self {
            Self::OpenAI | Self::Groq | Self::DeepSeek | Self::Mistral | Self::Gateway => Dialect::A,
            Self::Anthropic => Dialect::B,
            Self::Google => Dialect::C,
        }
    }
}

impl std::fmt::Display for ProviderPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability/cost band — spec.md GLOSSARY: SIMPLE < MEDIUM < COMPLEX < REASONING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Simple,
    Medium,
    Complex,
    Reasoning,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Simple, Tier::Medium, Tier::Complex, Tier::Reasoning];

    /// The next tier up, or `None` from [`Tier::Reasoning`].
    pub fn next_up(self) -> Option<Tier> {
        Tier::ALL.get(self as usize + 1).copied()
    }

    /// The next tier down, or `None` from [`Tier::Simple`].
    pub fn next_down(self) -> Option<Tier> {
        (self as usize).checked_sub(1).map(|i| Tier::ALL[i])
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Tier::Simple => "simple",
            Tier::Medium => "medium",
            Tier::Complex => "complex",
            Tier::Reasoning => "reasoning",
        })
    }
}

/// Immutable catalog entry — spec.md §3 `Model`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Model {
    /// `"<providerPrefix>/<name>"`. `"auto"` is reserved by the router and
    /// never appears as a registry entry.
    pub id: String,
    pub provider: ProviderPrefix,
    /// Context window in tokens. Must be positive.
    pub context_window: u32,
    /// Currency-per-million-tokens, input side.
    pub input_price: f64,
    /// Currency-per-million-tokens, output side.
    pub output_price: f64,
    /// Eligible for the agentic tier table.
    #[serde(default)]
    pub agentic: bool,
}

impl Model {
    /// Projected cost in the registry's currency unit for a request with
    /// `input_tokens` in and `output_tokens` out.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let million = 1_000_000.0;
        (input_tokens as f64 / million) * self.input_price
            + (output_tokens as f64 / million) * self.output_price
    }

    /// The bare model name the upstream provider expects (strips `"<prefix>/"`).
    pub fn native_name(&self) -> &str {
        self.id
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(self.id.as_str())
    }
}

/// `{primary, fallback}` — spec.md §3 `TierConfig`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierConfig {
    pub primary: String,
    #[serde(default)]
    pub fallback: Vec<String>,
}

impl TierConfig {
    /// `primary` followed by `fallback`, in order — the full candidate chain.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallback.iter().map(String::as_str))
    }
}

/// The static catalog: models plus the two tier ladders (default and agentic).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelRegistry {
    pub models: HashMap<String, Model>,
    pub tiers: HashMap<Tier, TierConfig>,
    #[serde(default)]
    pub agentic_tiers: HashMap<Tier, TierConfig>,
    /// Per-provider model-id remaps (short name → dated snapshot, etc.) —
    /// spec.md §9 open question, resolved as "a small data table alongside
    /// the registry".
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl ModelRegistry {
    pub fn get(&self, id: &str) -> Option<&Model> {
        let id = self.aliases.get(id).map(String::as_str).unwrap_or(id);
        self.models.get(id)
    }

    pub fn tier_config(&self, tier: Tier, agentic: bool) -> Option<&TierConfig> {
        if agentic {
            self.agentic_tiers.get(&tier).or_else(|| self.tiers.get(&tier))
        } else {
            self.tiers.get(&tier)
        }
    }

    /// Validate the invariants from spec.md §3: every `TierConfig.primary`
    /// and `fallback` member must be present in the registry.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (tier, cfg) in self.tiers.iter().chain(self.agentic_tiers.iter()) {
            for model_id in cfg.chain() {
                anyhow::ensure!(
                    self.get(model_id).is_some(),
                    "tier `{tier}` references unknown model `{model_id}`"
                );
            }
        }
        for model in self.models.values() {
            anyhow::ensure!(model.context_window > 0, "model `{}` has non-positive context window", model.id);
            anyhow::ensure!(model.input_price >= 0.0 && model.output_price >= 0.0, "model `{}` has negative price", model.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(id: &str, provider: ProviderPrefix, ctx: u32, in_price: f64, out_price: f64) -> Model {
        Model { id: id.into(), provider, context_window: ctx, input_price: in_price, output_price: out_price, agentic: false }
    }

    fn sample_registry() -> ModelRegistry {
        let mut models = HashMap::new();
        models.insert("openai/gpt-5-mini".into(), model("openai/gpt-5-mini", ProviderPrefix::OpenAI, 128_000, 0.25, 1.0));
        models.insert("anthropic/claude-opus".into(), model("anthropic/claude-opus", ProviderPrefix::Anthropic, 200_000, 15.0, 75.0));

        let mut tiers = HashMap::new();
        tiers.insert(Tier::Simple, TierConfig { primary: "openai/gpt-5-mini".into(), fallback: vec![] });
        tiers.insert(Tier::Reasoning, TierConfig { primary: "anthropic/claude-opus".into(), fallback: vec!["openai/gpt-5-mini".into()] });

        ModelRegistry { models, tiers, agentic_tiers: HashMap::new(), aliases: HashMap::new() }
    }

    #[test]
    fn tier_ordering_is_simple_lowest() {
        assert!(Tier::Simple < Tier::Medium);
        assert!(Tier::Medium < Tier::Complex);
        assert!(Tier::Complex < Tier::Reasoning);
    }

    #[test]
    fn next_up_and_down_walk_the_ladder() {
        assert_eq!(Tier::Simple.next_up(), Some(Tier::Medium));
        assert_eq!(Tier::Reasoning.next_up(), None);
        assert_eq!(Tier::Reasoning.next_down(), Some(Tier::Complex));
        assert_eq!(Tier::Simple.next_down(), None);
    }

    #[test]
    fn native_dialect_mapping() {
        assert_eq!(ProviderPrefix::OpenAI.native_dialect(), Dialect::A);
        assert_eq!(ProviderPrefix::Anthropic.native_dialect(), Dialect::B);
        assert_eq!(ProviderPrefix::Google.native_dialect(), Dialect::C);
    }

    #[test]
    fn estimate_cost_scales_by_millions_of_tokens() {
        let m = model("x/y", ProviderPrefix::OpenAI, 1000, 2.0, 4.0);
        // 500_000 input tokens @ $2/M = $1.00; 250_000 output @ $4/M = $1.00
        let cost = m.estimate_cost(500_000, 250_000);
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn native_name_strips_provider_prefix() {
        let m = model("anthropic/claude-opus-4", ProviderPrefix::Anthropic, 1, 0.0, 0.0);
        assert_eq!(m.native_name(), "claude-opus-4");
    }

    #[test]
    fn registry_validate_accepts_well_formed_tiers() {
        assert!(sample_registry().validate().is_ok());
    }

    #[test]
    fn registry_validate_rejects_dangling_tier_reference() {
        let mut reg = sample_registry();
        reg.tiers.insert(Tier::Medium, TierConfig { primary: "nonexistent/model".into(), fallback: vec![] });
        assert!(reg.validate().is_err());
    }

    #[test]
    fn alias_resolves_to_underlying_model() {
        let mut reg = sample_registry();
        reg.aliases.insert("fast".into(), "openai/gpt-5-mini".into());
        assert!(reg.get("fast").is_some());
        assert_eq!(reg.get("fast").unwrap().id, "openai/gpt-5-mini");
    }

    #[test]
    fn agentic_tier_falls_back_to_default_tier_when_unset() {
        let reg = sample_registry();
        // No agentic table entry for Simple — falls back to the default table.
        let cfg = reg.tier_config(Tier::Simple, true).unwrap();
        assert_eq!(cfg.primary, "openai/gpt-5-mini");
    }
}
