//! Routing configuration: the TOML file loaded once at startup that carries
//! the model registry, tier ladders, classifier weights, and store tuning
//! knobs. Loaded and validated the way the teacher loads `Config` (see
//! `Config::load`/`validate` in the original `src/config.rs`): read the
//! whole file, parse with `toml`, run eager `anyhow::ensure!` checks, and
//! never fall back to partially-valid state.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::registry::ModelRegistry;

/// Top-level routing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(flatten)]
    pub registry: ModelRegistry,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub stores: StoreConfig,
}

impl RoutingConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing routing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.registry.validate().context("model registry")?;
        self.scoring.validate().context("scoring config")?;
        Ok(())
    }
}

/// Aggregator gateway connection settings — consulted by the key resolver
/// (C2) and the gateway-catalog refresher (C10).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Base URL of the aggregator, e.g. `https://openrouter.ai/api`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the gateway API key.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Client-identification header the gateway wants alongside the bearer
    /// token (spec.md §4.3 authorization table).
    #[serde(default)]
    pub client_id_header: Option<(String, String)>,

    /// Catalog refresh interval in seconds (default: 3600 — spec.md §4.9 `CACHE_TTL`).
    #[serde(default = "defaults::catalog_cache_ttl_secs")]
    pub catalog_cache_ttl_secs: u64,

    /// Port for the agent-facing client API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Environment variable holding the admin API bearer token. Unset
    /// disables admin authentication (teacher: `admin_token_env`).
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Number of recent requests kept in the in-memory traffic log (default: 500).
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,

    /// Requests-per-minute cap per client IP on the client port. Unset
    /// disables rate limiting (teacher: `rate_limit_rpm`).
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: None,
            client_id_header: None,
            catalog_cache_ttl_secs: defaults::catalog_cache_ttl_secs(),
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            admin_token_env: None,
            traffic_log_capacity: defaults::traffic_log_capacity(),
            rate_limit_rpm: None,
        }
    }
}

impl GatewayConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
    }
}

/// Classifier (C3) weights and cutoffs — spec.md §4.1 / §9 Open Question 1:
/// "expose all cutoffs and dimension weights as configuration."
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringConfig {
    #[serde(default = "defaults::w_reasoning_cue")]
    pub w_reasoning_cue: f64,
    #[serde(default = "defaults::w_length_short")]
    pub w_length_short: f64,
    #[serde(default = "defaults::w_length_long")]
    pub w_length_long: f64,
    #[serde(default = "defaults::w_medium_tokens")]
    pub w_medium_tokens: f64,
    #[serde(default = "defaults::w_structured_output")]
    pub w_structured_output: f64,
    #[serde(default = "defaults::w_interrogative")]
    pub w_interrogative: f64,
    #[serde(default = "defaults::w_greeting")]
    pub w_greeting: f64,
    #[serde(default = "defaults::w_code_block")]
    pub w_code_block: f64,

    #[serde(default = "defaults::short_prompt_chars")]
    pub short_prompt_chars: usize,
    #[serde(default = "defaults::long_prompt_chars")]
    pub long_prompt_chars: usize,

    #[serde(default = "defaults::medium_token_threshold")]
    pub medium_token_threshold: u64,
    #[serde(default = "defaults::complex_token_threshold")]
    pub complex_token_threshold: u64,

    #[serde(default = "defaults::medium_cutoff")]
    pub medium_cutoff: f64,
    #[serde(default = "defaults::complex_cutoff")]
    pub complex_cutoff: f64,
    #[serde(default = "defaults::reasoning_cutoff")]
    pub reasoning_cutoff: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            w_reasoning_cue: defaults::w_reasoning_cue(),
            w_length_short: defaults::w_length_short(),
            w_length_long: defaults::w_length_long(),
            w_medium_tokens: defaults::w_medium_tokens(),
            w_structured_output: defaults::w_structured_output(),
            w_interrogative: defaults::w_interrogative(),
            w_greeting: defaults::w_greeting(),
            w_code_block: defaults::w_code_block(),
            short_prompt_chars: defaults::short_prompt_chars(),
            long_prompt_chars: defaults::long_prompt_chars(),
            medium_token_threshold: defaults::medium_token_threshold(),
            complex_token_threshold: defaults::complex_token_threshold(),
            medium_cutoff: defaults::medium_cutoff(),
            complex_cutoff: defaults::complex_cutoff(),
            reasoning_cutoff: defaults::reasoning_cutoff(),
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.medium_cutoff <= self.complex_cutoff && self.complex_cutoff <= self.reasoning_cutoff,
            "scoring cutoffs must be non-decreasing: medium <= complex <= reasoning"
        );
        anyhow::ensure!(
            self.short_prompt_chars < self.long_prompt_chars,
            "short_prompt_chars must be less than long_prompt_chars"
        );
        Ok(())
    }
}

/// TTL/capacity knobs for the dedup (C6), session (C7), and rate-limit (C8)
/// stores. Defaults match spec.md §3/§4.5-4.7.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "defaults::dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "defaults::dedup_max_entries")]
    pub dedup_max_entries: usize,

    #[serde(default = "defaults::session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "defaults::session_max_entries")]
    pub session_max_entries: usize,

    #[serde(default = "defaults::rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_secs: defaults::dedup_ttl_secs(),
            dedup_max_entries: defaults::dedup_max_entries(),
            session_ttl_secs: defaults::session_ttl_secs(),
            session_max_entries: defaults::session_max_entries(),
            rate_limit_cooldown_secs: defaults::rate_limit_cooldown_secs(),
        }
    }
}

mod defaults {
    pub fn catalog_cache_ttl_secs() -> u64 { 3600 }
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn traffic_log_capacity() -> usize { 500 }

    pub fn w_reasoning_cue() -> f64 { 4.0 }
    pub fn w_length_short() -> f64 { -1.0 }
    pub fn w_length_long() -> f64 { 0.5 }
    pub fn w_medium_tokens() -> f64 { 1.0 }
    pub fn w_structured_output() -> f64 { 1.5 }
    pub fn w_interrogative() -> f64 { -0.5 }
    pub fn w_greeting() -> f64 { -3.0 }
    pub fn w_code_block() -> f64 { 1.0 }

    pub fn short_prompt_chars() -> usize { 80 }
    pub fn long_prompt_chars() -> usize { 400 }

    pub fn medium_token_threshold() -> u64 { 4_000 }
    pub fn complex_token_threshold() -> u64 { 100_000 }

    pub fn medium_cutoff() -> f64 { 1.0 }
    pub fn complex_cutoff() -> f64 { 3.0 }
    pub fn reasoning_cutoff() -> f64 { 5.0 }

    pub fn dedup_ttl_secs() -> u64 { 30 }
    pub fn dedup_max_entries() -> usize { 2_000 }

    pub fn session_ttl_secs() -> u64 { 1_800 }
    pub fn session_max_entries() -> usize { 10_000 }

    pub fn rate_limit_cooldown_secs() -> u64 { 60 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn minimal_toml() -> &'static str {
        r#"
        [gateway]
        base_url = "https://gateway.example/api"
        api_key_env = "GATEWAY_KEY"

        [models."openai/gpt-5-mini"]
        provider = "openai"
        context_window = 128000
        input_price = 0.25
        output_price = 1.0

        [models."anthropic/claude-opus"]
        provider = "anthropic"
        context_window = 200000
        input_price = 15.0
        output_price = 75.0

        [tiers.simple]
        primary = "openai/gpt-5-mini"

        [tiers.reasoning]
        primary = "anthropic/claude-opus"
        fallback = ["openai/gpt-5-mini"]
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg: RoutingConfig = toml::from_str(minimal_toml()).expect("should parse");
        assert_eq!(cfg.gateway.client_port, 8080);
        assert_eq!(cfg.gateway.admin_port, 8081);
        assert_eq!(cfg.scoring.reasoning_cutoff, 5.0);
        assert_eq!(cfg.stores.dedup_ttl_secs, 30);
        cfg.validate().expect("should validate");
    }

    #[test]
    fn validate_rejects_unknown_tier_model() {
        let mut cfg: RoutingConfig = toml::from_str(minimal_toml()).unwrap();
        cfg.registry.tiers.insert(
            crate::registry::Tier::Medium,
            crate::registry::TierConfig { primary: "nope/nope".into(), fallback: vec![] },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_decreasing_cutoffs() {
        let mut scoring = ScoringConfig::default();
        scoring.complex_cutoff = 0.5; // below medium_cutoff
        assert!(scoring.validate().is_err());
    }

    #[test]
    fn gateway_config_reads_key_from_env() {
        std::env::set_var("TEST_GATEWAY_KEY_ROUTING", "secret123");
        let gw = GatewayConfig { api_key_env: Some("TEST_GATEWAY_KEY_ROUTING".into()), ..Default::default() };
        assert_eq!(gw.api_key().as_deref(), Some("secret123"));
        std::env::remove_var("TEST_GATEWAY_KEY_ROUTING");
    }

    #[test]
    fn empty_model_table_still_parses() {
        let cfg: RoutingConfig = toml::from_str(
            r#"
            [models]
            [tiers]
            "#,
        )
        .expect("should parse");
        assert!(cfg.registry.models.is_empty());
        let _ = HashMap::<String, String>::new();
    }
}
