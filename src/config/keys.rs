//! API key config — a read-only JSON file the proxy never writes, shaped
//! `{providers: {<providerId>: {apiKey, baseUrl?}}}` (spec.md §6). This is
//! one of two independent config sources (the other is the routing TOML in
//! [`super::routing`]), mirroring the teacher's pattern of validating every
//! config source eagerly at startup before any port opens.

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::registry::ProviderPrefix;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderKey {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ApiKeysConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderKey>,
}

impl ApiKeysConfig {
    /// Load from `~/.<plugin>/<plugin>/config.json`. Missing file is treated
    /// as "no direct keys configured", not an error — the gateway key alone
    /// may still make every model reachable.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing {} as JSON", path.display()))?;
        Ok(config)
    }

    /// The standard location: `~/.model-router/model-router/config.json`.
    pub fn default_path() -> Option<std::path::PathBuf> {
        let home = std::env::var_os("HOME")?;
        Some(Path::new(&home).join(".model-router").join("model-router").join("config.json"))
    }

    pub fn key_for(&self, provider: ProviderPrefix) -> Option<&ProviderKey> {
        self.providers.get(provider.as_str())
    }

    pub fn has_any(&self) -> bool {
        !self.providers.is_empty()
    }
}
