//! Gateway-Catalog Resolver (C10) — on first use and every `CACHE_TTL`,
//! fetch the aggregator gateway's model list and build a local-id →
//! gateway-id map (spec.md §4.9).
//!
//! Grounded on the pack's OpenRouter catalog fetcher (`catalog.rs` in
//! `BotMesh-nanobot`) for the fetch-and-build shape, but swapped from its
//! fetch-once `OnceLock` to a refreshable `RwLock<Arc<HashMap<...>>>`
//! pointer-swap — the same primitive the teacher uses for
//! `RouterState::config_lock` — since this catalog must stay current across
//! the process lifetime, not just warm once.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Local model id → gateway-native model id.
pub type CatalogMap = HashMap<String, String>;

/// Holds the current local→gateway id map behind a pointer swap so readers
/// never block the background refresher and never see a half-built map.
pub struct GatewayCatalog {
    map: RwLock<Arc<CatalogMap>>,
    client: reqwest::Client,
    models_url: String,
}

impl GatewayCatalog {
    pub fn new(client: reqwest::Client, gateway_base_url: &str) -> Self {
        Self {
            map: RwLock::new(Arc::new(HashMap::new())),
            client,
            models_url: format!("{}/v1/models", gateway_base_url.trim_end_matches('/')),
        }
    }

    /// Current snapshot. Cheap: clones an `Arc`, never blocks on the network.
    pub fn snapshot(&self) -> Arc<CatalogMap> {
        self.map.read().expect("gateway catalog lock poisoned").clone()
    }

    /// Fetch the gateway's model list and rebuild the map. On failure the
    /// previous map is retained and the error is returned for the caller to
    /// log — mirrors the teacher's `config_watcher` "keep previous config on
    /// failed reload" behavior.
    pub async fn refresh(&self, local_ids: &[String]) -> anyhow::Result<()> {
        let resp = self.client.get(&self.models_url).send().await?.error_for_status()?;
        let payload: ModelsResponse = resp.json().await?;
        let gateway_ids: Vec<String> = payload.data.into_iter().map(|e| e.id).collect();

        let new_map = build_map(local_ids, &gateway_ids);
        *self.map.write().expect("gateway catalog lock poisoned") = Arc::new(new_map);
        Ok(())
    }

    /// Spawn the background refresher, matching `main.rs`'s `config_watcher`
    /// `tokio::time::interval` shape. Runs until the process exits.
    pub fn spawn_refresher(
        self: Arc<Self>,
        local_ids: Vec<String>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(err) = self.refresh(&local_ids).await {
                    tracing::warn!(error = %err, "gateway catalog refresh failed, keeping previous map");
                }
            }
        })
    }
}

/// Build local-id → gateway-id by (a) exact id match or (b) name-suffix
/// match (strip `<prefix>/`). Unmapped ids are simply absent — the caller
/// passes the id through unchanged and the gateway will 4xx, triggering
/// fallback (spec.md §4.9).
fn build_map(local_ids: &[String], gateway_ids: &[String]) -> CatalogMap {
    let mut map = HashMap::new();
    for local in local_ids {
        if gateway_ids.iter().any(|g| g == local) {
            map.insert(local.clone(), local.clone());
            continue;
        }
        let suffix = local.split_once('/').map(|(_, n)| n).unwrap_or(local.as_str());
        if let Some(found) = gateway_ids.iter().find(|g| {
            g.split_once('/').map(|(_, n)| n).unwrap_or(g.as_str()) == suffix
        }) {
            map.insert(local.clone(), found.clone());
        }
    }
    map
}
