//! Key Resolver (C2) — given a model id, decide `{apiKey, upstream base
//! URL, provider, viaGateway}` using a direct-provider key or gateway
//! fallback (spec.md §4.8).
//!
//! Grounded on the teacher's `BackendConfig::api_key()` (env-var-backed key
//! lookup, `src/config.rs`) and `BackendClient::new` (`src/backends/mod.rs`)
//! for the base-URL-per-provider shape, generalized to the gateway-vs-direct
//! decision spec.md §4.8 describes.

use crate::config::keys::ApiKeysConfig;
use crate::config::routing::GatewayConfig;
use crate::registry::{Dialect, Model, ProviderPrefix};

/// Resolved access for dispatching a single request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAccess {
    pub api_key: String,
    pub base_url: String,
    pub provider: ProviderPrefix,
    pub via_gateway: bool,
    /// The gateway's configured client-identification header, carried along
    /// for gateway-routed requests only (`None` for direct dispatch).
    pub client_id_header: Option<(String, String)>,
}

/// `resolve(model) → ResolvedAccess | unreachable` per spec.md §4.8's
/// four-step decision:
/// 1. provider needs translation (native dialect ≠ A) and a gateway key
///    exists → gateway;
/// 2. a direct key exists and the provider speaks dialect A natively →
///    direct;
/// 3. a gateway key exists → gateway (universal fallback);
/// 4. otherwise unreachable.
pub fn resolve(model: &Model, keys: &ApiKeysConfig, gateway: &GatewayConfig) -> Option<ResolvedAccess> {
    let gateway_key = gateway.api_key();
    let native_dialect = model.provider.native_dialect();

    if native_dialect != Dialect::A {
        if let (Some(key), Some(base_url)) = (gateway_key.clone(), gateway.base_url.clone()) {
            return Some(ResolvedAccess {
                api_key: key,
                base_url,
                provider: model.provider,
                via_gateway: true,
                client_id_header: gateway.client_id_header.clone(),
            });
        }
    }

    if native_dialect == Dialect::A {
        if let Some(direct) = keys.key_for(model.provider) {
            let base_url = direct
                .base_url
                .clone()
                .unwrap_or_else(|| default_base_url(model.provider));
            return Some(ResolvedAccess {
                api_key: direct.api_key.clone(),
                base_url,
                provider: model.provider,
                via_gateway: false,
                client_id_header: None,
            });
        }
    }

    if let (Some(key), Some(base_url)) = (gateway_key, gateway.base_url.clone()) {
        return Some(ResolvedAccess {
            api_key: key,
            base_url,
            provider: model.provider,
            via_gateway: true,
            client_id_header: gateway.client_id_header.clone(),
        });
    }

    None
}

/// Whether `model` is reachable at all under the current key configuration —
/// used by the selector's widening logic, which only cares about
/// yes/no reachability, not the resolved access details.
pub fn is_resolvable(model: &Model, keys: &ApiKeysConfig, gateway: &GatewayConfig) -> bool {
    resolve(model, keys, gateway).is_some()
}

fn default_base_url(provider: ProviderPrefix) -> String {
    match provider {
        ProviderPrefix::OpenAI => "https://api.openai.com".into(),
        ProviderPrefix::Anthropic => "https://api.anthropic.com".into(),
        ProviderPrefix::Google => "https://generativelanguage.googleapis.com".into(),
        ProviderPrefix::Groq => "https://api.groq.com/openai".into(),
        ProviderPrefix::DeepSeek => "https://api.deepseek.com".into(),
        ProviderPrefix::Mistral => "https://api.mistral.ai".into(),
        ProviderPrefix::Gateway => String::new(),
    }
}

/// Authorization headers for `access` — spec.md §4.3 authorization table.
/// Returns `(header_name, header_value)` pairs to set on the outbound request.
pub fn auth_headers(access: &ResolvedAccess) -> Vec<(String, String)> {
    if access.via_gateway {
        let mut headers = vec![("Authorization".to_string(), format!("Bearer {}", access.api_key))];
        if let Some((name, value)) = &access.client_id_header {
            headers.push((name.clone(), value.clone()));
        }
        return headers;
    }
    match access.provider.native_dialect() {
        Dialect::A => vec![("Authorization".to_string(), format!("Bearer {}", access.api_key))],
        Dialect::B => vec![
            ("x-api-key".to_string(), access.api_key.clone()),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ],
        Dialect::C => vec![("x-goog-api-key".to_string(), access.api_key.clone())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys::ProviderKey;
    use std::collections::HashMap;

    fn model(provider: ProviderPrefix) -> Model {
        Model { id: format!("{provider}/x"), provider, context_window: 1, input_price: 0.0, output_price: 0.0, agentic: false }
    }

    fn gateway_with_key() -> GatewayConfig {
        GatewayConfig {
            base_url: Some("https://gw.example/api".into()),
            api_key_env: Some("TEST_KEYRESOLVER_GW_KEY".into()),
            ..Default::default()
        }
    }

    fn keys_with(provider: &str, key: &str) -> ApiKeysConfig {
        let mut providers = HashMap::new();
        providers.insert(provider.to_string(), ProviderKey { api_key: key.into(), base_url: None });
        ApiKeysConfig { providers }
    }

    #[test]
    fn dialect_b_provider_prefers_gateway_when_available() {
        std::env::set_var("TEST_KEYRESOLVER_GW_KEY", "gwkey");
        let resolved = resolve(&model(ProviderPrefix::Anthropic), &ApiKeysConfig::default(), &gateway_with_key());
        std::env::remove_var("TEST_KEYRESOLVER_GW_KEY");
        let resolved = resolved.unwrap();
        assert!(resolved.via_gateway);
        assert_eq!(resolved.api_key, "gwkey");
    }

    #[test]
    fn dialect_a_provider_prefers_direct_key() {
        let keys = keys_with("openai", "sk-direct");
        let resolved = resolve(&model(ProviderPrefix::OpenAI), &keys, &GatewayConfig::default()).unwrap();
        assert!(!resolved.via_gateway);
        assert_eq!(resolved.api_key, "sk-direct");
    }

    #[test]
    fn dialect_a_provider_falls_back_to_gateway_without_direct_key() {
        std::env::set_var("TEST_KEYRESOLVER_GW_KEY2", "gwkey2");
        let gw = GatewayConfig { api_key_env: Some("TEST_KEYRESOLVER_GW_KEY2".into()), ..gateway_with_key() };
        let resolved = resolve(&model(ProviderPrefix::OpenAI), &ApiKeysConfig::default(), &gw);
        std::env::remove_var("TEST_KEYRESOLVER_GW_KEY2");
        let resolved = resolved.unwrap();
        assert!(resolved.via_gateway);
    }

    #[test]
    fn unreachable_when_no_key_anywhere() {
        let resolved = resolve(&model(ProviderPrefix::OpenAI), &ApiKeysConfig::default(), &GatewayConfig::default());
        assert!(resolved.is_none());
    }

    #[test]
    fn auth_headers_for_direct_dialect_b() {
        let access = ResolvedAccess {
            api_key: "ak".into(),
            base_url: "https://api.anthropic.com".into(),
            provider: ProviderPrefix::Anthropic,
            via_gateway: false,
            client_id_header: None,
        };
        let headers = auth_headers(&access);
        assert!(headers.iter().any(|(k, v)| k == "x-api-key" && v == "ak"));
        assert!(headers.iter().any(|(k, _)| k == "anthropic-version"));
    }

    #[test]
    fn auth_headers_via_gateway_always_bearer() {
        let access = ResolvedAccess {
            api_key: "gwkey".into(),
            base_url: "https://gw.example".into(),
            provider: ProviderPrefix::Google,
            via_gateway: true,
            client_id_header: None,
        };
        let headers = auth_headers(&access);
        assert!(headers.iter().any(|(k, v)| k == "Authorization" && v == "Bearer gwkey"));
    }

    #[test]
    fn auth_headers_via_gateway_emits_configured_client_id_header() {
        let access = ResolvedAccess {
            api_key: "gwkey".into(),
            base_url: "https://gw.example".into(),
            provider: ProviderPrefix::Google,
            via_gateway: true,
            client_id_header: Some(("HTTP-Referer".into(), "model-router".into())),
        };
        let headers = auth_headers(&access);
        assert!(headers.iter().any(|(k, v)| k == "HTTP-Referer" && v == "model-router"));
    }
}
