//! Configuration loading — split into two independent, narrowly-scoped
//! sources (spec.md §6):
//!
//! - [`routing`] — the TOML file carrying the model registry, tier tables,
//!   classifier weights, and store tuning. Analogous to the teacher's
//!   `Config::load`/`validate` in the original `src/config.rs`.
//! - [`keys`] — the read-only JSON API-keys file external tooling writes
//!   (`~/.<plugin>/<plugin>/config.json`); the proxy only ever reads it.
//!
//! Both are validated eagerly at startup before any port opens, matching
//! the teacher's fail-fast `Config::load` discipline.

pub mod keys;
pub mod routing;

pub use keys::ApiKeysConfig;
pub use routing::RoutingConfig;
