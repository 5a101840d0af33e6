//! Layered configuration: optional TOML file composed with `ARMADA__*`
//! environment overrides (e.g. `ARMADA__RELAY__MAX_NODES=500`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoreConfig {
    pub relay: RelayConfig,
    pub store: StoreConfig,
    pub ha: HaConfig,
    pub fleet: FleetConfig,
}

/// Relay listener and tunnel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Tunnel (agent upgrade) listener.
    pub bind_addr: String,
    /// Health/HA HTTP listener.
    pub api_addr: String,
    /// Endpoint base path, e.g. `/armada`.
    pub base_path: String,
    /// Fleet capacity; registrations beyond it are refused with
    /// try-again-later.
    pub max_nodes: usize,
    pub ping_interval_secs: u64,
    /// Deadline for the register frame after connection establishment.
    pub negotiation_timeout_secs: u64,
    pub auth: AuthConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7443".into(),
            api_addr: "0.0.0.0:7080".into(),
            base_path: "/armada".into(),
            max_nodes: 1000,
            ping_interval_secs: 30,
            negotiation_timeout_secs: 10,
            auth: AuthConfig::default(),
        }
    }
}

/// Tunnel authentication. mTLS-first: when a CA is configured the listener
/// requires client certificates and the bearer token is ignored; the bearer
/// token is a deprecated fallback for migration only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub ca_cert_path: Option<String>,
    pub server_cert_path: Option<String>,
    pub server_key_path: Option<String>,
    pub bearer_token: Option<String>,
}

impl AuthConfig {
    pub fn mtls_configured(&self) -> bool {
        self.ca_cert_path.is_some()
            && self.server_cert_path.is_some()
            && self.server_key_path.is_some()
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: String,
    pub postgres_url: String,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: "armada.db".into(),
            postgres_url: String::new(),
            max_connections: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    pub instance_id: String,
    /// Base URL of the peer's API listener, e.g. `http://relay-2:7080`.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    pub instance_id: String,
    pub peers: Vec<PeerConfig>,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub drain_timeout_secs: u64,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("relay-{}", Uuid::new_v4()),
            peers: Vec::new(),
            probe_interval_secs: 10,
            probe_timeout_secs: 3,
            drain_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Stale-node sweep interval.
    pub gc_interval_secs: u64,
    /// Online nodes unseen for this long become unreachable.
    pub stale_after_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: 60,
            stale_after_secs: 180,
        }
    }
}

impl CoreConfig {
    /// Compose defaults, an optional config file, and environment overrides.
    /// Environment variables win over any configured value.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder
            .add_source(Environment::with_prefix("ARMADA").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.relay.max_nodes, 1000);
        assert_eq!(cfg.relay.base_path, "/armada");
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert!(!cfg.relay.auth.mtls_configured());
    }

    #[test]
    fn environment_overrides_configured_values() {
        std::env::set_var("ARMADA__RELAY__MAX_NODES", "7");
        std::env::set_var("ARMADA__RELAY__BASE_PATH", "/fleet");
        let cfg = CoreConfig::load(None).unwrap();
        std::env::remove_var("ARMADA__RELAY__MAX_NODES");
        std::env::remove_var("ARMADA__RELAY__BASE_PATH");

        assert_eq!(cfg.relay.max_nodes, 7);
        assert_eq!(cfg.relay.base_path, "/fleet");
    }
}
