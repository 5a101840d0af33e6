//! High-availability coordination across relay peers.
//!
//! No consensus: instances share the durable store and partition node
//! ownership by consistent-hashing node ids over the set of healthy
//! instances. A periodic probe loop tracks peer health; drain refuses new
//! registrations and lets in-flight tunnels finish.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HaConfig, PeerConfig};

/// Observed state of one peer relay instance.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub instance_id: String,
    pub address: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
}

/// Full cluster view as reported by `/ha/cluster`.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterView {
    pub instance_id: String,
    pub draining: bool,
    pub healthy_instances: Vec<String>,
    pub peers: Vec<PeerStatus>,
}

pub struct HaCoordinator {
    instance_id: String,
    base_path: String,
    peers: RwLock<HashMap<String, PeerStatus>>,
    draining: AtomicBool,
    probe_timeout: Duration,
    client: reqwest::Client,
}

impl HaCoordinator {
    pub fn new(config: &HaConfig, base_path: impl Into<String>) -> Arc<Self> {
        let peers = config
            .peers
            .iter()
            .map(|PeerConfig { instance_id, address }| {
                (
                    instance_id.clone(),
                    PeerStatus {
                        instance_id: instance_id.clone(),
                        address: address.clone(),
                        // Peers start healthy; the probe loop demotes them.
                        healthy: true,
                        last_check: Utc::now(),
                        consecutive_failures: 0,
                    },
                )
            })
            .collect();

        // The probe client builds its TLS stack on construction.
        armada_identity::tls::init_crypto_provider();

        Arc::new(Self {
            instance_id: config.instance_id.clone(),
            base_path: base_path.into(),
            peers: RwLock::new(peers),
            draining: AtomicBool::new(false),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs.max(1)),
            client: reqwest::Client::new(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Stable (sorted) list of healthy instance ids, self included.
    pub async fn healthy_instances(&self) -> Vec<String> {
        let peers = self.peers.read().await;
        let mut healthy: Vec<String> = peers
            .values()
            .filter(|p| p.healthy)
            .map(|p| p.instance_id.clone())
            .collect();
        healthy.push(self.instance_id.clone());
        healthy.sort();
        healthy
    }

    /// The instance that owns `node_id`: FNV-1a over the id, modulo the
    /// healthy instance count, in stable order.
    pub async fn preferred_instance(&self, node_id: &str) -> String {
        let healthy = self.healthy_instances().await;
        let index = (fnv1a(node_id.as_bytes()) % healthy.len() as u64) as usize;
        healthy[index].clone()
    }

    pub async fn should_accept_node(&self, node_id: &str) -> bool {
        self.preferred_instance(node_id).await == self.instance_id
    }

    pub async fn set_peer_health(&self, instance_id: &str, healthy: bool) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(instance_id) {
            if peer.healthy && !healthy {
                warn!(peer = %instance_id, "peer transitioned to unhealthy");
            } else if !peer.healthy && healthy {
                info!(peer = %instance_id, "peer recovered");
            }
            peer.healthy = healthy;
            peer.last_check = Utc::now();
            if healthy {
                peer.consecutive_failures = 0;
            } else {
                peer.consecutive_failures += 1;
            }
        }
    }

    /// Probe every peer once. A peer that fails to respond within the probe
    /// timeout transitions to unhealthy.
    pub async fn probe_peers_once(&self) {
        let targets: Vec<(String, String)> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .map(|p| (p.instance_id.clone(), p.address.clone()))
                .collect()
        };

        for (instance_id, address) in targets {
            let url = format!("{}{}/ha/status", address, self.base_path);
            let outcome = self
                .client
                .get(&url)
                .timeout(self.probe_timeout)
                .send()
                .await;
            let healthy = matches!(&outcome, Ok(resp) if resp.status().is_success());
            if let Err(e) = &outcome {
                debug!(peer = %instance_id, "peer probe failed: {}", e);
            }
            self.set_peer_health(&instance_id, healthy).await;
        }
    }

    /// Background peer-health loop.
    pub fn spawn_health_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.probe_peers_once().await;
            }
        })
    }

    pub async fn cluster_view(&self) -> ClusterView {
        let healthy_instances = self.healthy_instances().await;
        let peers = self.peers.read().await;
        let mut peer_list: Vec<PeerStatus> = peers.values().cloned().collect();
        peer_list.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        ClusterView {
            instance_id: self.instance_id.clone(),
            draining: self.is_draining(),
            healthy_instances,
            peers: peer_list,
        }
    }
}

/// FNV-1a, 64-bit.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
