//! NAT-traversal relay: node agents dial out and keep one authenticated
//! tunnel open; the control plane multiplexes commands onto it.

mod api;
mod server;
mod tunnel;

pub use api::spawn_api_server;
pub use server::{RelayServer, RelayStats};
pub use tunnel::{Tunnel, TUNNEL_QUEUE_CAPACITY};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use armada_protocol::{CommandEnvelope, Node, NodeResult};

/// Transport failures surfaced to the executor. Each maps onto a per-node
/// result; one node failing never aborts the rest of a fan-out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no tunnel for node {0}")]
    TunnelMissing(String),
    #[error("tunnel send queue full for node {0}")]
    TunnelFull(String),
    #[error("tunnel closed for node {0}")]
    TunnelClosed(String),
    #[error("command deadline exceeded")]
    Timeout,
    #[error("transport failure: {0}")]
    Other(String),
}

/// Seam between the executor and the relay. Tests substitute an in-process
/// mock; production wires in the `RelayServer`.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Dispatch one command to one node and await its correlated result.
    async fn execute(
        &self,
        node: &Node,
        envelope: CommandEnvelope,
        timeout: Duration,
    ) -> Result<NodeResult, TransportError>;
}
