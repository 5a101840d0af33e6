//! One live authenticated duplex connection between a node agent and the
//! relay. A single tunnel carries many concurrent commands; correlation is
//! purely by request id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use armada_protocol::{Frame, NodeResult};

use super::TransportError;

/// Bounded capacity of the per-tunnel outbound queue. Enqueueing beyond it
/// blocks the sender, which backpressures the executor's semaphore.
pub const TUNNEL_QUEUE_CAPACITY: usize = 32;

pub struct Tunnel {
    pub node_id: String,
    pub tunnel_id: String,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Frame>,
    pending: DashMap<String, oneshot::Sender<NodeResult>>,
    closed_tx: watch::Sender<bool>,
}

impl Tunnel {
    /// Create the tunnel and hand back the outbound queue receiver for the
    /// connection's writer task.
    pub fn new(node_id: impl Into<String>, remote_addr: impl Into<String>) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::channel(TUNNEL_QUEUE_CAPACITY);
        let (closed_tx, _) = watch::channel(false);
        let tunnel = Self {
            node_id: node_id.into(),
            tunnel_id: Uuid::new_v4().to_string(),
            remote_addr: remote_addr.into(),
            connected_at: Utc::now(),
            outbound,
            pending: DashMap::new(),
            closed_tx,
        };
        (tunnel, outbound_rx)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Watch that flips to `true` when the tunnel closes.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Register a correlation slot and enqueue the command frame. A queue
    /// that stays full past `enqueue_timeout` surfaces as `TunnelFull`; a
    /// closed queue as `TunnelClosed`.
    pub async fn send_command(
        &self,
        frame: Frame,
        request_id: &str,
        enqueue_timeout: Duration,
    ) -> Result<oneshot::Receiver<NodeResult>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::TunnelClosed(self.node_id.clone()));
        }
        let (result_tx, result_rx) = oneshot::channel();
        self.pending.insert(request_id.to_string(), result_tx);

        match self.outbound.send_timeout(frame, enqueue_timeout).await {
            Ok(()) => Ok(result_rx),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.pending.remove(request_id);
                Err(TransportError::TunnelFull(self.node_id.clone()))
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.pending.remove(request_id);
                Err(TransportError::TunnelClosed(self.node_id.clone()))
            }
        }
    }

    /// Best-effort enqueue for control frames (pings, acks). Dropped when
    /// the queue is full.
    pub fn try_enqueue(&self, frame: Frame) {
        if let Err(e) = self.outbound.try_send(frame) {
            debug!(node_id = %self.node_id, "control frame dropped: {}", e);
        }
    }

    /// Deliver a result to its correlation slot. Results with an unknown
    /// request id are logged and discarded.
    pub fn complete(&self, request_id: &str, result: NodeResult) {
        match self.pending.remove(request_id) {
            Some((_, slot)) => {
                let _ = slot.send(result);
            }
            None => {
                warn!(
                    node_id = %self.node_id,
                    request_id = %request_id,
                    "result for unknown request id discarded"
                );
            }
        }
    }

    /// Drop the pending slot for an abandoned command.
    pub fn abandon(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    /// Close the tunnel: every in-flight waiter observes `tunnel-closed`.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_protocol::ResultStatus;

    fn result() -> NodeResult {
        NodeResult {
            node_id: "n1".into(),
            hostname: "h1".into(),
            output: "done".into(),
            exit_code: 0,
            error: None,
            duration_ms: 1,
            status: ResultStatus::Success,
        }
    }

    #[tokio::test]
    async fn result_reaches_registered_waiter() {
        let (tunnel, mut rx) = Tunnel::new("n1", "10.0.0.9:4444");
        let waiter = tunnel
            .send_command(Frame::ping(), "req-1", Duration::from_secs(1))
            .await
            .unwrap();
        // Frame reached the outbound queue.
        assert!(rx.recv().await.is_some());

        tunnel.complete("req-1", result());
        let got = waiter.await.unwrap();
        assert_eq!(got.status, ResultStatus::Success);
    }

    #[tokio::test]
    async fn unknown_request_id_is_discarded() {
        let (tunnel, _rx) = Tunnel::new("n1", "10.0.0.9:4444");
        // No waiter registered; must not panic.
        tunnel.complete("ghost", result());
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_yields_tunnel_full() {
        let (tunnel, _rx) = Tunnel::new("n1", "10.0.0.9:4444");
        // Fill the bounded queue without draining it.
        for i in 0..TUNNEL_QUEUE_CAPACITY {
            tunnel
                .send_command(Frame::ping(), &format!("req-{}", i), Duration::from_millis(50))
                .await
                .unwrap();
        }
        let err = tunnel
            .send_command(Frame::ping(), "req-overflow", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::TunnelFull("n1".into()));
        // The abandoned slot was cleaned up.
        assert_eq!(tunnel.pending_count(), TUNNEL_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn close_fails_in_flight_waiters() {
        let (tunnel, _rx) = Tunnel::new("n1", "10.0.0.9:4444");
        let waiter = tunnel
            .send_command(Frame::ping(), "req-1", Duration::from_secs(1))
            .await
            .unwrap();
        tunnel.close();
        assert!(waiter.await.is_err());

        let err = tunnel
            .send_command(Frame::ping(), "req-2", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::TunnelClosed("n1".into()));
    }
}
