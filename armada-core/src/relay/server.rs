//! Relay server: accepts authenticated outbound connections from node
//! agents, multiplexes control-plane commands onto each tunnel, and
//! demultiplexes responses by correlation id.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use armada_identity::{constant_time_eq, peer_common_name, tls};
use armada_protocol::{CommandEnvelope, Frame, FrameType, Node, NodeResult, NodeStatus};

use super::{NodeTransport, TransportError, Tunnel};
use crate::config::RelayConfig;
use crate::fleet::NodeManager;
use crate::ha::HaCoordinator;

/// Point-in-time relay counters surfaced by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub active_tunnels: usize,
    pub total_connections: u64,
    pub commands_dispatched: u64,
    pub results_received: u64,
    pub draining: bool,
}

pub struct RelayServer {
    config: RelayConfig,
    manager: Arc<NodeManager>,
    /// When clustered, registrations for nodes owned by a peer are refused.
    ha: Option<Arc<HaCoordinator>>,
    tunnels: DashMap<String, Arc<Tunnel>>,
    tls_acceptor: Option<TlsAcceptor>,
    draining: AtomicBool,
    total_connections: AtomicU64,
    commands_dispatched: AtomicU64,
    results_received: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Assemble the server; TLS material is loaded eagerly so a bad path
    /// fails at startup rather than on first connect.
    pub fn new(
        config: RelayConfig,
        manager: Arc<NodeManager>,
        ha: Option<Arc<HaCoordinator>>,
    ) -> anyhow::Result<Arc<Self>> {
        let tls_acceptor = if config.auth.mtls_configured() {
            let cert_pem = std::fs::read_to_string(
                config.auth.server_cert_path.as_deref().unwrap_or_default(),
            )?;
            let key_pem = std::fs::read_to_string(
                config.auth.server_key_path.as_deref().unwrap_or_default(),
            )?;
            let ca_pem =
                std::fs::read_to_string(config.auth.ca_cert_path.as_deref().unwrap_or_default())?;
            let tls_config = tls::server_config(&cert_pem, &key_pem, Some(&ca_pem))?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        } else {
            if config.auth.bearer_token.is_none() {
                warn!("relay running without mTLS or bearer token; tunnel auth is disabled");
            }
            None
        };

        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Arc::new(Self {
            config,
            manager,
            ha,
            tunnels: DashMap::new(),
            tls_acceptor,
            draining: AtomicBool::new(false),
            total_connections: AtomicU64::new(0),
            commands_dispatched: AtomicU64::new(0),
            results_received: AtomicU64::new(0),
            shutdown_tx,
        }))
    }

    /// Bind the tunnel listener and spawn the accept loop. Returns the
    /// bound address (useful with an ephemeral port).
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "relay tunnel listener on {} ({})",
            local_addr,
            if self.tls_acceptor.is_some() { "mTLS" } else { "plain" }
        );

        let server = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, addr).await {
                                    debug!("connection from {} ended: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => error!("tunnel accept failed: {}", e),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("relay accept loop shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_tunnels: self.tunnels.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            results_received: self.results_received.load(Ordering::Relaxed),
            draining: self.is_draining(),
        }
    }

    pub fn active_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    pub fn has_tunnel(&self, node_id: &str) -> bool {
        self.tunnels.contains_key(node_id)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Refuse new registrations and wait up to `timeout` for the existing
    /// tunnels to close. Returns whether the relay fully drained.
    pub async fn begin_drain(&self, timeout: Duration) -> bool {
        self.draining.store(true, Ordering::SeqCst);
        info!(
            active_tunnels = self.tunnels.len(),
            "drain started; refusing new registrations"
        );
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.tunnels.is_empty() {
                info!("drain complete");
                return true;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        warn!(
            remaining = self.tunnels.len(),
            "drain timeout reached with tunnels still open"
        );
        self.tunnels.is_empty()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> anyhow::Result<()> {
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        match self.tls_acceptor.clone() {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                // The handshake already verified the chain against the CA;
                // the CN becomes the authenticated node identity.
                let peer_cn = {
                    let (_, connection) = tls_stream.get_ref();
                    let certs = connection
                        .peer_certificates()
                        .ok_or_else(|| anyhow::anyhow!("no client certificate presented"))?;
                    let first = certs
                        .first()
                        .ok_or_else(|| anyhow::anyhow!("empty client certificate chain"))?;
                    peer_common_name(first.as_ref())?
                };
                self.serve_stream(tls_stream, Some(peer_cn), addr).await
            }
            None => self.serve_stream(stream, None, addr).await,
        }
    }

    /// Upgrade the stream, run the register handshake, then serve frames
    /// until either side disconnects.
    async fn serve_stream<S>(
        self: Arc<Self>,
        stream: S,
        peer_cn: Option<String>,
        addr: SocketAddr,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let expected_path = format!("{}/agent", self.config.base_path);
        // Bearer auth applies only in fallback mode; with mTLS the
        // certificate is authoritative.
        let bearer = if peer_cn.is_none() {
            self.config.auth.bearer_token.clone()
        } else {
            None
        };

        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() != expected_path {
                return Err(reject(http::StatusCode::NOT_FOUND, "unknown endpoint"));
            }
            if let Some(expected) = &bearer {
                let authorized = req
                    .headers()
                    .get(http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .map(|token| constant_time_eq(token.as_bytes(), expected.as_bytes()))
                    .unwrap_or(false);
                if !authorized {
                    return Err(reject(http::StatusCode::UNAUTHORIZED, "unauthorized"));
                }
            }
            Ok(resp)
        };

        let ws = accept_hdr_async(stream, callback).await?;
        let (mut sink, mut stream) = ws.split();

        // Awaiting-Register: exactly one register frame within the deadline.
        let negotiation = Duration::from_secs(self.config.negotiation_timeout_secs);
        let first = match tokio::time::timeout(negotiation, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) | Ok(Some(Err(_))) | Ok(None) => {
                return close_with_error(&mut sink, "expected register frame").await;
            }
            Err(_) => {
                return close_with_error(&mut sink, "register deadline exceeded").await;
            }
        };
        let frame: Frame = match serde_json::from_str(&first) {
            Ok(frame) => frame,
            Err(e) => {
                return close_with_error(&mut sink, &format!("malformed frame: {}", e)).await;
            }
        };
        if frame.frame_type != FrameType::Register {
            return close_with_error(
                &mut sink,
                &format!("expected register frame, got {}", frame.frame_type),
            )
            .await;
        }
        let Some(node_id) = frame.node_id.clone().filter(|id| !id.is_empty()) else {
            return close_with_error(&mut sink, "register frame missing node_id").await;
        };

        // The declared node id must match the certificate CN.
        if let Some(cn) = &peer_cn {
            if cn != &node_id {
                warn!(declared = %node_id, cn = %cn, "node id / certificate CN mismatch");
                return close_with_error(&mut sink, "node_id does not match certificate CN").await;
            }
        }

        if self.is_draining() {
            return close_with_error(&mut sink, "relay draining, try again later").await;
        }
        // Consistent-hash ownership: nodes preferred onto a healthy peer are
        // redirected there by refusal.
        if let Some(ha) = &self.ha {
            if !ha.should_accept_node(&node_id).await {
                let preferred = ha.preferred_instance(&node_id).await;
                info!(node_id = %node_id, preferred = %preferred, "node owned by peer instance");
                return close_with_error(
                    &mut sink,
                    &format!("node is owned by instance {}, try again later", preferred),
                )
                .await;
            }
        }
        // Capacity check never evicts existing tunnels.
        if !self.tunnels.contains_key(&node_id) && self.tunnels.len() >= self.config.max_nodes {
            warn!(node_id = %node_id, "fleet at capacity, refusing registration");
            return close_with_error(&mut sink, "fleet at capacity, try again later").await;
        }

        let payload = match frame.register_payload() {
            Ok(payload) => payload,
            Err(e) => {
                return close_with_error(&mut sink, &format!("bad register payload: {}", e)).await;
            }
        };

        let (tunnel, mut outbound_rx) = Tunnel::new(&node_id, addr.to_string());
        let tunnel = Arc::new(tunnel);

        let mut node = Node::new(&node_id, &payload.hostname, addr.to_string());
        node.capabilities = payload.capabilities.clone();
        node.resources = payload.resources.clone().unwrap_or_default();
        node.version = payload.version.clone().unwrap_or_default();
        node.tunnel_id = Some(tunnel.tunnel_id.clone());
        if let Err(e) = self.manager.register(node).await {
            error!(node_id = %node_id, "store unavailable during registration: {}", e);
            return close_with_error(&mut sink, "store unavailable").await;
        }

        // Install atomically; a prior tunnel for the same id is closed with
        // going-away ("stale tunnel replaced").
        if let Some(previous) = self.tunnels.insert(node_id.clone(), Arc::clone(&tunnel)) {
            info!(node_id = %node_id, "stale tunnel replaced by new registration");
            previous.close();
        }

        send_frame(&mut sink, &Frame::registered(&node_id)).await?;
        info!(node_id = %node_id, remote = %addr, "tunnel registered");

        // Writer task: single owner of the sink, serializing all writes.
        let writer_tunnel = Arc::clone(&tunnel);
        let ping_every = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let writer = tokio::spawn(async move {
            let mut closed = writer_tunnel.closed_watch();
            let mut ping_timer = tokio::time::interval(ping_every);
            ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping_timer.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if send_frame(&mut sink, &frame).await.is_err() {
                                writer_tunnel.close();
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = ping_timer.tick() => {
                        if send_frame(&mut sink, &Frame::ping()).await.is_err() {
                            writer_tunnel.close();
                            break;
                        }
                    }
                    _ = closed.changed() => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Away,
                                reason: "stale tunnel replaced".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        // Reader loop: this task.
        let mut closed = tunnel.closed_watch();
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => self.handle_frame(&tunnel, frame).await,
                        Err(e) => warn!(node_id = %node_id, "discarding malformed frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(node_id = %node_id, "tunnel read error: {}", e);
                        break;
                    }
                },
                _ = closed.changed() => break,
            }
        }

        // Closing: remove from the routing table only if the entry is still
        // ours (a replacement tunnel must not be evicted).
        let removed = self
            .tunnels
            .remove_if(&node_id, |_, current| current.tunnel_id == tunnel.tunnel_id)
            .is_some();
        tunnel.close();
        writer.abort();
        if removed {
            if let Err(e) = self.manager.set_status(&node_id, NodeStatus::Offline).await {
                warn!(node_id = %node_id, "failed to mark node offline: {}", e);
            }
            info!(node_id = %node_id, "tunnel closed");
        }
        Ok(())
    }

    async fn handle_frame(&self, tunnel: &Arc<Tunnel>, frame: Frame) {
        match frame.frame_type {
            FrameType::Result => {
                self.results_received.fetch_add(1, Ordering::Relaxed);
                let Some(request_id) = frame.request_id.clone() else {
                    warn!(node_id = %tunnel.node_id, "result frame without request id");
                    return;
                };
                match frame.result_payload() {
                    Ok(result) => tunnel.complete(&request_id, result),
                    Err(e) => warn!(node_id = %tunnel.node_id, "bad result payload: {}", e),
                }
                let _ = self.manager.heartbeat(&tunnel.node_id, Utc::now()).await;
            }
            FrameType::Pong => {
                let _ = self.manager.heartbeat(&tunnel.node_id, Utc::now()).await;
            }
            FrameType::Ping => {
                tunnel.try_enqueue(Frame::pong(&tunnel.node_id));
                let _ = self.manager.heartbeat(&tunnel.node_id, Utc::now()).await;
            }
            other => {
                warn!(node_id = %tunnel.node_id, "unexpected {} frame on active tunnel", other);
            }
        }
    }
}

#[async_trait]
impl NodeTransport for RelayServer {
    async fn execute(
        &self,
        node: &Node,
        envelope: CommandEnvelope,
        timeout: Duration,
    ) -> Result<NodeResult, TransportError> {
        let tunnel = self
            .tunnels
            .get(&node.id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::TunnelMissing(node.id.clone()))?;

        let request_id = envelope.request_id.clone();
        let payload =
            serde_json::to_value(&envelope).map_err(|e| TransportError::Other(e.to_string()))?;
        let frame = Frame::command(&node.id, payload, &request_id);

        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
        // A full queue may absorb part of the deadline; the result wait gets
        // whatever budget remains.
        let started = Instant::now();
        let waiter = tunnel.send_command(frame, &request_id, timeout).await?;
        let remaining = timeout.saturating_sub(started.elapsed());

        tokio::select! {
            result = waiter => result.map_err(|_| TransportError::TunnelClosed(node.id.clone())),
            _ = tokio::time::sleep(remaining) => {
                tunnel.abandon(&request_id);
                Err(TransportError::Timeout)
            }
        }
    }
}

fn reject(status: http::StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

async fn send_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    frame: &Frame,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Protocol-error close: one error frame, then a normal close.
async fn close_with_error<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    reason: &str,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("closing tunnel during negotiation: {}", reason);
    let _ = send_frame(sink, &Frame::protocol_error(reason)).await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Protocol,
            reason: reason.to_string().into(),
        })))
        .await;
    Ok(())
}
