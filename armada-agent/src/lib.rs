//! # Armada Agent
//!
//! Runs on each managed node. Maintains exactly one outbound connection to
//! the relay with auto-reconnect and heartbeats, executes received commands
//! locally under a deny-pattern guard, and answers every command frame with
//! exactly one correlated result frame.

pub mod guard;
pub mod local;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use armada_identity::tls;
use armada_protocol::{
    CommandEnvelope, Frame, FrameType, NodeResources, NodeResult, RegisterPayload, ResultStatus,
};

use crate::local::LocalExecutor;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Agent settings. mTLS-first: with a CA plus client certificate the
/// connection authenticates through the certificate CN; the bearer token is
/// the deprecated fallback.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    /// Full agent endpoint, e.g. `wss://relay.example.com:7443/armada/agent`.
    pub relay_url: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub ca_cert_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub bearer_token: Option<String>,
    pub heartbeat_secs: u64,
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
    pub max_output_bytes: usize,
    pub default_shell: String,
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>, relay_url: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            node_id: node_id.into(),
            relay_url: relay_url.into(),
            hostname,
            capabilities: vec!["shell".to_string(), "file".to_string()],
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            bearer_token: None,
            heartbeat_secs: 20,
            reconnect_min_secs: 1,
            reconnect_max_secs: 60,
            max_output_bytes: 64 * 1024,
            default_shell: "/bin/sh".to_string(),
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    executor: Arc<LocalExecutor>,
    shutdown_tx: watch::Sender<bool>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        if config.node_id.is_empty() {
            bail!("node_id is required");
        }
        if config.relay_url.is_empty() {
            bail!("relay_url is required");
        }
        let executor = LocalExecutor::new(
            &config.node_id,
            &config.hostname,
            &config.default_shell,
            config.max_output_bytes,
        )
        .context("failed to compile execution guard")?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            executor: Arc::new(executor),
            shutdown_tx,
        })
    }

    /// Signal the reconnect loop to stop after the current connection ends.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Connect loop: connect, serve until disconnect, back off, repeat.
    /// Commands are never retried by the agent (at-most-once); only the
    /// connection itself is.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = Duration::from_secs(self.config.reconnect_min_secs.max(1));
        let max_backoff = Duration::from_secs(self.config.reconnect_max_secs.max(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }
            match self.connect_and_serve(&mut shutdown_rx).await {
                Ok(()) => {
                    info!("relay connection closed");
                    backoff = Duration::from_secs(self.config.reconnect_min_secs.max(1));
                }
                Err(e) => {
                    warn!("relay connection failed: {:#}", e);
                }
            }
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            debug!("reconnecting in {:?}", backoff + jitter);
            tokio::select! {
                _ = tokio::time::sleep(backoff + jitter) => {}
                _ = shutdown_rx.changed() => return Ok(()),
            }
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn connect_and_serve(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let mut request = self
            .config
            .relay_url
            .as_str()
            .into_client_request()
            .context("invalid relay url")?;
        if let Some(token) = &self.config.bearer_token {
            request.headers_mut().insert(
                http::header::AUTHORIZATION,
                format!("Bearer {}", token)
                    .parse()
                    .context("invalid bearer token")?,
            );
        }

        let connector = match &self.config.ca_cert_path {
            Some(ca_path) => {
                let ca_pem = std::fs::read_to_string(ca_path)
                    .with_context(|| format!("reading CA certificate {}", ca_path))?;
                let identity = match (&self.config.client_cert_path, &self.config.client_key_path) {
                    (Some(cert_path), Some(key_path)) => {
                        let cert_pem = std::fs::read_to_string(cert_path)
                            .with_context(|| format!("reading client certificate {}", cert_path))?;
                        let key_pem = std::fs::read_to_string(key_path)
                            .with_context(|| format!("reading client key {}", key_path))?;
                        Some((cert_pem, key_pem))
                    }
                    _ => None,
                };
                let client_config = tls::client_config(
                    &ca_pem,
                    identity
                        .as_ref()
                        .map(|(cert, key)| (cert.as_str(), key.as_str())),
                )?;
                Some(Connector::Rustls(Arc::new(client_config)))
            }
            None => None,
        };

        info!(relay = %self.config.relay_url, "connecting to relay");
        let (ws, _response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .context("websocket connect failed")?;
        let (mut sink, mut stream) = ws.split();

        // Register and wait for the ack.
        let payload = RegisterPayload {
            hostname: self.config.hostname.clone(),
            capabilities: self.config.capabilities.clone(),
            resources: Some(local_resources()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };
        send_frame(&mut sink, &Frame::register(&self.config.node_id, &payload)).await?;
        self.await_registered(&mut stream).await?;
        info!(node_id = %self.config.node_id, "registered with relay");

        // Single writer task serializes all frame writes.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(64);
        let mut writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
        });

        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.config.heartbeat_secs.max(1),
        ));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let outcome = loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, &frame_tx),
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(anyhow!("tunnel read error: {}", e)),
                },
                // Heartbeat regardless of traffic so the relay refreshes
                // last-seen.
                _ = heartbeat.tick() => {
                    let _ = frame_tx.send(Frame::pong(&self.config.node_id)).await;
                }
                _ = shutdown_rx.changed() => break Ok(()),
            }
        };

        drop(frame_tx);
        let _ = tokio::time::timeout(Duration::from_secs(2), &mut writer).await;
        writer.abort();
        outcome
    }

    async fn await_registered(&self, stream: &mut futures_util::stream::SplitStream<WsStream>) -> Result<()> {
        let deadline = Duration::from_secs(10);
        let ack = tokio::time::timeout(deadline, async {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let frame: Frame = serde_json::from_str(&text)
                            .map_err(|e| anyhow!("malformed ack frame: {}", e))?;
                        match frame.frame_type {
                            FrameType::Registered => return Ok(()),
                            FrameType::Error => {
                                bail!(
                                    "relay rejected registration: {}",
                                    frame.error.unwrap_or_else(|| "unknown error".into())
                                );
                            }
                            _ => continue,
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        bail!("relay closed during registration: {:?}", frame);
                    }
                    Ok(_) => continue,
                    Err(e) => bail!("read error during registration: {}", e),
                }
            }
            bail!("connection ended before registration ack")
        })
        .await;
        match ack {
            Ok(result) => result,
            Err(_) => bail!("registration ack timed out"),
        }
    }

    /// Dispatch one inbound frame. Command frames run on their own worker so
    /// concurrent commands never serialize behind each other.
    fn handle_text(&self, text: &str, frame_tx: &mpsc::Sender<Frame>) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("discarding malformed frame: {}", e);
                return;
            }
        };
        match frame.frame_type {
            FrameType::Command => {
                let Some(request_id) = frame.request_id.clone() else {
                    warn!("command frame without request id");
                    return;
                };
                let executor = Arc::clone(&self.executor);
                let frame_tx = frame_tx.clone();
                let node_id = self.config.node_id.clone();
                let hostname = self.config.hostname.clone();
                tokio::spawn(async move {
                    let result = match frame
                        .payload
                        .clone()
                        .ok_or_else(|| "command frame without payload".to_string())
                        .and_then(|p| {
                            serde_json::from_value::<CommandEnvelope>(p)
                                .map_err(|e| format!("malformed command payload: {}", e))
                        }) {
                        Ok(envelope) => executor.run(&envelope).await,
                        Err(error) => NodeResult {
                            node_id: node_id.clone(),
                            hostname,
                            output: String::new(),
                            exit_code: -1,
                            error: Some(error),
                            duration_ms: 0,
                            status: ResultStatus::Failure,
                        },
                    };
                    // Exactly one result frame per command frame.
                    if frame_tx
                        .send(Frame::result(&node_id, &request_id, &result))
                        .await
                        .is_err()
                    {
                        error!(request_id = %request_id, "connection gone before result could be sent");
                    }
                });
            }
            FrameType::Ping => {
                let pong = Frame::pong(&self.config.node_id);
                let frame_tx = frame_tx.clone();
                tokio::spawn(async move {
                    let _ = frame_tx.send(pong).await;
                });
            }
            FrameType::Pong | FrameType::Registered => {}
            FrameType::Error => {
                warn!("relay error frame: {}", frame.error.unwrap_or_default());
            }
            FrameType::Register | FrameType::Result => {
                warn!("unexpected {} frame from relay", frame.frame_type);
            }
        }
    }
}

fn local_resources() -> NodeResources {
    NodeResources {
        cpu_cores: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        memory_mb: 0,
        disk_gb: 0,
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Frame) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}
