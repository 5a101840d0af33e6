//! Loopback integration: a real relay listener with a real agent (token
//! fallback and full mTLS), stale-tunnel replacement, capacity and drain
//! refusals.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use armada_agent::{Agent, AgentConfig};
use armada_core::config::RelayConfig;
use armada_core::fleet::{FleetExecutor, NodeManager};
use armada_core::relay::{NodeTransport, RelayServer};
use armada_core::store::{FleetStore, MemoryStore};
use armada_identity::CertificateAuthority;
use armada_protocol::{
    CommandEnvelope, Frame, FrameType, Node, NodeStatus, RegisterPayload, ResultStatus,
    TargetSelector, TypedCommand,
};

const TOKEN: &str = "integration-secret";

type RawWs = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_relay(
    mutate: impl FnOnce(&mut RelayConfig),
) -> (Arc<RelayServer>, Arc<MemoryStore>, String) {
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(NodeManager::new(store.clone() as Arc<dyn FleetStore>));

    let mut cfg = RelayConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..Default::default()
    };
    cfg.auth.bearer_token = Some(TOKEN.into());
    mutate(&mut cfg);

    let relay = RelayServer::new(cfg, manager, None).unwrap();
    let addr = relay.start().await.unwrap();
    (relay, store, addr.to_string())
}

fn agent_config(node_id: &str, addr: &str) -> AgentConfig {
    let mut cfg = AgentConfig::new(node_id, format!("ws://{}/armada/agent", addr));
    cfg.bearer_token = Some(TOKEN.into());
    cfg.heartbeat_secs = 1;
    cfg.reconnect_min_secs = 1;
    cfg
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn raw_connect(addr: &str) -> RawWs {
    let mut request = format!("ws://{}/armada/agent", addr)
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        http::header::AUTHORIZATION,
        format!("Bearer {}", TOKEN).parse().unwrap(),
    );
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

async fn read_frame(ws: &mut RawWs) -> Option<Frame> {
    while let Some(message) = ws.next().await {
        match message.ok()? {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn send_frame(ws: &mut RawWs, frame: &Frame) {
    ws.send(Message::Text(serde_json::to_string(frame).unwrap()))
        .await
        .unwrap();
}

async fn register_raw(ws: &mut RawWs, node_id: &str) -> Frame {
    let payload = RegisterPayload {
        hostname: format!("host-{}", node_id),
        capabilities: vec!["shell".into()],
        resources: None,
        version: None,
    };
    send_frame(ws, &Frame::register(node_id, &payload)).await;
    read_frame(ws).await.expect("no response to register")
}

#[tokio::test]
async fn token_agent_registers_and_executes() {
    let (relay, store, addr) = start_relay(|_| {}).await;

    let agent = Arc::new(Agent::new(agent_config("node-1", &addr)).unwrap());
    let runner = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            let _ = agent.run().await;
        })
    };

    wait_until("tunnel for node-1", || relay.has_tunnel("node-1")).await;

    // The store captured the socket address and marked the node online.
    let node = store.get_node("node-1").await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Online);
    assert!(node.address.starts_with("127.0.0.1:"));

    let executor = FleetExecutor::new(
        store.clone() as Arc<dyn FleetStore>,
        Arc::clone(&relay) as Arc<dyn NodeTransport>,
    );
    let request = shell_request("relay-exec-1", "echo hello from the fleet");
    let result = executor.execute(request).await.unwrap();

    assert_eq!(result.summary.total, 1);
    assert_eq!(result.summary.success, 1);
    assert_eq!(result.results[0].output, "hello from the fleet\n");

    agent.stop();
    runner.abort();
}

#[tokio::test]
async fn blocked_command_comes_back_as_blocked_result() {
    let (relay, store, addr) = start_relay(|_| {}).await;

    let agent = Arc::new(Agent::new(agent_config("node-guard", &addr)).unwrap());
    let runner = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            let _ = agent.run().await;
        })
    };
    wait_until("tunnel for node-guard", || relay.has_tunnel("node-guard")).await;

    let executor = FleetExecutor::new(
        store as Arc<dyn FleetStore>,
        relay as Arc<dyn NodeTransport>,
    );
    let request = shell_request("relay-exec-guard", "sudo rm -rf /var/lib/armada");
    let result = executor.execute(request).await.unwrap();

    assert_eq!(result.results[0].status, ResultStatus::Blocked);
    // Blocked counts toward failed in the summary.
    assert_eq!(result.summary.failed, 1);

    agent.stop();
    runner.abort();
}

#[tokio::test]
async fn capacity_refuses_without_evicting() {
    let (relay, _store, addr) = start_relay(|cfg| cfg.max_nodes = 1).await;

    let mut first = raw_connect(&addr).await;
    let ack = register_raw(&mut first, "node-a").await;
    assert_eq!(ack.frame_type, FrameType::Registered);

    let mut second = raw_connect(&addr).await;
    let refusal = register_raw(&mut second, "node-b").await;
    assert_eq!(refusal.frame_type, FrameType::Error);
    assert!(refusal.error.unwrap().contains("try again later"));

    // The existing tunnel was not evicted.
    assert!(relay.has_tunnel("node-a"));
    assert!(!relay.has_tunnel("node-b"));
}

#[tokio::test]
async fn reregistration_replaces_the_stale_tunnel() {
    let (relay, _store, addr) = start_relay(|_| {}).await;

    let mut first = raw_connect(&addr).await;
    assert_eq!(
        register_raw(&mut first, "node-x").await.frame_type,
        FrameType::Registered
    );

    let mut second = raw_connect(&addr).await;
    assert_eq!(
        register_raw(&mut second, "node-x").await.frame_type,
        FrameType::Registered
    );

    // The first connection observes the going-away close.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);

    // Commands now route to the replacement connection.
    let responder = tokio::spawn(async move {
        while let Some(frame) = read_frame(&mut second).await {
            if frame.frame_type == FrameType::Command {
                let request_id = frame.request_id.clone().unwrap();
                let result = armada_protocol::NodeResult {
                    node_id: "node-x".into(),
                    hostname: "host-node-x".into(),
                    output: "pong".into(),
                    exit_code: 0,
                    error: None,
                    duration_ms: 1,
                    status: ResultStatus::Success,
                };
                send_frame(&mut second, &Frame::result("node-x", &request_id, &result)).await;
                break;
            }
        }
    });

    let node = Node::new("node-x", "host-node-x", "127.0.0.1:0");
    let envelope = CommandEnvelope {
        request_id: "replacement-check".into(),
        command: TypedCommand::shell("true"),
        timeout_secs: Some(5),
    };
    let result = relay
        .execute(&node, envelope, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.output, "pong");
    responder.await.unwrap();
}

#[tokio::test]
async fn draining_relay_refuses_new_registrations() {
    let (relay, _store, addr) = start_relay(|_| {}).await;

    let mut keeper = raw_connect(&addr).await;
    assert_eq!(
        register_raw(&mut keeper, "node-keep").await.frame_type,
        FrameType::Registered
    );

    // Drain with an open tunnel: does not complete within the window.
    let drained = relay.begin_drain(Duration::from_millis(300)).await;
    assert!(!drained);
    assert!(relay.is_draining());

    let mut late = raw_connect(&addr).await;
    let refusal = register_raw(&mut late, "node-late").await;
    assert_eq!(refusal.frame_type, FrameType::Error);
    assert!(refusal.error.unwrap().contains("draining"));

    // Closing the last tunnel lets a second drain pass finish.
    drop(keeper);
    assert!(relay.begin_drain(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn mtls_agent_round_trip_and_cn_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::generate("armada-test").unwrap();
    let server = ca
        .issue_server(&["localhost".to_string(), "127.0.0.1".to_string()])
        .unwrap();
    let node_cert = ca.issue_node("node-tls").unwrap();

    let ca_path = dir.path().join("ca.crt");
    std::fs::write(&ca_path, ca.ca_cert_pem()).unwrap();
    server.write_to(dir.path(), "server").unwrap();
    node_cert.write_to(dir.path(), "node-tls").unwrap();

    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(NodeManager::new(store.clone() as Arc<dyn FleetStore>));
    let mut cfg = RelayConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..Default::default()
    };
    cfg.auth.ca_cert_path = Some(ca_path.display().to_string());
    cfg.auth.server_cert_path = Some(dir.path().join("server.crt").display().to_string());
    cfg.auth.server_key_path = Some(dir.path().join("server.key").display().to_string());
    let relay = RelayServer::new(cfg, manager, None).unwrap();
    let addr = relay.start().await.unwrap();

    let mut agent_cfg = AgentConfig::new(
        "node-tls",
        format!("wss://localhost:{}/armada/agent", addr.port()),
    );
    agent_cfg.ca_cert_path = Some(ca_path.display().to_string());
    agent_cfg.client_cert_path = Some(dir.path().join("node-tls.crt").display().to_string());
    agent_cfg.client_key_path = Some(dir.path().join("node-tls.key").display().to_string());
    agent_cfg.heartbeat_secs = 1;

    let agent = Arc::new(Agent::new(agent_cfg.clone()).unwrap());
    let runner = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            let _ = agent.run().await;
        })
    };
    wait_until("mTLS tunnel", || relay.has_tunnel("node-tls")).await;

    let executor = FleetExecutor::new(
        store as Arc<dyn FleetStore>,
        Arc::clone(&relay) as Arc<dyn NodeTransport>,
    );
    let request = shell_request("mtls-exec", "echo over mtls");
    let result = executor.execute(request).await.unwrap();
    assert_eq!(result.summary.success, 1);
    assert_eq!(result.results[0].output, "over mtls\n");

    agent.stop();
    runner.abort();

    // A declared node id that differs from the certificate CN is rejected.
    let mut imposter_cfg = agent_cfg;
    imposter_cfg.node_id = "imposter".into();
    let imposter = Arc::new(Agent::new(imposter_cfg).unwrap());
    let imposter_task = {
        let imposter = Arc::clone(&imposter);
        tokio::spawn(async move {
            let _ = imposter.run().await;
        })
    };
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!relay.has_tunnel("imposter"));
    imposter.stop();
    imposter_task.abort();
}

/// Shell request against every node.
fn shell_request(id: &str, command: &str) -> armada_protocol::ExecRequest {
    armada_protocol::ExecRequest::new(
        id,
        TargetSelector::all(),
        TypedCommand::shell(command),
        "integration",
    )
}
