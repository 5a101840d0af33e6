//! Control-plane scenarios: RBAC gate in front of the executor, label
//! targeting against a mixed roster, and audit/execution records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use armada_core::fleet::{FleetExecutor, NodeManager};
use armada_core::rbac::{AuditDecision, AuditFilter, AuditLogger, RbacEnforcer, Role, User};
use armada_core::relay::{NodeTransport, TransportError};
use armada_core::store::{ExecutionFilter, FleetStore, MemoryStore};
use armada_protocol::{
    CommandEnvelope, ExecRequest, Node, NodeResult, NodeStatus, ResultStatus, TargetSelector,
    TypedCommand,
};

/// Transport that answers every command with a successful echo.
struct EchoTransport;

#[async_trait]
impl NodeTransport for EchoTransport {
    async fn execute(
        &self,
        node: &Node,
        envelope: CommandEnvelope,
        _timeout: Duration,
    ) -> Result<NodeResult, TransportError> {
        let output = match &envelope.command {
            TypedCommand::Shell(shell) => shell.command.clone(),
            other => other.kind().to_string(),
        };
        Ok(NodeResult {
            node_id: node.id.clone(),
            hostname: node.hostname.clone(),
            output,
            exit_code: 0,
            error: None,
            duration_ms: 1,
            status: ResultStatus::Success,
        })
    }
}

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn seed_roster(store: &Arc<MemoryStore>) {
    let mut n1 = Node::new("n1", "host-n1", "10.1.0.1:443");
    n1.labels = labels(&[("env", "prod"), ("role", "web")]);
    let mut n2 = Node::new("n2", "host-n2", "10.1.0.2:443");
    n2.labels = labels(&[("env", "prod"), ("role", "api")]);
    let mut n3 = Node::new("n3", "host-n3", "10.1.0.3:443");
    n3.labels = labels(&[("env", "prod"), ("role", "web")]);
    n3.status = NodeStatus::Offline;
    for node in [n1, n2, n3] {
        store.register_node(node).await.unwrap();
    }
}

#[tokio::test]
async fn label_targeting_reaches_only_eligible_matches() {
    let store = Arc::new(MemoryStore::new());
    seed_roster(&store).await;
    let executor = FleetExecutor::new(store.clone(), Arc::new(EchoTransport));

    let request = ExecRequest::new(
        "exec-labels",
        TargetSelector::labels([("env", "prod"), ("role", "web")]),
        TypedCommand::shell("uptime"),
        "ops",
    );
    let result = executor.execute(request).await.unwrap();

    // n3 matches the labels but is offline; only n1 runs.
    assert_eq!(result.summary.total, 1);
    assert_eq!(result.results[0].node_id, "n1");
}

#[tokio::test]
async fn rbac_gate_denies_before_any_execution() {
    let store = Arc::new(MemoryStore::new());
    seed_roster(&store).await;

    let enforcer = RbacEnforcer::new(Arc::new(AuditLogger::default()));
    enforcer.upsert_role(Role::new("viewer", ["fleet:read"])).await;
    enforcer
        .upsert_role(Role::new("operator", ["fleet:exec", "fleet:deploy"]))
        .await;
    enforcer.upsert_user(User::new("viewer-1").with_role("viewer")).await;
    enforcer.upsert_user(User::new("op-1").with_role("operator")).await;

    let executor = FleetExecutor::new(store.clone(), Arc::new(EchoTransport));

    // Denied caller: nothing is executed or recorded.
    assert!(!enforcer.check("viewer-1", "fleet:exec", "any").await);
    let denied = enforcer
        .audit_log()
        .query(&AuditFilter {
            user_id: Some("viewer-1".into()),
            decision: Some(AuditDecision::Deny),
            ..Default::default()
        })
        .await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].reason, "no matching permission");

    // Allowed caller proceeds through the executor.
    assert!(enforcer.check("op-1", "fleet:exec", "any").await);
    let request = ExecRequest::new(
        "exec-gated",
        TargetSelector::all(),
        TypedCommand::shell("uptime"),
        "op-1",
    );
    let result = executor.execute(request).await.unwrap();
    assert_eq!(result.summary.total, 2); // n1 + n2 (n3 offline)
    assert_eq!(result.summary.success, 2);

    // Exactly one execution record with the request id.
    let records = store
        .list_executions(&ExecutionFilter {
            requester: Some("op-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id(), "exec-gated");
}

#[tokio::test]
async fn drained_nodes_leave_targeting() {
    let store = Arc::new(MemoryStore::new());
    seed_roster(&store).await;
    let manager = NodeManager::new(store.clone() as Arc<dyn FleetStore>);
    manager.drain("n2").await.unwrap();

    let executor = FleetExecutor::new(store, Arc::new(EchoTransport));
    let request = ExecRequest::new(
        "exec-drain",
        TargetSelector::all(),
        TypedCommand::shell("uptime"),
        "ops",
    );
    let result = executor.execute(request).await.unwrap();
    assert_eq!(result.summary.total, 1);
    assert_eq!(result.results[0].node_id, "n1");
}
