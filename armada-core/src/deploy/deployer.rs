//! Strategy execution engine: batching, health checks, rollback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use armada_protocol::{
    ExecRequest, ExecSummary, Node, ShellCommand, TargetSelector, TypedCommand, ValidationError,
};

use super::{BatchResult, DeployResult, DeploySpec, DeployState, DeployStrategy};
use crate::fleet::{resolve_targets, ExecError, FleetExecutor};
use crate::store::{FleetStore, StoreError, StoreLock};

/// Lock TTL for per-service serialization; extended while batches run.
const SERVICE_LOCK_TTL: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("invalid deploy spec: {0}")]
    Validation(String),
    #[error("no targets resolved for service {0}")]
    NoTargets(String),
    #[error("deployment for service {0} already in progress")]
    ServiceLocked(String),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ValidationError> for DeployError {
    fn from(err: ValidationError) -> Self {
        DeployError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ActiveDeployment {
    pub deploy_id: String,
    pub service: String,
    pub version: String,
    pub state: DeployState,
}

/// Orchestrates rolling / canary / blue-green / serial / all-at-once
/// rollouts through the fleet executor. Many deployments may run
/// concurrently; deployments of one service serialize on a store lock.
pub struct Deployer {
    executor: Arc<FleetExecutor>,
    store: Arc<dyn FleetStore>,
    active: Mutex<HashMap<String, ActiveDeployment>>,
}

impl Deployer {
    pub fn new(executor: Arc<FleetExecutor>, store: Arc<dyn FleetStore>) -> Self {
        Self {
            executor,
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_deployments(&self) -> Vec<ActiveDeployment> {
        self.active.lock().await.values().cloned().collect()
    }

    async fn set_state(&self, deploy_id: &str, state: DeployState) {
        if let Some(entry) = self.active.lock().await.get_mut(deploy_id) {
            entry.state = state;
        }
    }

    /// Run one deployment to completion.
    pub async fn run(&self, spec: DeploySpec) -> Result<DeployResult, DeployError> {
        if spec.service.is_empty() {
            return Err(DeployError::Validation("service is required".into()));
        }
        if spec.version.is_empty() {
            return Err(DeployError::Validation("version is required".into()));
        }
        if spec.deploy_command.trim().is_empty() {
            return Err(DeployError::Validation("deploy_command is required".into()));
        }

        let roster = self.store.list_nodes().await?;
        let targets = resolve_targets(&spec.target, &roster);
        if targets.is_empty() {
            return Err(DeployError::NoTargets(spec.service.clone()));
        }

        let deploy_id = format!("deploy-{}", Uuid::new_v4());
        let lock = match self
            .store
            .acquire_lock(
                &format!("deploy:{}", spec.service),
                &deploy_id,
                SERVICE_LOCK_TTL,
            )
            .await
        {
            Ok(lock) => lock,
            Err(StoreError::LockHeld(_)) => {
                return Err(DeployError::ServiceLocked(spec.service.clone()));
            }
            Err(other) => return Err(other.into()),
        };

        self.active.lock().await.insert(
            deploy_id.clone(),
            ActiveDeployment {
                deploy_id: deploy_id.clone(),
                service: spec.service.clone(),
                version: spec.version.clone(),
                state: DeployState::Pending,
            },
        );
        info!(
            deploy_id = %deploy_id,
            service = %spec.service,
            version = %spec.version,
            strategy = %spec.strategy,
            targets = targets.len(),
            "starting deployment"
        );

        let started = Instant::now();
        let outcome = self.drive(&deploy_id, &spec, &targets).await;
        self.active.lock().await.remove(&deploy_id);
        if let Err(e) = lock.unlock().await {
            warn!(deploy_id = %deploy_id, "failed to release service lock: {}", e);
        }

        outcome.map(|(state, batches, rolled_back, error)| DeployResult {
            deploy_id,
            service: spec.service,
            version: spec.version,
            strategy: spec.strategy,
            state,
            batches,
            rolled_back,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn drive(
        &self,
        deploy_id: &str,
        spec: &DeploySpec,
        targets: &[Node],
    ) -> Result<(DeployState, Vec<BatchResult>, bool, Option<String>), DeployError> {
        let batches = plan_batches(spec, targets);
        let total_batches = batches.len();
        let mut executed: Vec<BatchResult> = Vec::new();

        self.set_state(deploy_id, DeployState::Running).await;
        for (index, batch) in batches.iter().enumerate() {
            let is_last = index + 1 == total_batches;

            let summary = match self
                .dispatch(deploy_id, spec, batch, &spec.deploy_command, index)
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    let error = format!("batch {} dispatch failed: {}", index + 1, e);
                    executed.push(BatchResult {
                        nodes: batch.iter().map(|n| n.id.clone()).collect(),
                        summary: ExecSummary::default(),
                        healthy: None,
                    });
                    let rolled_back = self.maybe_rollback(deploy_id, spec, targets).await;
                    return Ok((DeployState::Failed, executed, rolled_back, Some(error)));
                }
            };

            let batch_ok = summary.failed == 0 && summary.timeout == 0;
            let mut result = BatchResult {
                nodes: batch.iter().map(|n| n.id.clone()).collect(),
                summary,
                healthy: None,
            };

            if !batch_ok {
                executed.push(result);
                let error = format!("batch {} failed", index + 1);
                error!(deploy_id = %deploy_id, "{}", error);
                let rolled_back = self.maybe_rollback(deploy_id, spec, targets).await;
                return Ok((DeployState::Failed, executed, rolled_back, Some(error)));
            }

            // Health checks: between stages for rolling/canary (excluding the
            // last), after the single batch for blue-green, never for
            // all-at-once or serial.
            let wants_health = match spec.strategy {
                DeployStrategy::Rolling | DeployStrategy::Canary => !is_last,
                DeployStrategy::BlueGreen => true,
                DeployStrategy::AllAtOnce | DeployStrategy::Serial => false,
            };
            if wants_health && spec.health_check_url.is_some() {
                self.set_state(deploy_id, DeployState::HealthCheck).await;
                let healthy = self.health_check(deploy_id, spec, batch, index).await;
                result.healthy = Some(healthy);
                if !healthy {
                    executed.push(result);
                    let error = format!("health check failed after batch {}", index + 1);
                    error!(deploy_id = %deploy_id, "{}", error);
                    let rolled_back = self.maybe_rollback(deploy_id, spec, targets).await;
                    return Ok((DeployState::Failed, executed, rolled_back, Some(error)));
                }
                self.set_state(deploy_id, DeployState::Running).await;
            }

            executed.push(result);

            if spec.strategy == DeployStrategy::Serial && !is_last && spec.serial_delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(spec.serial_delay_secs)).await;
            }
        }

        info!(deploy_id = %deploy_id, "deployment complete");
        Ok((DeployState::Complete, executed, false, None))
    }

    /// Execute a command on a batch through the executor.
    async fn dispatch(
        &self,
        deploy_id: &str,
        spec: &DeploySpec,
        batch: &[Node],
        command: &str,
        index: usize,
    ) -> Result<ExecSummary, ExecError> {
        let mut selector = TargetSelector::ids(batch.iter().map(|n| n.id.clone()));
        selector.max_concurrency = batch.len().max(1);

        let mut request = ExecRequest::new(
            format!("{}-batch-{}", deploy_id, index + 1),
            selector,
            deploy_shell(command, spec),
            &spec.requester,
        );
        request.timeout_secs = spec.command_timeout_secs;

        let result = self.executor.execute(request).await?;
        Ok(result.summary)
    }

    /// HTTP-probe shell command against the just-deployed batch.
    async fn health_check(
        &self,
        deploy_id: &str,
        spec: &DeploySpec,
        batch: &[Node],
        index: usize,
    ) -> bool {
        let Some(url) = &spec.health_check_url else {
            return true;
        };
        let probe = format!("curl -fsS --max-time {} {}", spec.health_timeout_secs, url);

        let mut selector = TargetSelector::ids(batch.iter().map(|n| n.id.clone()));
        selector.max_concurrency = batch.len().max(1);
        let mut request = ExecRequest::new(
            format!("{}-health-{}", deploy_id, index + 1),
            selector,
            TypedCommand::Shell(ShellCommand {
                command: probe,
                ..Default::default()
            }),
            &spec.requester,
        );
        request.timeout_secs = spec.health_timeout_secs;

        match self.executor.execute(request).await {
            Ok(result) => result.summary.failed == 0 && result.summary.timeout == 0,
            Err(e) => {
                warn!(deploy_id = %deploy_id, "health check dispatch failed: {}", e);
                false
            }
        }
    }

    /// Rollback against the entire original target set. Failures are logged
    /// and surfaced but never retried, and never mask the original failure.
    async fn maybe_rollback(&self, deploy_id: &str, spec: &DeploySpec, targets: &[Node]) -> bool {
        if !spec.rollback_on_fail {
            return false;
        }
        let Some(rollback_command) = &spec.rollback_command else {
            warn!(deploy_id = %deploy_id, "rollback requested but no rollback_command configured");
            return false;
        };

        info!(
            deploy_id = %deploy_id,
            nodes = targets.len(),
            "rolling back deployment"
        );
        let mut selector = TargetSelector::ids(targets.iter().map(|n| n.id.clone()));
        selector.max_concurrency = targets.len().max(1);
        let mut request = ExecRequest::new(
            format!("{}-rollback", deploy_id),
            selector,
            deploy_shell(rollback_command, spec),
            &spec.requester,
        );
        request.timeout_secs = spec.command_timeout_secs;

        match self.executor.execute(request).await {
            Ok(result) if result.summary.failed == 0 && result.summary.timeout == 0 => true,
            Ok(result) => {
                error!(
                    deploy_id = %deploy_id,
                    failed = result.summary.failed,
                    timeout = result.summary.timeout,
                    "rollback completed with failures"
                );
                true
            }
            Err(e) => {
                error!(deploy_id = %deploy_id, "rollback dispatch failed: {}", e);
                true
            }
        }
    }
}

/// Service and version travel as environment variables, never interpolated
/// into the command string.
fn deploy_shell(command: &str, spec: &DeploySpec) -> TypedCommand {
    let mut env = HashMap::new();
    env.insert("DEPLOY_SERVICE".to_string(), spec.service.clone());
    env.insert("DEPLOY_VERSION".to_string(), spec.version.clone());
    TypedCommand::Shell(ShellCommand {
        command: command.to_string(),
        env,
        timeout_sec: Some(spec.command_timeout_secs),
        ..Default::default()
    })
}

/// Split targets into ordered batches per strategy.
fn plan_batches(spec: &DeploySpec, targets: &[Node]) -> Vec<Vec<Node>> {
    match spec.strategy {
        DeployStrategy::Rolling => targets
            .chunks(spec.max_unavailable.max(1))
            .map(|c| c.to_vec())
            .collect(),
        DeployStrategy::Serial => targets.chunks(1).map(|c| c.to_vec()).collect(),
        DeployStrategy::BlueGreen | DeployStrategy::AllAtOnce => vec![targets.to_vec()],
        DeployStrategy::Canary => {
            let total = targets.len();
            let mut batches = Vec::new();
            let mut covered = 0usize;
            for percent in &spec.canary_percents {
                let count = ((total * *percent as usize) / 100).max(1).min(total);
                if count > covered {
                    batches.push(targets[covered..count].to_vec());
                    covered = count;
                }
            }
            if covered < total {
                batches.push(targets[covered..].to_vec());
            }
            batches
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{NodeTransport, TransportError};
    use crate::store::MemoryStore;
    use armada_protocol::{CommandEnvelope, NodeResult, ResultStatus};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Transport scripted per (node, command-kind) with call recording.
    struct ScriptedTransport {
        /// Node ids whose deploy command exits non-zero.
        failing_deploys: Vec<String>,
        /// Node ids whose health probe exits non-zero.
        failing_health: Vec<String>,
        calls: StdMutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                failing_deploys: Vec::new(),
                failing_health: Vec::new(),
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn calls_matching(&self, needle: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, cmd)| cmd.contains(needle))
                .map(|(node, _)| node.clone())
                .collect()
        }
    }

    #[async_trait]
    impl NodeTransport for ScriptedTransport {
        async fn execute(
            &self,
            node: &Node,
            envelope: CommandEnvelope,
            _timeout: Duration,
        ) -> Result<NodeResult, TransportError> {
            let TypedCommand::Shell(shell) = &envelope.command else {
                return Err(TransportError::Other("unexpected command".into()));
            };
            self.calls
                .lock()
                .unwrap()
                .push((node.id.clone(), shell.command.clone()));

            let is_health = shell.command.starts_with("curl ");
            let failing = if is_health {
                self.failing_health.contains(&node.id)
            } else {
                self.failing_deploys.contains(&node.id)
            };
            let exit_code = if failing { 1 } else { 0 };
            Ok(NodeResult {
                node_id: node.id.clone(),
                hostname: node.hostname.clone(),
                output: String::new(),
                exit_code,
                error: if failing { Some("exit 1".into()) } else { None },
                duration_ms: 1,
                status: if failing {
                    ResultStatus::Failure
                } else {
                    ResultStatus::Success
                },
            })
        }
    }

    async fn fleet(ids: &[&str], transport: Arc<ScriptedTransport>) -> (Deployer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for (i, id) in ids.iter().enumerate() {
            let mut node = Node::new(*id, format!("host-{}", id), "10.0.0.1:1");
            node.registered_at = chrono::Utc::now() + chrono::Duration::seconds(i as i64);
            store.register_node(node).await.unwrap();
        }
        let executor = Arc::new(FleetExecutor::new(store.clone(), transport));
        (Deployer::new(executor, store.clone()), store)
    }

    fn spec(strategy: DeployStrategy) -> DeploySpec {
        let mut spec = DeploySpec::new(
            "web",
            "2.4.1",
            strategy,
            TargetSelector::all(),
            "/opt/armada/deploy.sh",
            "ops",
        );
        spec.serial_delay_secs = 0;
        spec
    }

    #[test]
    fn rolling_batch_arithmetic() {
        let targets: Vec<Node> = (0..7)
            .map(|i| Node::new(format!("n{}", i), "h", "a"))
            .collect();
        let mut s = spec(DeployStrategy::Rolling);
        s.max_unavailable = 3;
        let batches = plan_batches(&s, &targets);

        // ceil(7 / 3) batches, sizes sum to 7, no node in two batches.
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 7);
        let mut seen = std::collections::HashSet::new();
        for batch in &batches {
            for node in batch {
                assert!(seen.insert(node.id.clone()));
            }
        }
    }

    #[test]
    fn canary_fractions_floor_at_one_node() {
        let targets: Vec<Node> = (0..4)
            .map(|i| Node::new(format!("n{}", i), "h", "a"))
            .collect();
        let s = spec(DeployStrategy::Canary);
        let batches = plan_batches(&s, &targets);
        // 5% of 4 floors to 1 (floor of one node); 25% stays at 1 (no new
        // nodes); 100% covers the remaining 3.
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[tokio::test]
    async fn rolling_abort_rolls_back_all_original_targets() {
        let mut transport = ScriptedTransport::new();
        transport.failing_deploys = vec!["n3".to_string()];
        let transport = Arc::new(transport);
        let (deployer, _store) = fleet(&["n1", "n2", "n3", "n4"], transport.clone()).await;

        let mut s = spec(DeployStrategy::Rolling);
        s.max_unavailable = 2;
        s.health_check_url = Some("http://localhost:8080/health".into());
        s.rollback_on_fail = true;
        s.rollback_command = Some("/opt/armada/rollback.sh".into());

        let result = deployer.run(s).await.unwrap();
        assert_eq!(result.state, DeployState::Failed);
        assert!(result.rolled_back);
        assert_eq!(result.batches.len(), 2);
        assert!(result.error.is_some());

        // Rollback was issued against all four original targets.
        let mut rolled = transport.calls_matching("rollback.sh");
        rolled.sort();
        assert_eq!(rolled, vec!["n1", "n2", "n3", "n4"]);
    }

    #[tokio::test]
    async fn rolling_success_runs_health_between_batches_only() {
        let transport = Arc::new(ScriptedTransport::new());
        let (deployer, _store) = fleet(&["n1", "n2", "n3", "n4"], transport.clone()).await;

        let mut s = spec(DeployStrategy::Rolling);
        s.max_unavailable = 2;
        s.health_check_url = Some("http://localhost:8080/health".into());

        let result = deployer.run(s).await.unwrap();
        assert_eq!(result.state, DeployState::Complete);
        assert!(!result.rolled_back);
        assert_eq!(result.batches.len(), 2);
        // Health probed after batch 1 but not after the final batch.
        assert_eq!(result.batches[0].healthy, Some(true));
        assert_eq!(result.batches[1].healthy, None);
        assert_eq!(transport.calls_matching("curl ").len(), 2);
    }

    #[tokio::test]
    async fn blue_green_health_failure_triggers_rollback() {
        let mut transport = ScriptedTransport::new();
        transport.failing_health = vec!["n2".to_string()];
        let transport = Arc::new(transport);
        let (deployer, _store) = fleet(&["n1", "n2"], transport.clone()).await;

        let mut s = spec(DeployStrategy::BlueGreen);
        s.health_check_url = Some("http://localhost:8080/health".into());
        s.rollback_on_fail = true;
        s.rollback_command = Some("/opt/armada/rollback.sh".into());

        let result = deployer.run(s).await.unwrap();
        assert_eq!(result.state, DeployState::Failed);
        assert!(result.rolled_back);
        assert_eq!(result.batches.len(), 1);
        assert_eq!(result.batches[0].healthy, Some(false));
    }

    #[tokio::test]
    async fn all_at_once_skips_health_checks() {
        let transport = Arc::new(ScriptedTransport::new());
        let (deployer, _store) = fleet(&["n1", "n2"], transport.clone()).await;

        let mut s = spec(DeployStrategy::AllAtOnce);
        s.health_check_url = Some("http://localhost:8080/health".into());

        let result = deployer.run(s).await.unwrap();
        assert_eq!(result.state, DeployState::Complete);
        assert_eq!(result.batches.len(), 1);
        assert!(transport.calls_matching("curl ").is_empty());
    }

    #[tokio::test]
    async fn serial_aborts_on_first_failure() {
        let mut transport = ScriptedTransport::new();
        transport.failing_deploys = vec!["n2".to_string()];
        let transport = Arc::new(transport);
        let (deployer, _store) = fleet(&["n1", "n2", "n3"], transport.clone()).await;

        let result = deployer.run(spec(DeployStrategy::Serial)).await.unwrap();
        assert_eq!(result.state, DeployState::Failed);
        // n1 deployed, n2 failed, n3 never attempted.
        assert_eq!(result.batches.len(), 2);
        let deployed = transport.calls_matching("deploy.sh");
        assert!(!deployed.contains(&"n3".to_string()));
    }

    #[tokio::test]
    async fn env_injection_instead_of_interpolation() {
        let transport = Arc::new(ScriptedTransport::new());
        let (deployer, store) = fleet(&["n1"], transport.clone()).await;

        let result = deployer.run(spec(DeployStrategy::AllAtOnce)).await.unwrap();
        assert_eq!(result.state, DeployState::Complete);

        // The deploy command text never embeds service or version.
        let calls = transport.calls.lock().unwrap();
        assert!(calls.iter().all(|(_, cmd)| !cmd.contains("2.4.1")));
        drop(calls);

        // The recorded execution carries them as env vars.
        let record = store
            .get_execution(&format!("{}-batch-1", result.deploy_id))
            .await
            .unwrap()
            .unwrap();
        let TypedCommand::Shell(shell) = &record.request.command else {
            panic!("expected shell command");
        };
        assert_eq!(shell.env.get("DEPLOY_SERVICE").map(String::as_str), Some("web"));
        assert_eq!(shell.env.get("DEPLOY_VERSION").map(String::as_str), Some("2.4.1"));
    }

    #[tokio::test]
    async fn empty_resolution_is_rejected() {
        let transport = Arc::new(ScriptedTransport::new());
        let (deployer, _store) = fleet(&[], transport).await;
        let err = deployer.run(spec(DeployStrategy::Rolling)).await.unwrap_err();
        assert!(matches!(err, DeployError::NoTargets(_)));
    }
}
