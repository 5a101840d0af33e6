//! Concurrency-limited command fan-out with per-request cancellation.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use armada_protocol::{
    CommandEnvelope, ExecRequest, ExecResult, ExecSummary, Node, NodeResult, ResultStatus,
    TypedCommand, ValidationError,
};

use crate::relay::{NodeTransport, TransportError};
use crate::store::{ExecutionRecord, FleetStore, StoreError};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("no targets resolved for request {0}")]
    NoTargets(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves targets, fans the command out under a semaphore, aggregates the
/// per-node results and persists the execution record.
pub struct FleetExecutor {
    store: Arc<dyn FleetStore>,
    transport: Arc<dyn NodeTransport>,
    active: DashMap<String, watch::Sender<bool>>,
}

impl FleetExecutor {
    pub fn new(store: Arc<dyn FleetStore>, transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            store,
            transport,
            active: DashMap::new(),
        }
    }

    /// Submit one command against the fleet. Results come back in completion
    /// order; callers that need a stable ordering sort by node id.
    pub async fn execute(&self, request: ExecRequest) -> Result<ExecResult, ExecError> {
        request.validate()?;

        let roster = self.store.list_nodes().await?;
        let targets = super::resolve_targets(&request.target, &roster);
        if targets.is_empty() {
            return Err(ExecError::NoTargets(request.id.clone()));
        }

        info!(
            request_id = %request.id,
            targets = targets.len(),
            command = request.command.kind(),
            dry_run = request.dry_run,
            "executing fleet command"
        );

        let started = Instant::now();
        let deadline = effective_deadline(&request);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.insert(request.id.clone(), cancel_tx);

        let semaphore = Arc::new(Semaphore::new(request.target.max_concurrency.max(1)));
        let (result_tx, mut result_rx) = mpsc::channel::<NodeResult>(targets.len());

        for node in &targets {
            let node = node.clone();
            let semaphore = Arc::clone(&semaphore);
            let transport = Arc::clone(&self.transport);
            let result_tx = result_tx.clone();
            let cancel_rx = cancel_rx.clone();
            let envelope = CommandEnvelope {
                request_id: request.id.clone(),
                command: request.command.clone(),
                timeout_secs: Some(deadline.as_secs()),
            };
            let dry_run = request.dry_run;

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = if dry_run {
                    NodeResult::skipped(&node.id, &node.hostname)
                } else {
                    dispatch_one(transport.as_ref(), &node, envelope, deadline, cancel_rx).await
                };
                let _ = result_tx.send(result).await;
            });
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(targets.len());
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        self.active.remove(&request.id);

        let summary = ExecSummary::from_results(&results);
        let exec_result = ExecResult {
            request_id: request.id.clone(),
            results,
            summary,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let record = ExecutionRecord::new(request, exec_result.clone());
        self.store.record_execution(&record).await?;

        Ok(exec_result)
    }

    /// Abort an in-flight request; unfinished workers report
    /// `status=timeout` with error "execution cancelled".
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.active.get(request_id) {
            Some(sender) => {
                info!(request_id = %request_id, "cancelling execution");
                sender.send(true).is_ok()
            }
            None => false,
        }
    }
}

/// The effective deadline is the earlier of the request timeout and the
/// per-command timeout.
fn effective_deadline(request: &ExecRequest) -> Duration {
    let request_timeout = request.effective_timeout();
    match &request.command {
        TypedCommand::Shell(shell) => match shell.timeout_sec {
            Some(secs) if secs > 0 => request_timeout.min(Duration::from_secs(secs)),
            _ => request_timeout,
        },
        _ => request_timeout,
    }
}

async fn dispatch_one(
    transport: &dyn NodeTransport,
    node: &Node,
    envelope: CommandEnvelope,
    deadline: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) -> NodeResult {
    let started = Instant::now();
    tokio::select! {
        outcome = transport.execute(node, envelope, deadline) => match outcome {
            Ok(result) => normalize(result),
            Err(TransportError::Timeout) => NodeResult::timed_out(
                &node.id,
                &node.hostname,
                "command deadline exceeded",
                started.elapsed().as_millis() as u64,
            ),
            Err(err) => {
                warn!(node_id = %node.id, "transport failure: {}", err);
                NodeResult::transport_failure(&node.id, &node.hostname, err.to_string())
            }
        },
        _ = cancelled(&mut cancel_rx) => {
            debug!(node_id = %node.id, "worker observed cancellation");
            NodeResult::timed_out(
                &node.id,
                &node.hostname,
                "execution cancelled",
                started.elapsed().as_millis() as u64,
            )
        }
    }
}

/// Resolves only when the cancel flag flips to true.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: never resolve.
            std::future::pending::<()>().await;
        }
    }
}

/// An agent result claiming success with a non-zero exit code and no error
/// is still a failure from the control plane's point of view.
fn normalize(mut result: NodeResult) -> NodeResult {
    if result.status == ResultStatus::Success && result.exit_code != 0 {
        result.status = ResultStatus::Failure;
        if result.error.is_none() {
            result.error = Some(format!("exit code {}", result.exit_code));
        }
    }
    result
}
