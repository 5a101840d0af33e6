//! Deployment strategy orchestration across targeted nodes.

mod deployer;

pub use deployer::{DeployError, Deployer};

use serde::{Deserialize, Serialize};

use armada_protocol::{ExecSummary, TargetSelector};

/// Rollout strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStrategy {
    Rolling,
    Canary,
    BlueGreen,
    AllAtOnce,
    Serial,
}

impl std::fmt::Display for DeployStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeployStrategy::Rolling => "rolling",
            DeployStrategy::Canary => "canary",
            DeployStrategy::BlueGreen => "blue_green",
            DeployStrategy::AllAtOnce => "all_at_once",
            DeployStrategy::Serial => "serial",
        };
        write!(f, "{}", s)
    }
}

fn default_health_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    300
}

fn default_max_unavailable() -> usize {
    1
}

fn default_canary_percents() -> Vec<u8> {
    vec![5, 25, 100]
}

fn default_serial_delay() -> u64 {
    2
}

/// One deployment request.
///
/// Service and version reach the deploy command as `DEPLOY_SERVICE` /
/// `DEPLOY_VERSION` environment variables, never by string interpolation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploySpec {
    pub service: String,
    pub version: String,
    pub strategy: DeployStrategy,
    pub target: TargetSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default)]
    pub rollback_on_fail: bool,
    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: usize,
    #[serde(default = "default_canary_percents")]
    pub canary_percents: Vec<u8>,
    #[serde(default = "default_serial_delay")]
    pub serial_delay_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    pub deploy_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_command: Option<String>,
    pub requester: String,
}

impl DeploySpec {
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        strategy: DeployStrategy,
        target: TargetSelector,
        deploy_command: impl Into<String>,
        requester: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            strategy,
            target,
            health_check_url: None,
            health_timeout_secs: default_health_timeout(),
            rollback_on_fail: false,
            max_unavailable: default_max_unavailable(),
            canary_percents: default_canary_percents(),
            serial_delay_secs: default_serial_delay(),
            command_timeout_secs: default_command_timeout(),
            deploy_command: deploy_command.into(),
            rollback_command: None,
            requester: requester.into(),
        }
    }
}

/// Deployment lifecycle. `pending → running → [health_check] →
/// (complete | rollback → failed | failed)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Pending,
    Running,
    HealthCheck,
    Complete,
    Failed,
}

/// Outcome of one dispatched batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchResult {
    pub nodes: Vec<String>,
    pub summary: ExecSummary,
    /// None when no health check ran for this batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
}

/// Final deployment report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployResult {
    pub deploy_id: String,
    pub service: String,
    pub version: String,
    pub strategy: DeployStrategy,
    pub state: DeployState,
    pub batches: Vec<BatchResult>,
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}
