//! Execution requests, per-node results, and target selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::command::TypedCommand;
use crate::ValidationError;

/// Default fan-out width when the selector does not set one.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
/// Default request timeout when unset.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

/// Filter resolved against the roster at execution time.
///
/// Resolution rules: online and degraded nodes are eligible; other statuses
/// are excluded unless explicitly named by id; label match is conjunctive;
/// results are de-duplicated by id and ordered by `registered_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TargetSelector {
    /// Explicit node ids. Named nodes are eligible regardless of status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<String>,
    /// Group names; a node matches if it belongs to any of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Required label key/value pairs (conjunctive).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Select the whole fleet.
    #[serde(default)]
    pub all: bool,
    /// Fan-out width.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Cap on resolved targets; 0 means unlimited.
    #[serde(default)]
    pub max_nodes: usize,
}

impl TargetSelector {
    pub fn all() -> Self {
        Self {
            all: true,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            ..Default::default()
        }
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node_ids: ids.into_iter().map(Into::into).collect(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            ..Default::default()
        }
    }

    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            ..Default::default()
        }
    }

    pub fn labels<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            ..Default::default()
        }
    }

    /// Whether the selector carries any targeting criterion at all.
    pub fn is_empty(&self) -> bool {
        !self.all && self.node_ids.is_empty() && self.groups.is_empty() && self.labels.is_empty()
    }
}

/// A command submission against the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecRequest {
    /// Caller-supplied id, unique within the store.
    pub id: String,
    pub target: TargetSelector,
    #[serde(flatten)]
    pub command: TypedCommand,
    /// Request timeout in seconds; 0 means the 30s default.
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
    pub requester: String,
    pub created_at: DateTime<Utc>,
}

impl ExecRequest {
    pub fn new(id: impl Into<String>, target: TargetSelector, command: TypedCommand, requester: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target,
            command,
            timeout_secs: 0,
            dry_run: false,
            requester: requester.into(),
            created_at: Utc::now(),
        }
    }

    /// Effective request deadline, defaulting to 30s.
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Boundary validation; failures are rejected without a store write.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("request.id"));
        }
        if self.requester.is_empty() {
            return Err(ValidationError::MissingField("request.requester"));
        }
        self.command.validate()
    }
}

/// Outcome classification for one node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
    Timeout,
    Blocked,
    Skipped,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Success => "success",
            ResultStatus::Failure => "failure",
            ResultStatus::Timeout => "timeout",
            ResultStatus::Blocked => "blocked",
            ResultStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Result of one command on one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeResult {
    pub node_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub output: String,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub status: ResultStatus,
}

impl NodeResult {
    /// A transport-level failure (tunnel missing, tunnel closed, ...).
    pub fn transport_failure(node_id: impl Into<String>, hostname: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            output: String::new(),
            exit_code: -1,
            error: Some(error.into()),
            duration_ms: 0,
            status: ResultStatus::Failure,
        }
    }

    /// A deadline expiry; timed-out commands report exit code -1.
    pub fn timed_out(node_id: impl Into<String>, hostname: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            output: String::new(),
            exit_code: -1,
            error: Some(error.into()),
            duration_ms,
            status: ResultStatus::Timeout,
        }
    }

    /// A dry-run placeholder.
    pub fn skipped(node_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            output: String::new(),
            exit_code: 0,
            error: None,
            duration_ms: 0,
            status: ResultStatus::Skipped,
        }
    }
}

/// Aggregate counters over the per-node results.
///
/// `blocked` results count toward `failed`; the invariant
/// `total == success + failed + timeout + skipped` always holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub timeout: usize,
    pub skipped: usize,
}

impl ExecSummary {
    pub fn from_results(results: &[NodeResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for r in results {
            match r.status {
                ResultStatus::Success => summary.success += 1,
                ResultStatus::Failure | ResultStatus::Blocked => summary.failed += 1,
                ResultStatus::Timeout => summary.timeout += 1,
                ResultStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}

/// Aggregated outcome of one fleet command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecResult {
    pub request_id: String,
    pub results: Vec<NodeResult>,
    pub summary: ExecSummary,
    pub duration_ms: u64,
}
