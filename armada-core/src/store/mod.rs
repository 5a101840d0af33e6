//! Durable persistence for nodes, executions, and distributed locks.
//!
//! One contract, three backends: process-local memory, a single-file sqlite
//! database, and a shared postgres database for multi-instance deployments.
//! Driver-specific types never cross this interface.

mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use armada_protocol::{ExecRequest, ExecResult, Node, NodeStatus};

/// Store errors shared by every backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("duplicate execution id: {0}")]
    DuplicateExecution(String),
    #[error("lock already held: {0}")]
    LockHeld(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = err {
            if db.kind() == sqlx::error::ErrorKind::UniqueViolation {
                return StoreError::DuplicateExecution(db.message().to_string());
            }
        }
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// One persisted execution: the request as submitted plus its aggregated
/// result. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub request: ExecRequest,
    pub result: ExecResult,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(request: ExecRequest, result: ExecResult) -> Self {
        let created_at = request.created_at;
        Self {
            request,
            result,
            created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }
}

/// Filter for execution history queries. Results are ordered by created-at
/// descending.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub requester: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// 0 means unlimited.
    pub limit: usize,
    pub offset: usize,
}

impl ExecutionFilter {
    pub(crate) fn effective_limit(&self) -> i64 {
        if self.limit == 0 {
            i64::MAX
        } else {
            self.limit as i64
        }
    }
}

/// Handle to an acquired distributed lock.
#[async_trait]
pub trait StoreLock: Send + Sync + std::fmt::Debug {
    /// Push the expiry forward by `ttl` from now.
    async fn extend(&self, ttl: Duration) -> Result<(), StoreError>;
    /// Release the lock.
    async fn unlock(self: Box<Self>) -> Result<(), StoreError>;
}

/// Capability set shared by every store backend.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Upsert keyed by node id. All fields overwrite wholesale except
    /// `registered_at`, which is preserved when the node already exists.
    async fn register_node(&self, node: Node) -> Result<(), StoreError>;

    async fn get_node(&self, id: &str) -> Result<Option<Node>, StoreError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// Every node whose labels are a superset of `required`.
    async fn list_nodes_by_labels(
        &self,
        required: &HashMap<String, String>,
    ) -> Result<Vec<Node>, StoreError>;

    async fn update_status(&self, id: &str, status: NodeStatus) -> Result<(), StoreError>;

    async fn update_heartbeat(&self, id: &str, seen: DateTime<Utc>) -> Result<(), StoreError>;

    async fn deregister_node(&self, id: &str) -> Result<(), StoreError>;

    /// Append-only; a duplicate request id fails with `DuplicateExecution`.
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError>;

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Conditional acquisition: succeeds when the key is absent, expired, or
    /// already held by `holder`; fails with `LockHeld` otherwise.
    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Box<dyn StoreLock>, StoreError>;
}
