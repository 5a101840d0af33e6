//! Process-local in-memory store.
//!
//! The lock implementation is a no-op placeholder: a single process is the
//! only writer, so the serialization the Deployer needs is already given.
//! Multi-instance deployments must use the postgres store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use armada_protocol::{Node, NodeStatus};

use super::{ExecutionFilter, ExecutionRecord, FleetStore, StoreError, StoreLock};

#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<String, Node>>,
    executions: RwLock<Vec<ExecutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
struct NoopLock;

#[async_trait]
impl StoreLock for NoopLock {
    async fn extend(&self, _ttl: Duration) -> Result<(), StoreError> {
        Ok(())
    }

    async fn unlock(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn register_node(&self, mut node: Node) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(&node.id) {
            node.registered_at = existing.registered_at;
        }
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>, StoreError> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn list_nodes_by_labels(
        &self,
        required: &HashMap<String, String>,
    ) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.matches_labels(required))
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: &str, status: NodeStatus) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))?;
        node.status = status;
        Ok(())
    }

    async fn update_heartbeat(&self, id: &str, seen: DateTime<Utc>) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))?;
        if seen > node.last_seen {
            node.last_seen = seen;
        }
        Ok(())
    }

    async fn deregister_node(&self, id: &str) -> Result<(), StoreError> {
        self.nodes.write().await.remove(id);
        Ok(())
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if executions.iter().any(|r| r.id() == record.id()) {
            return Err(StoreError::DuplicateExecution(record.id().to_string()));
        }
        executions.push(record.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .iter()
            .find(|r| r.id() == id)
            .cloned())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let executions = self.executions.read().await;
        let mut matched: Vec<ExecutionRecord> = executions
            .iter()
            .filter(|r| {
                filter
                    .requester
                    .as_ref()
                    .map(|req| &r.request.requester == req)
                    .unwrap_or(true)
                    && filter.since.map(|since| r.created_at >= since).unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let limit = filter.effective_limit() as usize;
        Ok(matched
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .collect())
    }

    async fn acquire_lock(
        &self,
        _key: &str,
        _holder: &str,
        _ttl: Duration,
    ) -> Result<Box<dyn StoreLock>, StoreError> {
        Ok(Box::new(NoopLock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_protocol::{ExecResult, ExecRequest, ExecSummary, TargetSelector, TypedCommand};
    use chrono::Duration as ChronoDuration;

    fn node(id: &str) -> Node {
        Node::new(id, format!("host-{}", id), "10.0.0.1:5000")
    }

    fn record(id: &str, requester: &str, created_at: DateTime<Utc>) -> ExecutionRecord {
        let mut request = ExecRequest::new(
            id,
            TargetSelector::all(),
            TypedCommand::shell("uptime"),
            requester,
        );
        request.created_at = created_at;
        let result = ExecResult {
            request_id: id.to_string(),
            results: vec![],
            summary: ExecSummary::default(),
            duration_ms: 0,
        };
        ExecutionRecord::new(request, result)
    }

    #[tokio::test]
    async fn register_is_idempotent_and_preserves_registered_at() {
        let store = MemoryStore::new();
        let first = node("n1");
        let original_registration = first.registered_at;
        store.register_node(first).await.unwrap();

        let mut second = node("n1");
        second.registered_at = Utc::now() + ChronoDuration::hours(1);
        second.hostname = "renamed".into();
        store.register_node(second).await.unwrap();

        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].hostname, "renamed");
        assert_eq!(nodes[0].registered_at, original_registration);
    }

    #[tokio::test]
    async fn label_listing_returns_exact_superset_matches() {
        let store = MemoryStore::new();
        let mut a = node("a");
        a.labels = [("env".to_string(), "prod".to_string()), ("role".to_string(), "web".to_string())]
            .into_iter()
            .collect();
        let mut b = node("b");
        b.labels = [("env".to_string(), "prod".to_string())].into_iter().collect();
        store.register_node(a).await.unwrap();
        store.register_node(b).await.unwrap();

        let required = [("env".to_string(), "prod".to_string()), ("role".to_string(), "web".to_string())]
            .into_iter()
            .collect();
        let matched = store.list_nodes_by_labels(&required).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "a");
    }

    #[tokio::test]
    async fn heartbeat_is_monotonic() {
        let store = MemoryStore::new();
        store.register_node(node("n1")).await.unwrap();
        let later = Utc::now() + ChronoDuration::seconds(10);
        store.update_heartbeat("n1", later).await.unwrap();
        // An older timestamp does not move last_seen backwards.
        store
            .update_heartbeat("n1", later - ChronoDuration::seconds(5))
            .await
            .unwrap();
        let n = store.get_node("n1").await.unwrap().unwrap();
        assert_eq!(n.last_seen, later);
    }

    #[tokio::test]
    async fn execution_record_round_trips_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let rec = record("req-1", "ops", Utc::now());
        store.record_execution(&rec).await.unwrap();

        let loaded = store.get_execution("req-1").await.unwrap().unwrap();
        assert_eq!(loaded, rec);

        let err = store.record_execution(&rec).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateExecution(_)));
    }

    #[tokio::test]
    async fn execution_listing_filters_and_orders_descending() {
        let store = MemoryStore::new();
        let base = Utc::now();
        store
            .record_execution(&record("r1", "alice", base - ChronoDuration::minutes(3)))
            .await
            .unwrap();
        store
            .record_execution(&record("r2", "bob", base - ChronoDuration::minutes(2)))
            .await
            .unwrap();
        store
            .record_execution(&record("r3", "alice", base - ChronoDuration::minutes(1)))
            .await
            .unwrap();

        let all = store
            .list_executions(&ExecutionFilter::default())
            .await
            .unwrap();
        assert_eq!(
            all.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec!["r3", "r2", "r1"]
        );

        let alice = store
            .list_executions(&ExecutionFilter {
                requester: Some("alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            alice.iter().map(|r| r.id()).collect::<Vec<_>>(),
            vec!["r3", "r1"]
        );

        let recent = store
            .list_executions(&ExecutionFilter {
                since: Some(base - ChronoDuration::minutes(2)),
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id(), "r3");
    }
}
