//! Node lifecycle management over the store, with watcher notifications and
//! a periodic stale-node sweep.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use armada_protocol::{Node, NodeStatus};

use crate::store::{FleetStore, StoreError};

/// Snapshot of a node status transition handed to watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEvent {
    pub node_id: String,
    pub from: NodeStatus,
    pub to: NodeStatus,
    pub at: DateTime<Utc>,
}

/// Observer of node lifecycle events. Implementations must not block and
/// must not call back into the `NodeManager`.
pub trait NodeWatcher: Send + Sync {
    fn on_event(&self, event: &NodeEvent);
}

pub struct NodeManager {
    store: Arc<dyn FleetStore>,
    watchers: RwLock<Vec<Arc<dyn NodeWatcher>>>,
}

impl NodeManager {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self {
            store,
            watchers: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn FleetStore> {
        Arc::clone(&self.store)
    }

    pub async fn add_watcher(&self, watcher: Arc<dyn NodeWatcher>) {
        self.watchers.write().await.push(watcher);
    }

    async fn notify(&self, event: NodeEvent) {
        let watchers = self.watchers.read().await;
        for watcher in watchers.iter() {
            watcher.on_event(&event);
        }
    }

    /// Upsert a node record (first agent connect or manual registration).
    pub async fn register(&self, node: Node) -> Result<(), StoreError> {
        info!(node_id = %node.id, hostname = %node.hostname, "registering node");
        self.store.register_node(node).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Node>, StoreError> {
        self.store.get_node(id).await
    }

    pub async fn heartbeat(&self, id: &str, seen: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.update_heartbeat(id, seen).await
    }

    /// Record a status transition and notify watchers when the status
    /// actually changes.
    pub async fn set_status(&self, id: &str, status: NodeStatus) -> Result<(), StoreError> {
        let previous = self
            .store
            .get_node(id)
            .await?
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))?
            .status;
        if previous == status {
            return Ok(());
        }
        self.store.update_status(id, status).await?;
        self.notify(NodeEvent {
            node_id: id.to_string(),
            from: previous,
            to: status,
            at: Utc::now(),
        })
        .await;
        Ok(())
    }

    /// Graceful removal from targeting; in-flight work may finish.
    pub async fn drain(&self, id: &str) -> Result<(), StoreError> {
        self.set_status(id, NodeStatus::Draining).await
    }

    pub async fn deregister(&self, id: &str) -> Result<(), StoreError> {
        info!(node_id = %id, "deregistering node");
        self.store.deregister_node(id).await
    }

    /// Move online nodes whose `last_seen` is older than `stale_after` to
    /// `unreachable`. Returns the swept node ids.
    pub async fn sweep_stale(&self, stale_after: Duration) -> Result<Vec<String>, StoreError> {
        let threshold = Utc::now()
            - ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::zero());
        let mut swept = Vec::new();
        for node in self.store.list_nodes().await? {
            if node.status == NodeStatus::Online && node.last_seen < threshold {
                warn!(node_id = %node.id, last_seen = %node.last_seen, "node went stale");
                self.set_status(&node.id, NodeStatus::Unreachable).await?;
                swept.push(node.id);
            }
        }
        Ok(swept)
    }

    /// Background garbage-collection loop.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        stale_after: Duration,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.sweep_stale(stale_after).await {
                    warn!("stale sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    struct RecordingWatcher {
        events: Mutex<Vec<NodeEvent>>,
    }

    impl NodeWatcher for RecordingWatcher {
        fn on_event(&self, event: &NodeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn transitions_out_of_online_emit_events() {
        let manager = NodeManager::new(Arc::new(MemoryStore::new()));
        let watcher = Arc::new(RecordingWatcher {
            events: Mutex::new(Vec::new()),
        });
        manager.add_watcher(watcher.clone()).await;

        manager
            .register(Node::new("n1", "host", "10.0.0.1:1"))
            .await
            .unwrap();
        manager.set_status("n1", NodeStatus::Degraded).await.unwrap();
        // Same status again: no event.
        manager.set_status("n1", NodeStatus::Degraded).await.unwrap();

        let events = watcher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from, NodeStatus::Online);
        assert_eq!(events[0].to, NodeStatus::Degraded);
    }

    #[tokio::test]
    async fn stale_online_nodes_become_unreachable() {
        let store = Arc::new(MemoryStore::new());
        let manager = NodeManager::new(store.clone());

        let mut stale = Node::new("stale", "host", "10.0.0.1:1");
        stale.last_seen = Utc::now() - ChronoDuration::minutes(10);
        store.register_node(stale).await.unwrap();
        store
            .register_node(Node::new("fresh", "host", "10.0.0.2:1"))
            .await
            .unwrap();

        let swept = manager.sweep_stale(Duration::from_secs(120)).await.unwrap();
        assert_eq!(swept, vec!["stale".to_string()]);
        assert_eq!(
            manager.get("stale").await.unwrap().unwrap().status,
            NodeStatus::Unreachable
        );
        assert_eq!(
            manager.get("fresh").await.unwrap().unwrap().status,
            NodeStatus::Online
        );
    }

    #[tokio::test]
    async fn drain_marks_node_draining() {
        let manager = NodeManager::new(Arc::new(MemoryStore::new()));
        manager
            .register(Node::new("n1", "host", "10.0.0.1:1"))
            .await
            .unwrap();
        manager.drain("n1").await.unwrap();
        assert_eq!(
            manager.get("n1").await.unwrap().unwrap().status,
            NodeStatus::Draining
        );
    }
}
