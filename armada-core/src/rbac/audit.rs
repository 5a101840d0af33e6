//! Append-only audit log with ring-buffer eviction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;

/// Default entry capacity before the oldest entries are evicted.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Allow,
    Deny,
}

/// One access-control decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub permission: String,
    pub resource: String,
    pub decision: AuditDecision,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Query filter; individual filters compose conjunctively.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub decision: Option<AuditDecision>,
    pub since: Option<DateTime<Utc>>,
    /// 0 means no limit.
    pub limit: usize,
}

pub struct AuditLogger {
    entries: RwLock<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl AuditLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Append one entry, evicting the oldest once the capacity bound is hit.
    /// Never fails; audit is best-effort and must not block decisions.
    pub async fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub async fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        let matched = entries.iter().filter(|e| {
            filter
                .user_id
                .as_ref()
                .map(|u| &e.user_id == u)
                .unwrap_or(true)
                && filter.decision.map(|d| e.decision == d).unwrap_or(true)
                && filter.since.map(|s| e.timestamp >= s).unwrap_or(true)
        });
        let mut out: Vec<AuditEntry> = matched.cloned().collect();
        if filter.limit > 0 && out.len() > filter.limit {
            let excess = out.len() - filter.limit;
            out.drain(..excess);
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, decision: AuditDecision) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            user_id: user.to_string(),
            permission: "fleet:exec".into(),
            resource: "any".into(),
            decision,
            reason: "test".into(),
            channel: None,
            session_key: None,
        }
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest() {
        let log = AuditLogger::new(3);
        for i in 0..5 {
            log.record(entry(&format!("user-{}", i), AuditDecision::Allow))
                .await;
        }
        let all = log.query(&AuditFilter::default()).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].user_id, "user-2");
        assert_eq!(all[2].user_id, "user-4");
    }

    #[tokio::test]
    async fn filters_compose() {
        let log = AuditLogger::default();
        log.record(entry("alice", AuditDecision::Allow)).await;
        log.record(entry("alice", AuditDecision::Deny)).await;
        log.record(entry("bob", AuditDecision::Deny)).await;

        // Filtering by user then by decision equals filtering by both.
        let by_user = log
            .query(&AuditFilter {
                user_id: Some("alice".into()),
                ..Default::default()
            })
            .await;
        let chained: Vec<_> = by_user
            .into_iter()
            .filter(|e| e.decision == AuditDecision::Deny)
            .collect();

        let combined = log
            .query(&AuditFilter {
                user_id: Some("alice".into()),
                decision: Some(AuditDecision::Deny),
                ..Default::default()
            })
            .await;

        assert_eq!(chained, combined);
        assert_eq!(combined.len(), 1);
    }
}
