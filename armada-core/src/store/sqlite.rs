//! Embedded single-file store backed by sqlite with WAL journaling.
//!
//! Labels, groups, capabilities and resources are serialized as JSON text
//! columns; execution history pagination and filtering run in SQL.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use armada_protocol::{Node, NodeStatus};

use super::{ExecutionFilter, ExecutionRecord, FleetStore, StoreError, StoreLock};

pub struct SqliteStore {
    pool: SqlitePool,
}

/// Fixed-width RFC 3339 so lexical ordering matches chronological ordering.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {:?}: {}", raw, e)))
}

impl SqliteStore {
    /// Open (or create) the database file and run schema setup.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        info!("sqlite store ready at {}", path.as_ref().display());
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                address TEXT NOT NULL,
                labels TEXT NOT NULL,
                node_groups TEXT NOT NULL,
                status TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                resources TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                version TEXT NOT NULL,
                tunnel_id TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                requester TEXT NOT NULL,
                request TEXT NOT NULL,
                result TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
                key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes (status)",
            "CREATE INDEX IF NOT EXISTS idx_executions_created_at ON executions (created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_executions_requester ON executions (requester)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> Result<Node, StoreError> {
        let labels: HashMap<String, String> =
            serde_json::from_str(&row.try_get::<String, _>("labels")?)?;
        let groups: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("node_groups")?)?;
        let capabilities: Vec<String> =
            serde_json::from_str(&row.try_get::<String, _>("capabilities")?)?;
        let resources = serde_json::from_str(&row.try_get::<String, _>("resources")?)?;
        let status: NodeStatus = row
            .try_get::<String, _>("status")?
            .parse()
            .map_err(StoreError::Serialization)?;

        Ok(Node {
            id: row.try_get("id")?,
            hostname: row.try_get("hostname")?,
            address: row.try_get("address")?,
            labels,
            groups,
            status,
            capabilities,
            resources,
            registered_at: parse_ts(&row.try_get::<String, _>("registered_at")?)?,
            last_seen: parse_ts(&row.try_get::<String, _>("last_seen")?)?,
            version: row.try_get("version")?,
            tunnel_id: row.try_get("tunnel_id")?,
        })
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord, StoreError> {
        let request = serde_json::from_str(&row.try_get::<String, _>("request")?)?;
        let result = serde_json::from_str(&row.try_get::<String, _>("result")?)?;
        let created_at = parse_ts(&row.try_get::<String, _>("created_at")?)?;
        Ok(ExecutionRecord {
            request,
            result,
            created_at,
        })
    }
}

#[async_trait]
impl FleetStore for SqliteStore {
    async fn register_node(&self, node: Node) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                id, hostname, address, labels, node_groups, status,
                capabilities, resources, registered_at, last_seen, version, tunnel_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                address = excluded.address,
                labels = excluded.labels,
                node_groups = excluded.node_groups,
                status = excluded.status,
                capabilities = excluded.capabilities,
                resources = excluded.resources,
                last_seen = excluded.last_seen,
                version = excluded.version,
                tunnel_id = excluded.tunnel_id
        "#,
        )
        .bind(&node.id)
        .bind(&node.hostname)
        .bind(&node.address)
        .bind(serde_json::to_string(&node.labels)?)
        .bind(serde_json::to_string(&node.groups)?)
        .bind(node.status.to_string())
        .bind(serde_json::to_string(&node.capabilities)?)
        .bind(serde_json::to_string(&node.resources)?)
        .bind(ts(node.registered_at))
        .bind(ts(node.last_seen))
        .bind(&node.version)
        .bind(&node.tunnel_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY registered_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn list_nodes_by_labels(
        &self,
        required: &HashMap<String, String>,
    ) -> Result<Vec<Node>, StoreError> {
        // JSON text columns: decode then apply the superset match.
        let nodes = self.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.matches_labels(required))
            .collect())
    }

    async fn update_status(&self, id: &str, status: NodeStatus) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE nodes SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NodeNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_heartbeat(&self, id: &str, seen: DateTime<Utc>) -> Result<(), StoreError> {
        let done = sqlx::query(
            "UPDATE nodes SET last_seen = MAX(last_seen, ?) WHERE id = ?",
        )
        .bind(ts(seen))
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NodeNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn deregister_node(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions (id, requester, request, result, created_at)
            VALUES (?, ?, ?, ?, ?)
        "#,
        )
        .bind(record.id())
        .bind(&record.request.requester)
        .bind(serde_json::to_string(&record.request)?)
        .bind(serde_json::to_string(&record.result)?)
        .bind(ts(record.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => match StoreError::from(err) {
                StoreError::DuplicateExecution(_) => {
                    Err(StoreError::DuplicateExecution(record.id().to_string()))
                }
                other => Err(other),
            },
        }
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE (?1 IS NULL OR requester = ?1)
              AND (?2 IS NULL OR created_at >= ?2)
            ORDER BY created_at DESC
            LIMIT ?3 OFFSET ?4
        "#,
        )
        .bind(filter.requester.as_deref())
        .bind(filter.since.map(ts))
        .bind(filter.effective_limit())
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Box<dyn StoreLock>, StoreError> {
        let now = Utc::now();
        sqlx::query("DELETE FROM locks WHERE expires_at <= ?")
            .bind(ts(now))
            .execute(&self.pool)
            .await?;

        let expires = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let done = sqlx::query(
            r#"
            INSERT INTO locks (key, holder, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
            WHERE locks.holder = excluded.holder
        "#,
        )
        .bind(key)
        .bind(holder)
        .bind(ts(expires))
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(StoreError::LockHeld(key.to_string()));
        }

        Ok(Box::new(SqliteLock {
            pool: self.pool.clone(),
            key: key.to_string(),
            holder: holder.to_string(),
        }))
    }
}

#[derive(Debug)]
struct SqliteLock {
    pool: SqlitePool,
    key: String,
    holder: String,
}

#[async_trait]
impl StoreLock for SqliteLock {
    async fn extend(&self, ttl: Duration) -> Result<(), StoreError> {
        let expires =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let done = sqlx::query("UPDATE locks SET expires_at = ? WHERE key = ? AND holder = ?")
            .bind(ts(expires))
            .bind(&self.key)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::LockHeld(self.key.clone()));
        }
        Ok(())
    }

    async fn unlock(self: Box<Self>) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM locks WHERE key = ? AND holder = ?")
            .bind(&self.key)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
