//! Shared relational store for multi-instance deployments.
//!
//! Labels and groups are JSONB columns, so `labels ⊇ {env:prod}` evaluates
//! server-side via the `@>` containment operator; locks use the database
//! clock so every relay instance sees the same notion of expiry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use armada_protocol::{Node, NodeStatus};

use super::{ExecutionFilter, ExecutionRecord, FleetStore, StoreError, StoreLock};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with a bounded pool and run schema setup.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.initialize_schema().await?;
        info!("postgres store ready ({} pooled connections)", max_connections);
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                address TEXT NOT NULL,
                labels JSONB NOT NULL,
                node_groups JSONB NOT NULL,
                status TEXT NOT NULL,
                capabilities JSONB NOT NULL,
                resources JSONB NOT NULL,
                registered_at TIMESTAMPTZ NOT NULL,
                last_seen TIMESTAMPTZ NOT NULL,
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
                request JSONB NOT NULL,
                result JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
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
                expires_at TIMESTAMPTZ NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes (status)",
            "CREATE INDEX IF NOT EXISTS idx_nodes_labels ON nodes USING GIN (labels)",
            "CREATE INDEX IF NOT EXISTS idx_executions_created_at ON executions (created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_executions_requester ON executions (requester)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn row_to_node(row: &PgRow) -> Result<Node, StoreError> {
        let labels: HashMap<String, String> =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("labels")?)?;
        let groups: Vec<String> =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("node_groups")?)?;
        let capabilities: Vec<String> =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("capabilities")?)?;
        let resources =
            serde_json::from_value(row.try_get::<serde_json::Value, _>("resources")?)?;
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
            registered_at: row.try_get("registered_at")?,
            last_seen: row.try_get("last_seen")?,
            version: row.try_get("version")?,
            tunnel_id: row.try_get("tunnel_id")?,
        })
    }

    fn row_to_record(row: &PgRow) -> Result<ExecutionRecord, StoreError> {
        let request = serde_json::from_value(row.try_get::<serde_json::Value, _>("request")?)?;
        let result = serde_json::from_value(row.try_get::<serde_json::Value, _>("result")?)?;
        Ok(ExecutionRecord {
            request,
            result,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl FleetStore for PostgresStore {
    async fn register_node(&self, node: Node) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO nodes (
                id, hostname, address, labels, node_groups, status,
                capabilities, resources, registered_at, last_seen, version, tunnel_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
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
        .bind(serde_json::to_value(&node.labels)?)
        .bind(serde_json::to_value(&node.groups)?)
        .bind(node.status.to_string())
        .bind(serde_json::to_value(&node.capabilities)?)
        .bind(serde_json::to_value(&node.resources)?)
        .bind(node.registered_at)
        .bind(node.last_seen)
        .bind(&node.version)
        .bind(&node.tunnel_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = $1")
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
        let rows = sqlx::query(
            "SELECT * FROM nodes WHERE labels @> $1 ORDER BY registered_at ASC",
        )
        .bind(serde_json::to_value(required)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn update_status(&self, id: &str, status: NodeStatus) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE nodes SET status = $1 WHERE id = $2")
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
            "UPDATE nodes SET last_seen = GREATEST(last_seen, $1) WHERE id = $2",
        )
        .bind(seen)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NodeNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn deregister_node(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions (id, requester, request, result, created_at)
            VALUES ($1, $2, $3, $4, $5)
        "#,
        )
        .bind(record.id())
        .bind(&record.request.requester)
        .bind(serde_json::to_value(&record.request)?)
        .bind(serde_json::to_value(&record.result)?)
        .bind(record.created_at)
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
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
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
            WHERE ($1::text IS NULL OR requester = $1)
              AND ($2::timestamptz IS NULL OR created_at >= $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
        "#,
        )
        .bind(filter.requester.as_deref())
        .bind(filter.since)
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
        sqlx::query("DELETE FROM locks WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;

        let done = sqlx::query(
            r#"
            INSERT INTO locks (key, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE SET expires_at = excluded.expires_at
            WHERE locks.holder = excluded.holder
        "#,
        )
        .bind(key)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(StoreError::LockHeld(key.to_string()));
        }

        Ok(Box::new(PostgresLock {
            pool: self.pool.clone(),
            key: key.to_string(),
            holder: holder.to_string(),
        }))
    }
}

#[derive(Debug)]
struct PostgresLock {
    pool: PgPool,
    key: String,
    holder: String,
}

#[async_trait]
impl StoreLock for PostgresLock {
    async fn extend(&self, ttl: Duration) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE locks SET expires_at = NOW() + make_interval(secs => $1)
            WHERE key = $2 AND holder = $3
        "#,
        )
        .bind(ttl.as_secs_f64())
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
        sqlx::query("DELETE FROM locks WHERE key = $1 AND holder = $2")
            .bind(&self.key)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
