//! Health and HA endpoints served beside the tunnel listener.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::RelayServer;
use crate::ha::HaCoordinator;

#[derive(Clone)]
struct ApiState {
    relay: Arc<RelayServer>,
    ha: Arc<HaCoordinator>,
    drain_timeout: Duration,
}

/// Bind the API listener and serve `/health` and `/ha/*` under the base
/// path. Returns the bound address.
pub async fn spawn_api_server(
    addr: &str,
    base_path: &str,
    relay: Arc<RelayServer>,
    ha: Arc<HaCoordinator>,
    drain_timeout: Duration,
) -> anyhow::Result<SocketAddr> {
    let state = ApiState {
        relay,
        ha,
        drain_timeout,
    };
    let app = Router::new()
        .route(&format!("{}/health", base_path), get(health))
        .route(&format!("{}/ha/status", base_path), get(ha_status))
        .route(&format!("{}/ha/cluster", base_path), get(ha_cluster))
        .route(&format!("{}/ha/drain", base_path), post(ha_drain))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("relay api listener on {}", local_addr);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(local_addr)
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let stats = state.relay.stats();
    Json(json!({
        "status": if stats.draining { "draining" } else { "ok" },
        "instance_id": state.ha.instance_id(),
        "stats": stats,
    }))
}

async fn ha_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "instance_id": state.ha.instance_id(),
        "healthy": true,
        "draining": state.ha.is_draining(),
        "active_tunnels": state.relay.active_tunnels(),
    }))
}

async fn ha_cluster(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let view = state.ha.cluster_view().await;
    Json(json!(view))
}

/// POST: refuse new registrations, wait for tunnels to close (up to the
/// drain timeout), then signal process shutdown.
async fn ha_drain(State(state): State<ApiState>) -> (StatusCode, Json<serde_json::Value>) {
    state.ha.set_draining();
    let relay = Arc::clone(&state.relay);
    let timeout = state.drain_timeout;
    tokio::spawn(async move {
        relay.begin_drain(timeout).await;
        relay.shutdown();
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "draining",
            "instance_id": state.ha.instance_id(),
        })),
    )
}
