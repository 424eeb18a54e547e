//! HTTP control plane
//!
//! Every response body is JSON: `{"message", "data"}` on success and
//! `{"error"}` on failure. Expected failures are all 422.

use crate::api::control::ControlPlane;
use crate::api::membership::MembershipManager;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use crate::fsm::snapshot::write_image;
use crate::raft::{Consensus, RaftState};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared state for all handlers
pub struct AppState<C> {
    pub node_id: String,
    pub control: ControlPlane<C>,
    pub membership: MembershipManager<C>,
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            control: self.control.clone(),
            membership: self.membership.clone(),
        }
    }
}

impl<C: Consensus> AppState<C> {
    pub fn new(
        node_id: impl Into<String>,
        consensus: Arc<C>,
        storage: crate::fsm::Storage,
        apply_timeout: std::time::Duration,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            control: ControlPlane::new(consensus.clone(), storage, apply_timeout),
            membership: MembershipManager::new(consensus, apply_timeout),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub raft_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveRequest {
    #[serde(default)]
    pub node_id: String,
}

/// Creates the HTTP router with all public endpoints.
pub fn create_router<C: Consensus>(state: AppState<C>) -> Router {
    Router::new()
        // Key operations
        .route("/db", post(set_value::<C>))
        .route("/db/:key", get(get_value::<C>).delete(delete_value::<C>))
        // Cluster membership
        .route("/raft/join", post(join::<C>))
        .route("/raft/remove", post(remove::<C>))
        .route("/raft/stats", get(stats::<C>))
        // Operations
        .route("/health", get(health::<C>))
        .route("/admin/export", get(export::<C>))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

fn success(message: impl Into<String>, data: impl Serialize) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "message": message.into(), "data": data })),
    )
        .into_response()
}

fn bind<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| Error::Binding(rejection.body_text()))
}

async fn set_value<C: Consensus>(
    State(state): State<AppState<C>>,
    payload: std::result::Result<Json<SetRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let req = bind(payload)?;
        state.control.write(&req.key, req.value).await
    }
    .await;

    match result {
        Ok(kv) => success("data stored successfully", kv),
        Err(e) => e.into_response(),
    }
}

async fn get_value<C: Consensus>(
    State(state): State<AppState<C>>,
    Path(key): Path<String>,
) -> Response {
    match state.control.read(&key) {
        Ok(kv) => success("data fetched successfully", kv),
        Err(e) => e.into_response(),
    }
}

async fn delete_value<C: Consensus>(
    State(state): State<AppState<C>>,
    Path(key): Path<String>,
) -> Response {
    match state.control.delete(&key).await {
        Ok(kv) => success("data removed successfully", kv),
        Err(e) => e.into_response(),
    }
}

async fn join<C: Consensus>(
    State(state): State<AppState<C>>,
    payload: std::result::Result<Json<JoinRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let req = bind(payload)?;
        let stats = state
            .membership
            .join(&req.node_id, &req.raft_address)
            .await?;
        Ok::<_, Error>((req, stats))
    }
    .await;

    match result {
        Ok((req, stats)) => success(
            format!(
                "node {} at {} joined successfully",
                req.node_id.trim(),
                req.raft_address.trim()
            ),
            stats,
        ),
        Err(e) => e.into_response(),
    }
}

async fn remove<C: Consensus>(
    State(state): State<AppState<C>>,
    payload: std::result::Result<Json<RemoveRequest>, JsonRejection>,
) -> Response {
    let result = async {
        let req = bind(payload)?;
        let stats = state.membership.remove(&req.node_id).await?;
        Ok::<_, Error>((req, stats))
    }
    .await;

    match result {
        Ok((req, stats)) => success(
            format!("node {} removed successfully", req.node_id.trim()),
            stats,
        ),
        Err(e) => e.into_response(),
    }
}

async fn stats<C: Consensus>(State(state): State<AppState<C>>) -> Response {
    success("raft cluster status", state.membership.stats())
}

/// 503 once the raft worker has stopped; the node can still read but will
/// never apply another entry.
async fn health<C: Consensus>(State(state): State<AppState<C>>) -> impl IntoResponse {
    let raft_state = state.control.consensus().state();
    let (code, status) = match raft_state {
        RaftState::Shutdown => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        _ => (StatusCode::OK, "healthy"),
    };
    (
        code,
        Json(json!({
            "status": status,
            "node_id": state.node_id,
            "state": raft_state.to_string(),
            "version": crate::VERSION,
        })),
    )
}

/// Full key space as a snapshot image, usable with `dpasswd-node --restore`
async fn export<C: Consensus>(State(state): State<AppState<C>>) -> Response {
    let storage = state.control.storage().clone();
    let image = tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        let count = write_image(&storage, &mut buf)?;
        Ok::<_, Error>((count, buf))
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))
    .and_then(|r| r);

    match image {
        Ok((count, buf)) => {
            tracing::info!(records = count, "Exported snapshot image");
            ([(header::CONTENT_TYPE, "application/json")], buf).into_response()
        }
        Err(e) => e.into_response(),
    }
}
