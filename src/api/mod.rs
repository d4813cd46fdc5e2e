//! HTTP view of the current owner's scheduler.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::model::{CaptureId, KeySpanId, OwnerRevision, Ts};
use crate::owner::Owner;
use crate::scheduler::{InfoProvider, SchedulerSnapshot, TaskPosition, TaskStatus};

/// The owner this process currently runs, if any.
#[derive(Clone, Default)]
pub struct OwnerSlot {
    inner: Arc<RwLock<Option<Arc<Owner>>>>,
}

impl OwnerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, owner: Arc<Owner>) {
        *self.inner.write().await = Some(owner);
    }

    /// Empty the slot if it still holds the owner of `revision`.
    pub async fn clear(&self, revision: OwnerRevision) {
        let mut slot = self.inner.write().await;
        if slot.as_ref().is_some_and(|o| o.revision() == revision) {
            *slot = None;
        }
    }

    pub async fn get(&self) -> Option<Arc<Owner>> {
        self.inner.read().await.clone()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub owner: OwnerSlot,
}

#[derive(Serialize)]
struct OwnerResponse {
    capture: CaptureId,
    revision: OwnerRevision,
    changefeed: String,
    checkpoint_ts: Option<Ts>,
    resolved_ts: Option<Ts>,
}

#[derive(Deserialize)]
struct MoveKeySpanRequest {
    target: CaptureId,
}

#[derive(Serialize)]
struct AcceptedResponse {
    accepted: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/owner", get(owner_handler))
        .route("/api/v1/changefeeds/:cf/keyspans", get(keyspans_handler))
        .route("/api/v1/changefeeds/:cf/task-statuses", get(task_statuses_handler))
        .route("/api/v1/changefeeds/:cf/task-positions", get(task_positions_handler))
        .route("/api/v1/changefeeds/:cf/keyspans/:id/move", post(move_keyspan_handler))
        .route("/api/v1/changefeeds/:cf/rebalance", post(rebalance_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `cancel` fires.
pub async fn run_api(addr: SocketAddr, state: ApiState, cancel: CancellationToken) {
    let app = router(state);
    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn current_owner(state: &ApiState) -> Result<Arc<Owner>, ApiError> {
    state.owner.get().await.ok_or(ApiError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: "this capture is not the owner".to_string(),
    })
}

async fn owner_for(state: &ApiState, changefeed: &str) -> Result<Arc<Owner>, ApiError> {
    let owner = current_owner(state).await?;
    if owner.dispatcher().changefeed() != changefeed {
        return Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("changefeed {changefeed} not found"),
        });
    }
    Ok(owner)
}

async fn owner_handler(State(state): State<ApiState>) -> Result<Json<OwnerResponse>, ApiError> {
    let owner = current_owner(&state).await?;
    let checkpoint = owner.global_checkpoint();
    Ok(Json(OwnerResponse {
        capture: owner.capture().to_string(),
        revision: owner.revision(),
        changefeed: owner.dispatcher().changefeed().to_string(),
        checkpoint_ts: checkpoint.map(|w| w.checkpoint_ts()),
        resolved_ts: checkpoint.map(|w| w.resolved_ts()),
    }))
}

async fn keyspans_handler(
    State(state): State<ApiState>,
    Path(cf): Path<String>,
) -> Result<Json<SchedulerSnapshot>, ApiError> {
    let owner = owner_for(&state, &cf).await?;
    Ok(Json(owner.dispatcher().snapshot().await))
}

async fn task_statuses_handler(
    State(state): State<ApiState>,
    Path(cf): Path<String>,
) -> Result<Json<BTreeMap<CaptureId, TaskStatus>>, ApiError> {
    let owner = owner_for(&state, &cf).await?;
    Ok(Json(owner.dispatcher().task_statuses().await))
}

async fn task_positions_handler(
    State(state): State<ApiState>,
    Path(cf): Path<String>,
) -> Result<Json<BTreeMap<CaptureId, TaskPosition>>, ApiError> {
    let owner = owner_for(&state, &cf).await?;
    Ok(Json(owner.dispatcher().task_positions().await))
}

async fn move_keyspan_handler(
    State(state): State<ApiState>,
    Path((cf, id)): Path<(String, KeySpanId)>,
    Json(payload): Json<MoveKeySpanRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let owner = owner_for(&state, &cf).await?;
    owner.dispatcher().move_keyspan(id, payload.target).await;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })))
}

async fn rebalance_handler(
    State(state): State<ApiState>,
    Path(cf): Path<String>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let owner = owner_for(&state, &cf).await?;
    owner.dispatcher().rebalance().await;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { accepted: true })))
}
