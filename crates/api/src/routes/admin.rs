//! Admin routes for the reconciliation queue
//!
//! Every route here sits behind [`require_admin`].

use axum::{
    extract::{Path, State},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use lumen_billing::{ClearResult, DeadLetterRecord, QueueStatus, TaskId};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::require_admin;
use crate::error::ApiResult;
use crate::state::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/queue", delete(clear_queue))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}/replay", post(replay_dead_letter))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

/// Queue statistics
pub async fn get_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.reconciliation.status())
}

/// Drop every pending task (operator recovery only)
pub async fn clear_queue(State(state): State<AppState>) -> Json<ClearResult> {
    Json(state.reconciliation.clear())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLettersResponse {
    pub dead_letters: Vec<DeadLetterRecord>,
    /// Dead letters since startup, including records no longer retained
    pub dead_lettered_total: u64,
}

pub async fn list_dead_letters(State(state): State<AppState>) -> Json<DeadLettersResponse> {
    let dead_lettered_total = state.reconciliation.status().dead_lettered_total;
    Json(DeadLettersResponse {
        dead_letters: state.reconciliation.dead_letters(),
        dead_lettered_total,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    pub replayed: bool,
    pub task_id: TaskId,
    /// `true` when a pending task for the same target absorbed the replay
    pub merged: bool,
}

pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ReplayResponse>> {
    let result = state.reconciliation.replay_dead_letter(TaskId::from(id))?;
    Ok(Json(ReplayResponse {
        replayed: true,
        task_id: result.task_id,
        merged: result.merged,
    }))
}
