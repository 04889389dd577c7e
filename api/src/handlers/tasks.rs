use axum::{
    extract::{Path, State},
    Json,
};
use common::models::ScheduledTask;
use common::scheduler::{NewTask, TaskPatch};
use serde::Serialize;

use crate::handlers::{ErrorResponse, SuccessResponse};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub id: String,
    pub status: &'static str,
}

/// List every persisted task with its live next run time
#[tracing::instrument(skip(state))]
pub async fn list_tasks(
    State(state): State<AppState>,
) -> Result<SuccessResponse<Vec<ScheduledTask>>, ErrorResponse> {
    let tasks = state.admin()?.list().await?;
    Ok(SuccessResponse::new(tasks))
}

/// Create a task and install it in the live engine
#[tracing::instrument(skip(state, req), fields(task_name = %req.name))]
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<NewTask>,
) -> Result<SuccessResponse<ScheduledTask>, ErrorResponse> {
    let task = state.admin()?.create(req).await?;
    tracing::info!(task_id = %task.id, "Task created via API");
    Ok(SuccessResponse::new(task))
}

#[tracing::instrument(skip(state))]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<ScheduledTask>, ErrorResponse> {
    let task = state.admin()?.get(&id).await?;
    Ok(SuccessResponse::new(task))
}

#[tracing::instrument(skip(state, patch))]
pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<SuccessResponse<ScheduledTask>, ErrorResponse> {
    let task = state.admin()?.update(&id, patch).await?;
    Ok(SuccessResponse::new(task))
}

#[tracing::instrument(skip(state))]
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<String>, ErrorResponse> {
    state.admin()?.delete(&id).await?;
    Ok(SuccessResponse::new(id))
}

/// Disable a task; its live job stays installed but paused
#[tracing::instrument(skip(state))]
pub async fn pause_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<ScheduledTask>, ErrorResponse> {
    let task = state.admin()?.set_enabled(&id, false).await?;
    Ok(SuccessResponse::new(task))
}

#[tracing::instrument(skip(state))]
pub async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<ScheduledTask>, ErrorResponse> {
    let task = state.admin()?.set_enabled(&id, true).await?;
    Ok(SuccessResponse::new(task))
}

/// Invoke the task's function once, bypassing its trigger
#[tracing::instrument(skip(state))]
pub async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<RunResponse>, ErrorResponse> {
    state.admin()?.run_once(&id).await?;
    Ok(SuccessResponse::new(RunResponse {
        id,
        status: "completed",
    }))
}
