use axum::extract::{Path, State};
use common::models::{JobInfo, SchedulerStatus};

use crate::handlers::{ErrorResponse, SuccessResponse};
use crate::state::AppState;

/// Live scheduler status: run state plus every installed job
#[tracing::instrument(skip(state))]
pub async fn scheduler_status(
    State(state): State<AppState>,
) -> Result<SuccessResponse<SchedulerStatus>, ErrorResponse> {
    let scheduler = state.scheduler()?;
    Ok(SuccessResponse::new(scheduler.get_status().await))
}

/// Detailed view of one live job
#[tracing::instrument(skip(state))]
pub async fn job_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<SuccessResponse<JobInfo>, ErrorResponse> {
    let scheduler = state.scheduler()?;
    scheduler
        .get_job_info(&id)
        .await
        .map(SuccessResponse::new)
        .ok_or_else(|| ErrorResponse::new("not_found", format!("Job {} is not live", id)))
}
