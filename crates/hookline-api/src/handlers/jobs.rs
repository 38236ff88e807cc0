//! Job handlers

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use hookline_core::jobs::JobSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{not_found, ApiError};
use crate::auth::{AppState, AuthContext};

/// Query parameters for listing jobs
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    /// Only pending and processing jobs
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub data: Vec<JobSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub success: bool,
}

/// List the caller's jobs, newest first
///
/// GET /api/v1/jobs
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListJobsQuery>,
) -> Json<JobListResponse> {
    let jobs = state.importer.jobs();
    let data = if query.active {
        jobs.get_active_jobs(auth.user_id).await
    } else {
        jobs.list_jobs(auth.user_id).await
    };

    Json(JobListResponse { data })
}

/// Get a job by ID
///
/// GET /api/v1/jobs/:job_id
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job = state
        .importer
        .jobs()
        .get_job(&job_id)
        .await
        .filter(|j| j.user_id == auth.user_id)
        .ok_or_else(|| not_found("Job not found"))?;

    Ok(Json(job.snapshot().await))
}

/// Request cancellation of a job. `success` is false when the job had
/// already finished.
///
/// POST /api/v1/jobs/:job_id/cancel
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    let job = state
        .importer
        .jobs()
        .get_job(&job_id)
        .await
        .filter(|j| j.user_id == auth.user_id)
        .ok_or_else(|| not_found("Job not found"))?;

    Ok(Json(CancelJobResponse {
        success: job.cancel().await,
    }))
}
