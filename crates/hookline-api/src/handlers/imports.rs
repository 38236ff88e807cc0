//! Bulk import handlers

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Extension, Json,
};
use hookline_common::types::GroupId;
use hookline_core::jobs::{CommitRequest, ImportError, UploadPreview};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use super::{api_error, ApiError};
use crate::auth::{AppState, AuthContext};

fn import_error(e: ImportError) -> ApiError {
    let status = e.status_code();
    if status >= 500 {
        error!("Import request failed: {}", e);
    }
    let code = match status {
        400 => "VALIDATION_ERROR",
        404 => "NOT_FOUND",
        _ => "IMPORT_ERROR",
    };
    api_error(status, code, e.to_string())
}

fn bad_upload(message: impl Into<String>) -> ApiError {
    api_error(400, "VALIDATION_ERROR", message)
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(flatten)]
    pub preview: UploadPreview,
}

#[derive(Debug, Serialize)]
pub struct CommitImportResponse {
    pub success: bool,
    pub job_id: String,
    pub group_id: GroupId,
}

/// Stage a CSV file and preview its rows
///
/// POST /api/v1/imports/upload (multipart, field `file`)
pub async fn upload_import(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut content = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_upload(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| bad_upload(format!("Failed to read file: {}", e)))?;
            content = Some(bytes);
            break;
        }
    }

    let content = content.ok_or_else(|| bad_upload("Failed to get file from request"))?;

    let preview = state
        .importer
        .stage_upload(&content)
        .await
        .map_err(import_error)?;

    info!(
        "User {} staged import {} ({} records)",
        auth.user_id, preview.file_token, preview.total_count
    );

    Ok(Json(UploadResponse {
        success: true,
        preview,
    }))
}

/// Import a staged file into a group as a background job
///
/// POST /api/v1/imports/commit
pub async fn commit_import(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<CommitRequest>,
) -> Result<(StatusCode, Json<CommitImportResponse>), ApiError> {
    // The job runs on after the response, its handle is not needed here
    let (response, _handle) = state
        .importer
        .commit(auth.user_id, input)
        .await
        .map_err(import_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CommitImportResponse {
            success: true,
            job_id: response.job_id,
            group_id: response.group_id,
        }),
    ))
}
