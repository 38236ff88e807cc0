//! Campaign handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use hookline_common::types::Recipient;
use hookline_core::scheduled::{CampaignError, NewCampaign, TestSendRequest};
use hookline_storage::models::{Campaign, CampaignResult, CampaignStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{api_error, not_found, ApiError};
use crate::auth::{AppState, AuthContext};

pub(crate) fn campaign_error(e: CampaignError) -> ApiError {
    let code = match &e {
        CampaignError::NotFound => "NOT_FOUND",
        CampaignError::Store(inner) => inner.code(),
        _ => "VALIDATION_ERROR",
    };
    if e.status_code() >= 500 {
        error!("Campaign operation failed: {}", e);
    }
    api_error(e.status_code(), code, e.to_string())
}

pub(crate) fn store_error(e: hookline_common::Error) -> ApiError {
    if e.status_code() >= 500 {
        error!("Store operation failed: {}", e);
    }
    api_error(e.status_code(), e.code(), e.to_string())
}

/// Campaign with its per-recipient results
#[derive(Debug, Serialize)]
pub struct CampaignResultsResponse {
    pub campaign: Campaign,
    pub results: Vec<CampaignResult>,
}

#[derive(Debug, Serialize)]
pub struct LaunchResponse {
    pub campaign_id: Uuid,
    pub status: String,
}

/// Request body for a test send
#[derive(Debug, Deserialize)]
pub struct TestSendBody {
    pub template: String,
    pub smtp: String,
    pub url: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub qr_size: u32,
    #[serde(flatten)]
    pub recipient: Recipient,
}

#[derive(Debug, Serialize)]
pub struct TestSendResponse {
    pub success: bool,
    pub message_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateTemplateBody {
    pub text: String,
}

/// Create a new campaign
///
/// POST /api/v1/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<NewCampaign>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaign = state
        .campaigns
        .create_campaign(auth.user_id, input)
        .await
        .map_err(campaign_error)?;

    info!("Created campaign {} for user {}", campaign.id, auth.user_id);

    // Units due at creation are locked until a launcher takes them over.
    // If this fails the worker resumes the launch on its next cycle.
    if campaign.status_enum() == Some(CampaignStatus::InProgress) {
        if let Err(e) = state.worker.launch_campaign(campaign.id).await {
            warn!(campaign_id = %campaign.id, "Failed to launch campaign: {}", e);
        }
    }

    Ok((StatusCode::CREATED, Json(campaign)))
}

/// Get a campaign by ID
///
/// GET /api/v1/campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    let campaign = state
        .campaigns
        .get_campaign(auth.user_id, campaign_id)
        .await
        .map_err(campaign_error)?;

    Ok(Json(campaign))
}

/// Get a campaign's per-recipient results
///
/// GET /api/v1/campaigns/:campaign_id/results
pub async fn get_campaign_results(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CampaignResultsResponse>, ApiError> {
    let campaign = state
        .campaigns
        .get_campaign(auth.user_id, campaign_id)
        .await
        .map_err(campaign_error)?;
    let results = state
        .campaigns
        .list_results(auth.user_id, campaign_id)
        .await
        .map_err(campaign_error)?;

    Ok(Json(CampaignResultsResponse { campaign, results }))
}

/// Send every due unit of a campaign now
///
/// POST /api/v1/campaigns/:campaign_id/launch
pub async fn launch_campaign(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(campaign_id): Path<Uuid>,
) -> Result<(StatusCode, Json<LaunchResponse>), ApiError> {
    state
        .campaigns
        .get_campaign(auth.user_id, campaign_id)
        .await
        .map_err(campaign_error)?;

    // The dispatch keeps running after the response is sent
    state
        .worker
        .launch_campaign(campaign_id)
        .await
        .map_err(store_error)?;

    info!("Launched campaign {}", campaign_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(LaunchResponse {
            campaign_id,
            status: "launched".to_string(),
        }),
    ))
}

/// Mark a campaign complete
///
/// POST /api/v1/campaigns/:campaign_id/complete
pub async fn complete_campaign(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    let campaign = state
        .campaigns
        .complete_campaign(auth.user_id, campaign_id)
        .await
        .map_err(campaign_error)?;

    Ok(Json(campaign))
}

/// Delete a campaign
///
/// DELETE /api/v1/campaigns/:campaign_id
pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(campaign_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .campaigns
        .delete_campaign(auth.user_id, campaign_id)
        .await
        .map_err(campaign_error)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Send a single preview email through a sending profile
///
/// POST /api/v1/campaigns/test-send
pub async fn send_test_email(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<TestSendBody>,
) -> Result<Json<TestSendResponse>, ApiError> {
    let template = state
        .store
        .find_template_by_name(auth.user_id, &input.template)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Template not found"))?;
    let smtp = state
        .store
        .find_sending_profile_by_name(auth.user_id, &input.smtp)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Sending profile not found"))?;

    let request = TestSendRequest::new(template, smtp, input.url, input.recipient)
        .with_from_address(input.from_address)
        .with_qr_size(input.qr_size);

    let message_id = state
        .worker
        .send_test_email(request)
        .await
        .map_err(store_error)?;

    Ok(Json(TestSendResponse {
        success: true,
        message_id,
    }))
}

/// Check that a template renders
///
/// POST /api/v1/templates/validate
pub async fn validate_template(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ValidateTemplateBody>,
) -> Result<StatusCode, ApiError> {
    state
        .campaigns
        .validate_template(&input.text)
        .map_err(campaign_error)?;

    Ok(StatusCode::NO_CONTENT)
}
