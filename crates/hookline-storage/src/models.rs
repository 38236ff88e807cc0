//! Database models for Hookline

use chrono::{DateTime, Utc};
use hookline_common::types::{
    CampaignId, DeliveryUnitId, GroupId, ProfileId, Recipient, ResultId, TargetId, TemplateId,
    UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;

/// Attack objective whose lure links carry an encrypted `rd` redirect token
pub const OBJECTIVE_TRACKING_ONLY: &str = "Tracking only";

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Queued,
    InProgress,
    Complete,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Queued => write!(f, "queued"),
            CampaignStatus::InProgress => write!(f, "in_progress"),
            CampaignStatus::Complete => write!(f, "complete"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(CampaignStatus::Queued),
            "in_progress" => Ok(CampaignStatus::InProgress),
            "complete" => Ok(CampaignStatus::Complete),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Delivery channel of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Email,
    Sms,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

/// Per-recipient result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Scheduled,
    Sending,
    Sent,
    Retrying,
    Opened,
    Clicked,
    Submitted,
    Error,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStatus::Scheduled => write!(f, "scheduled"),
            ResultStatus::Sending => write!(f, "sending"),
            ResultStatus::Sent => write!(f, "sent"),
            ResultStatus::Retrying => write!(f, "retrying"),
            ResultStatus::Opened => write!(f, "opened"),
            ResultStatus::Clicked => write!(f, "clicked"),
            ResultStatus::Submitted => write!(f, "submitted"),
            ResultStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ResultStatus::Scheduled),
            "sending" => Ok(ResultStatus::Sending),
            "sent" => Ok(ResultStatus::Sent),
            "retrying" => Ok(ResultStatus::Retrying),
            "opened" => Ok(ResultStatus::Opened),
            "clicked" => Ok(ResultStatus::Clicked),
            "submitted" => Ok(ResultStatus::Submitted),
            "error" => Ok(ResultStatus::Error),
            _ => Err(format!("Invalid result status: {}", s)),
        }
    }
}

/// Message template
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub user_id: UserId,
    pub name: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub modified_date: DateTime<Utc>,
}

/// SMTP sending profile
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SendingProfile {
    pub id: ProfileId,
    pub user_id: UserId,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub from_address: String,
    pub ignore_cert_errors: bool,
    pub headers: serde_json::Value,
    pub modified_date: DateTime<Utc>,
}

impl SendingProfile {
    /// Custom headers as name/value pairs
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Twilio SMS profile
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SmsProfile {
    pub id: ProfileId,
    pub user_id: UserId,
    pub name: String,
    pub account_sid: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub from_number: String,
    pub modified_date: DateTime<Utc>,
}

/// Target group
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub user_id: UserId,
    pub name: String,
    pub group_type: String,
    pub is_active: bool,
    pub modified_date: DateTime<Utc>,
}

/// Target, globally unique by email
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
}

impl Target {
    pub fn recipient(&self) -> Recipient {
        Recipient {
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            position: self.position.clone(),
        }
    }
}

/// IDs written by one bulk insert, used for compensating cleanup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsertOutcome {
    /// Targets created by this insert
    pub added_targets: Vec<TargetId>,
    /// Targets newly linked to the group (link rows are keyed by target)
    pub added_links: Vec<TargetId>,
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    pub status: String,
    pub channel: String,
    pub attack_objective: String,
    pub redirect_url: String,
    pub url: String,
    pub landing_url: String,
    pub qr_size: String,
    pub template_id: TemplateId,
    pub page_id: Option<uuid::Uuid>,
    pub smtp_id: Option<ProfileId>,
    pub sms_id: Option<ProfileId>,
    pub created_date: DateTime<Utc>,
    pub launch_date: DateTime<Utc>,
    pub send_by_date: Option<DateTime<Utc>>,
    pub scheduled_stop_date: Option<DateTime<Utc>>,
    pub completed_date: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Get status enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// Get channel enum
    pub fn channel_enum(&self) -> Option<Channel> {
        self.channel.parse().ok()
    }

    pub fn is_tracking_only(&self) -> bool {
        self.attack_objective == OBJECTIVE_TRACKING_ONLY
    }
}

/// Campaign together with everything needed to generate its messages
#[derive(Debug, Clone, Serialize)]
pub struct CampaignContext {
    pub campaign: Campaign,
    pub template: Template,
    pub smtp: Option<SendingProfile>,
    pub sms: Option<SmsProfile>,
}

/// Per-recipient result
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignResult {
    pub id: ResultId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub r_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
    pub status: String,
    pub send_date: DateTime<Utc>,
    pub reported: bool,
    pub modified_date: DateTime<Utc>,
}

impl CampaignResult {
    /// Get status enum
    pub fn status_enum(&self) -> Option<ResultStatus> {
        self.status.parse().ok()
    }
}

/// A per-recipient delivery unit (mail or SMS log entry)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryUnit {
    pub id: DeliveryUnitId,
    pub campaign_id: CampaignId,
    pub result_id: ResultId,
    pub user_id: UserId,
    pub channel: String,
    pub send_date: DateTime<Utc>,
    pub send_attempt: i32,
    pub processing: bool,
    pub r_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub position: String,
    #[sqlx(skip)]
    #[serde(skip)]
    pub cached_campaign: Option<Arc<CampaignContext>>,
}

impl DeliveryUnit {
    /// Attach the campaign context so generation needs no per-unit lookup
    pub fn cache_campaign(&mut self, context: Arc<CampaignContext>) {
        self.cached_campaign = Some(context);
    }

    pub fn campaign(&self) -> Option<&CampaignContext> {
        self.cached_campaign.as_deref()
    }

    pub fn recipient(&self) -> Recipient {
        Recipient {
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            position: self.position.clone(),
        }
    }

    /// Get channel enum
    pub fn channel_enum(&self) -> Option<Channel> {
        self.channel.parse().ok()
    }
}

/// Result row to create with a campaign
#[derive(Debug, Clone)]
pub struct CreateResult {
    pub r_id: String,
    pub recipient: Recipient,
    pub send_date: DateTime<Utc>,
    /// Unit starts locked because it is sent at creation time
    pub processing: bool,
}

impl CreateResult {
    pub fn status(&self) -> ResultStatus {
        if self.processing {
            ResultStatus::Sending
        } else {
            ResultStatus::Scheduled
        }
    }
}

/// Create campaign input (already validated)
#[derive(Debug, Clone)]
pub struct CreateCampaign {
    pub user_id: UserId,
    pub name: String,
    pub status: CampaignStatus,
    pub channel: Channel,
    pub attack_objective: String,
    pub redirect_url: String,
    pub url: String,
    pub landing_url: String,
    pub qr_size: String,
    pub template_id: TemplateId,
    pub page_id: Option<uuid::Uuid>,
    pub smtp_id: Option<ProfileId>,
    pub sms_id: Option<ProfileId>,
    pub created_date: DateTime<Utc>,
    pub launch_date: DateTime<Utc>,
    pub send_by_date: Option<DateTime<Utc>>,
    pub scheduled_stop_date: Option<DateTime<Utc>>,
    pub results: Vec<CreateResult>,
}
