//! Campaign Manager - Validates campaigns and schedules their delivery units

use super::allocator::SendWindow;
use super::context::{validate_template, ContextError};
use super::tracking::RedirectCipher;
use crate::token::random_token;
use chrono::{DateTime, Utc};
use hookline_common::types::{CampaignId, Recipient, UserId};
use hookline_storage::models::{
    Campaign, CampaignResult, CampaignStatus, Channel, CreateCampaign, CreateResult,
    OBJECTIVE_TRACKING_ONLY,
};
use hookline_storage::repository::{CampaignStore, GroupStore};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Length of generated result ids
const RID_LENGTH: usize = 10;

/// Campaign manager errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign name not specified")]
    NameMissing,

    #[error("No groups specified")]
    NoGroups,

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Selected groups have no targets")]
    NoTargets,

    #[error("Template not specified")]
    TemplateMissing,

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Campaign URL not specified")]
    UrlMissing,

    #[error("Sending profile not found: {0}")]
    SmtpNotFound(String),

    #[error("SMS profile not found: {0}")]
    SmsNotFound(String),

    #[error("Campaign send-by date must be after the launch date")]
    InvalidSendByDate,

    #[error("Invalid QR code size: {0}")]
    InvalidQrSize(String),

    #[error("Campaign not found")]
    NotFound,

    #[error("Invalid template: {0}")]
    Context(#[from] ContextError),

    #[error(transparent)]
    Store(#[from] hookline_common::Error),
}

impl CampaignError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            CampaignError::NotFound => 404,
            CampaignError::Store(e) => e.status_code(),
            _ => 422,
        }
    }
}

/// Campaign creation request. Template, profiles and groups are referenced
/// by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub channel: Channel,
    pub template: String,
    #[serde(default)]
    pub smtp: Option<String>,
    #[serde(default)]
    pub sms: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub landing_url: String,
    #[serde(default)]
    pub attack_objective: String,
    #[serde(default)]
    pub redirect_url: String,
    #[serde(default)]
    pub qr_size: String,
    #[serde(default)]
    pub page_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub launch_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub send_by_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_stop_date: Option<DateTime<Utc>>,
}

impl NewCampaign {
    /// Check the request on its own, before any lookups
    pub fn validate(&self) -> Result<(), CampaignError> {
        if self.name.trim().is_empty() {
            return Err(CampaignError::NameMissing);
        }
        if self.groups.is_empty() {
            return Err(CampaignError::NoGroups);
        }
        if self.template.trim().is_empty() {
            return Err(CampaignError::TemplateMissing);
        }
        if self.url.is_empty() && self.attack_objective != OBJECTIVE_TRACKING_ONLY {
            return Err(CampaignError::UrlMissing);
        }
        // Tracking only campaigns may omit the URL but still need a lure base
        if self.url.is_empty() && self.landing_url.is_empty() {
            return Err(CampaignError::UrlMissing);
        }
        match self.channel {
            Channel::Sms if self.sms.as_deref().map_or(true, str::is_empty) => {
                return Err(CampaignError::SmsNotFound(String::new()))
            }
            Channel::Email if self.smtp.as_deref().map_or(true, str::is_empty) => {
                return Err(CampaignError::SmtpNotFound(String::new()))
            }
            _ => {}
        }
        if let (Some(launch), Some(send_by)) = (self.launch_date, self.send_by_date) {
            if send_by < launch {
                return Err(CampaignError::InvalidSendByDate);
            }
        }
        if !self.qr_size.is_empty() && self.qr_size.parse::<u32>().map_or(true, |s| s == 0) {
            return Err(CampaignError::InvalidQrSize(self.qr_size.clone()));
        }
        Ok(())
    }
}

/// Campaign Manager - Manages campaign lifecycle
pub struct CampaignManager {
    campaigns: Arc<dyn CampaignStore>,
    groups: Arc<dyn GroupStore>,
    cipher: RedirectCipher,
}

impl CampaignManager {
    /// Create a new campaign manager
    pub fn new(
        campaigns: Arc<dyn CampaignStore>,
        groups: Arc<dyn GroupStore>,
        cipher: RedirectCipher,
    ) -> Self {
        Self {
            campaigns,
            groups,
            cipher,
        }
    }

    /// Validate, allocate send times and persist a campaign with one result
    /// and one delivery unit per distinct recipient
    pub async fn create_campaign(
        &self,
        user_id: UserId,
        request: NewCampaign,
    ) -> Result<Campaign, CampaignError> {
        self.create_campaign_at(user_id, request, Utc::now()).await
    }

    pub(crate) async fn create_campaign_at(
        &self,
        user_id: UserId,
        request: NewCampaign,
        created: DateTime<Utc>,
    ) -> Result<Campaign, CampaignError> {
        request.validate()?;

        let launch = request.launch_date.unwrap_or(created);
        if let Some(send_by) = request.send_by_date {
            if send_by < launch {
                return Err(CampaignError::InvalidSendByDate);
            }
        }
        let status = if launch <= created {
            CampaignStatus::InProgress
        } else {
            CampaignStatus::Queued
        };

        let template = self
            .campaigns
            .find_template_by_name(user_id, &request.template)
            .await?
            .ok_or_else(|| CampaignError::TemplateNotFound(request.template.clone()))?;

        let (smtp_id, sms_id) = match request.channel {
            Channel::Email => {
                let name = request.smtp.clone().unwrap_or_default();
                let profile = self
                    .campaigns
                    .find_sending_profile_by_name(user_id, &name)
                    .await?
                    .ok_or_else(|| CampaignError::SmtpNotFound(name.clone()))?;
                (Some(profile.id), None)
            }
            Channel::Sms => {
                let name = request.sms.clone().unwrap_or_default();
                let profile = self
                    .campaigns
                    .find_sms_profile_by_name(user_id, &name)
                    .await?
                    .ok_or_else(|| CampaignError::SmsNotFound(name.clone()))?;
                if template.text.is_empty() {
                    return Err(ContextError::MissingBody("text").into());
                }
                (None, Some(profile.id))
            }
        };

        validate_template(&template.subject, &self.cipher)?;
        validate_template(&template.text, &self.cipher)?;
        validate_template(&template.html, &self.cipher)?;

        let recipients = self.collect_recipients(user_id, &request.groups).await?;
        if recipients.is_empty() {
            return Err(CampaignError::NoTargets);
        }

        let window = SendWindow::new(launch, request.send_by_date);
        let total = recipients.len();
        let results = recipients
            .into_iter()
            .enumerate()
            .map(|(index, recipient)| {
                let send_date = window.send_date(index, total);
                CreateResult {
                    r_id: random_token(RID_LENGTH),
                    recipient,
                    send_date,
                    processing: send_date <= created,
                }
            })
            .collect();

        let campaign = self
            .campaigns
            .create_campaign(CreateCampaign {
                user_id,
                name: request.name,
                status,
                channel: request.channel,
                attack_objective: request.attack_objective,
                redirect_url: request.redirect_url,
                url: request.url,
                landing_url: request.landing_url,
                qr_size: request.qr_size,
                template_id: template.id,
                page_id: request.page_id,
                smtp_id,
                sms_id,
                created_date: created,
                launch_date: launch,
                send_by_date: request.send_by_date,
                scheduled_stop_date: request.scheduled_stop_date,
                results,
            })
            .await?;

        info!(
            campaign_id = %campaign.id,
            recipients = total,
            "Campaign created ({})",
            campaign.status
        );

        Ok(campaign)
    }

    // Targets of the named groups in group order, first occurrence of each
    // email wins
    async fn collect_recipients(
        &self,
        user_id: UserId,
        names: &[String],
    ) -> Result<Vec<Recipient>, CampaignError> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();

        for name in names {
            let group = self
                .groups
                .find_group_by_name(user_id, name)
                .await?
                .filter(|g| g.is_active)
                .ok_or_else(|| CampaignError::GroupNotFound(name.clone()))?;

            for target in self.groups.list_targets(group.id).await? {
                if seen.insert(target.email.to_lowercase()) {
                    recipients.push(target.recipient());
                }
            }
        }

        Ok(recipients)
    }

    /// Get a campaign owned by `user_id`
    pub async fn get_campaign(
        &self,
        user_id: UserId,
        id: CampaignId,
    ) -> Result<Campaign, CampaignError> {
        self.campaigns
            .get_campaign(id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or(CampaignError::NotFound)
    }

    /// Per-recipient results of a campaign
    pub async fn list_results(
        &self,
        user_id: UserId,
        id: CampaignId,
    ) -> Result<Vec<CampaignResult>, CampaignError> {
        self.get_campaign(user_id, id).await?;
        Ok(self.campaigns.list_results(id).await?)
    }

    /// Mark a campaign complete and drop its outstanding delivery units
    pub async fn complete_campaign(
        &self,
        user_id: UserId,
        id: CampaignId,
    ) -> Result<Campaign, CampaignError> {
        self.get_campaign(user_id, id).await?;
        let campaign = self
            .campaigns
            .complete_campaign(id, Utc::now())
            .await?
            .ok_or(CampaignError::NotFound)?;

        info!(campaign_id = %id, "Campaign completed");
        Ok(campaign)
    }

    /// Delete a campaign with its results and delivery units
    pub async fn delete_campaign(
        &self,
        user_id: UserId,
        id: CampaignId,
    ) -> Result<(), CampaignError> {
        self.get_campaign(user_id, id).await?;
        if !self.campaigns.delete_campaign(id).await? {
            return Err(CampaignError::NotFound);
        }

        info!(campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    /// Check that a template renders against the validation context
    pub fn validate_template(&self, text: &str) -> Result<(), CampaignError> {
        validate_template(text, &self.cipher)?;
        Ok(())
    }

    /// Recover the redirect target from an `rd` token
    pub fn decrypt_redirect(&self, token: &str) -> Result<String, CampaignError> {
        Ok(self.cipher.decrypt(token)?)
    }
}
