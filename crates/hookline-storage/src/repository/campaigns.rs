//! Campaign repository

use crate::db::DatabasePool;
use crate::models::{
    Campaign, CampaignContext, CampaignResult, CampaignStatus, CreateCampaign, SendingProfile,
    SmsProfile, Template,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookline_common::types::{CampaignId, UserId};
use hookline_common::{Error, Result};
use uuid::Uuid;

/// Campaign repository trait
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Insert a campaign with its results and delivery units in one transaction
    async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign>;

    /// Get a campaign by ID
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Load a campaign with its template and sending profile
    async fn get_campaign_context(&self, id: CampaignId) -> Result<Option<CampaignContext>>;

    /// Update campaign status
    async fn update_status(&self, id: CampaignId, status: CampaignStatus) -> Result<()>;

    /// Mark complete and purge pending units. An earlier completed date is kept.
    async fn complete_campaign(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>>;

    /// Delete a campaign with its results and units
    async fn delete_campaign(&self, id: CampaignId) -> Result<bool>;

    /// In-progress campaigns whose scheduled stop date is at or before `now`
    async fn get_expired(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>>;

    /// Results of a campaign
    async fn list_results(&self, campaign_id: CampaignId) -> Result<Vec<CampaignResult>>;

    async fn find_template_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Template>>;

    async fn find_sending_profile_by_name(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<SendingProfile>>;

    async fn find_sms_profile_by_name(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<SmsProfile>>;
}

/// Database campaign repository
#[derive(Clone)]
pub struct DbCampaignRepository {
    pool: DatabasePool,
}

impl DbCampaignRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignStore for DbCampaignRepository {
    async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, user_id, name, status, channel, attack_objective, redirect_url,
                url, landing_url, qr_size, template_id, page_id, smtp_id, sms_id,
                created_date, launch_date, send_by_date, scheduled_stop_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(&input.name)
        .bind(input.status.to_string())
        .bind(input.channel.to_string())
        .bind(&input.attack_objective)
        .bind(&input.redirect_url)
        .bind(&input.url)
        .bind(&input.landing_url)
        .bind(&input.qr_size)
        .bind(input.template_id)
        .bind(input.page_id)
        .bind(input.smtp_id)
        .bind(input.sms_id)
        .bind(input.created_date)
        .bind(input.launch_date)
        .bind(input.send_by_date)
        .bind(input.scheduled_stop_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        for result in &input.results {
            let result_id = Uuid::new_v4();

            sqlx::query(
                r#"
                INSERT INTO results (
                    id, campaign_id, user_id, r_id, email, first_name, last_name,
                    position, status, send_date, modified_date
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(result_id)
            .bind(campaign.id)
            .bind(input.user_id)
            .bind(&result.r_id)
            .bind(&result.recipient.email)
            .bind(&result.recipient.first_name)
            .bind(&result.recipient.last_name)
            .bind(&result.recipient.position)
            .bind(result.status().to_string())
            .bind(result.send_date)
            .bind(input.created_date)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO delivery_units (
                    id, campaign_id, result_id, user_id, channel, send_date, processing
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(campaign.id)
            .bind(result_id)
            .bind(input.user_id)
            .bind(input.channel.to_string())
            .bind(result.send_date)
            .bind(result.processing)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(campaign)
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_campaign_context(&self, id: CampaignId) -> Result<Option<CampaignContext>> {
        let Some(campaign) = self.get_campaign(id).await? else {
            return Ok(None);
        };

        let template = sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = $1")
            .bind(campaign.template_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?
            .ok_or_else(|| Error::NotFound(format!("template {}", campaign.template_id)))?;

        let smtp = match campaign.smtp_id {
            Some(smtp_id) => sqlx::query_as::<_, SendingProfile>(
                "SELECT * FROM sending_profiles WHERE id = $1",
            )
            .bind(smtp_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?,
            None => None,
        };

        let sms = match campaign.sms_id {
            Some(sms_id) => {
                sqlx::query_as::<_, SmsProfile>("SELECT * FROM sms_profiles WHERE id = $1")
                    .bind(sms_id)
                    .fetch_optional(self.pool.pool())
                    .await
                    .map_err(|e| Error::Database(e.to_string()))?
            }
            None => None,
        };

        Ok(Some(CampaignContext {
            campaign,
            template,
            smtp,
            sms,
        }))
    }

    async fn update_status(&self, id: CampaignId, status: CampaignStatus) -> Result<()> {
        sqlx::query("UPDATE campaigns SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.to_string())
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn complete_campaign(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query("DELETE FROM delivery_units WHERE campaign_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let campaign = sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = $2,
                completed_date = COALESCE(completed_date, $3)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(CampaignStatus::Complete.to_string())
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(campaign)
    }

    // results and delivery_units cascade
    async fn delete_campaign(&self, id: CampaignId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_expired(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE scheduled_stop_date IS NOT NULL
              AND scheduled_stop_date <= $1
              AND status = $2
            "#,
        )
        .bind(now)
        .bind(CampaignStatus::InProgress.to_string())
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_results(&self, campaign_id: CampaignId) -> Result<Vec<CampaignResult>> {
        sqlx::query_as::<_, CampaignResult>(
            "SELECT * FROM results WHERE campaign_id = $1 ORDER BY send_date ASC, email ASC",
        )
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_template_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE user_id = $1 AND name = $2")
            .bind(user_id)
            .bind(name)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_sending_profile_by_name(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<SendingProfile>> {
        sqlx::query_as::<_, SendingProfile>(
            "SELECT * FROM sending_profiles WHERE user_id = $1 AND name = $2",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_sms_profile_by_name(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<SmsProfile>> {
        sqlx::query_as::<_, SmsProfile>(
            "SELECT * FROM sms_profiles WHERE user_id = $1 AND name = $2",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
