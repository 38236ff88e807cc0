//! Delivery unit repository

use crate::db::DatabasePool;
use crate::models::{DeliveryUnit, ResultStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookline_common::types::{CampaignId, DeliveryUnitId};
use hookline_common::{Error, Result};
use tracing::debug;

/// Queue of per-recipient delivery units.
///
/// A unit with `processing = true` is held by exactly one worker and is
/// invisible to [`get_queued`](DeliveryUnitStore::get_queued) until it is
/// unlocked, rescheduled, or removed by a success/error callback.
#[async_trait]
pub trait DeliveryUnitStore: Send + Sync {
    /// Units with `send_date <= before` that are not locked
    async fn get_queued(&self, before: DateTime<Utc>) -> Result<Vec<DeliveryUnit>>;

    /// Lock (or release) units. Returns the IDs whose flag actually changed,
    /// so a unit already held by another caller is never returned twice.
    async fn lock_units(&self, ids: &[DeliveryUnitId], lock: bool) -> Result<Vec<DeliveryUnitId>>;

    /// Fetch due units and lock them, keeping only those this caller won
    async fn claim_due(&self, before: DateTime<Utc>) -> Result<Vec<DeliveryUnit>> {
        let queued = self.get_queued(before).await?;
        if queued.is_empty() {
            return Ok(queued);
        }

        let ids: Vec<DeliveryUnitId> = queued.iter().map(|u| u.id).collect();
        let won = self.lock_units(&ids, true).await?;

        Ok(queued
            .into_iter()
            .filter(|u| won.contains(&u.id))
            .map(|mut u| {
                u.processing = true;
                u
            })
            .collect())
    }

    /// Hand the units locked when a campaign was created (`send_attempt = 0`,
    /// `send_date <= created`) to one launcher. Each unit is handed over at
    /// most once; a second caller gets an empty list.
    async fn take_over_launch(
        &self,
        campaign_id: CampaignId,
        created: DateTime<Utc>,
    ) -> Result<Vec<DeliveryUnitId>>;

    /// Campaigns that still hold creation-locked units nobody has launched
    async fn pending_launches(&self) -> Result<Vec<CampaignId>>;

    /// Release a claimed unit without sending it
    async fn unlock(&self, id: DeliveryUnitId) -> Result<()>;

    /// Record a successful send: result becomes `sent`, unit is removed
    async fn mark_success(&self, unit: &DeliveryUnit) -> Result<()>;

    /// Record a permanent failure: result becomes `error`, unit is removed
    async fn mark_error(&self, unit: &DeliveryUnit) -> Result<()>;

    /// Record a transient failure: bump the attempt counter, move the send
    /// date, mark the result `retrying`, and release the lock
    async fn backoff(&self, unit: &DeliveryUnit, next_send: DateTime<Utc>) -> Result<()>;

    /// All units of a campaign, locked or not
    async fn list_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<DeliveryUnit>>;
}

const UNIT_COLUMNS: &str = r#"
    u.id, u.campaign_id, u.result_id, u.user_id, u.channel, u.send_date,
    u.send_attempt, u.processing,
    r.r_id, r.email, r.first_name, r.last_name, r.position
"#;

/// Database delivery unit repository
#[derive(Clone)]
pub struct DbDeliveryUnitRepository {
    pool: DatabasePool,
}

impl DbDeliveryUnitRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn finish(&self, unit: &DeliveryUnit, status: ResultStatus) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query("UPDATE results SET status = $2, modified_date = NOW() WHERE id = $1")
            .bind(unit.result_id)
            .bind(status.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query("DELETE FROM delivery_units WHERE id = $1")
            .bind(unit.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl DeliveryUnitStore for DbDeliveryUnitRepository {
    async fn get_queued(&self, before: DateTime<Utc>) -> Result<Vec<DeliveryUnit>> {
        sqlx::query_as::<_, DeliveryUnit>(&format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM delivery_units u
            JOIN results r ON r.id = u.result_id
            WHERE u.send_date <= $1
              AND u.processing = FALSE
            ORDER BY u.send_date ASC
            "#
        ))
        .bind(before)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn lock_units(&self, ids: &[DeliveryUnitId], lock: bool) -> Result<Vec<DeliveryUnitId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_scalar::<_, DeliveryUnitId>(
            r#"
            UPDATE delivery_units SET processing = $2
            WHERE id = ANY($1) AND processing = $3
            RETURNING id
            "#,
        )
        .bind(ids)
        .bind(lock)
        .bind(!lock)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    // Single statement: rows held by a concurrent claimer are skipped, not waited on.
    async fn claim_due(&self, before: DateTime<Utc>) -> Result<Vec<DeliveryUnit>> {
        let units = sqlx::query_as::<_, DeliveryUnit>(&format!(
            r#"
            WITH due AS (
                SELECT id FROM delivery_units
                WHERE send_date <= $1 AND processing = FALSE
                ORDER BY send_date ASC
                FOR UPDATE SKIP LOCKED
            )
            UPDATE delivery_units u SET processing = TRUE
            FROM due, results r
            WHERE u.id = due.id AND r.id = u.result_id
            RETURNING {UNIT_COLUMNS}
            "#
        ))
        .bind(before)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        debug!(count = units.len(), "Claimed due delivery units");
        Ok(units)
    }

    async fn take_over_launch(
        &self,
        campaign_id: CampaignId,
        created: DateTime<Utc>,
    ) -> Result<Vec<DeliveryUnitId>> {
        sqlx::query_scalar::<_, DeliveryUnitId>(
            r#"
            UPDATE delivery_units SET launched = TRUE
            WHERE campaign_id = $1
              AND processing = TRUE
              AND launched = FALSE
              AND send_attempt = 0
              AND send_date <= $2
            RETURNING id
            "#,
        )
        .bind(campaign_id)
        .bind(created)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn pending_launches(&self) -> Result<Vec<CampaignId>> {
        sqlx::query_scalar::<_, CampaignId>(
            r#"
            SELECT DISTINCT u.campaign_id
            FROM delivery_units u
            JOIN campaigns c ON c.id = u.campaign_id
            WHERE u.processing = TRUE
              AND u.launched = FALSE
              AND u.send_attempt = 0
              AND u.send_date <= c.created_date
            "#,
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn unlock(&self, id: DeliveryUnitId) -> Result<()> {
        sqlx::query("UPDATE delivery_units SET processing = FALSE WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_success(&self, unit: &DeliveryUnit) -> Result<()> {
        self.finish(unit, ResultStatus::Sent).await
    }

    async fn mark_error(&self, unit: &DeliveryUnit) -> Result<()> {
        self.finish(unit, ResultStatus::Error).await
    }

    async fn backoff(&self, unit: &DeliveryUnit, next_send: DateTime<Utc>) -> Result<()> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE delivery_units SET
                send_attempt = send_attempt + 1,
                send_date = $2,
                processing = FALSE
            WHERE id = $1
            "#,
        )
        .bind(unit.id)
        .bind(next_send)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::query(
            "UPDATE results SET status = $2, send_date = $3, modified_date = NOW() WHERE id = $1",
        )
        .bind(unit.result_id)
        .bind(ResultStatus::Retrying.to_string())
        .bind(next_send)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<DeliveryUnit>> {
        sqlx::query_as::<_, DeliveryUnit>(&format!(
            r#"
            SELECT {UNIT_COLUMNS}
            FROM delivery_units u
            JOIN results r ON r.id = u.result_id
            WHERE u.campaign_id = $1
            ORDER BY u.send_date ASC
            "#
        ))
        .bind(campaign_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}
