//! Group and target repository

use crate::db::DatabasePool;
use crate::models::{BulkInsertOutcome, Group, Target};
use async_trait::async_trait;
use chrono::Utc;
use hookline_common::types::{GroupId, Recipient, TargetId, UserId};
use hookline_common::{Error, Result};
use tracing::debug;
use uuid::Uuid;

/// Group repository trait
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn get_group(&self, id: GroupId) -> Result<Option<Group>>;

    async fn find_group_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Group>>;

    /// Create an inactive group with no targets
    async fn create_group_shell(
        &self,
        user_id: UserId,
        name: &str,
        group_type: &str,
    ) -> Result<Group>;

    /// Update type (and name, when given) of an existing group
    async fn update_group(&self, id: GroupId, name: Option<&str>, group_type: &str) -> Result<()>;

    async fn set_group_active(&self, id: GroupId, active: bool) -> Result<()>;

    /// Delete a group and its links. Targets are kept.
    async fn delete_group(&self, id: GroupId) -> Result<()>;

    /// Targets linked to a group
    async fn list_targets(&self, group_id: GroupId) -> Result<Vec<Target>>;

    /// Targets by ID; missing IDs are skipped
    async fn get_targets(&self, ids: &[TargetId]) -> Result<Vec<Target>>;

    /// Insert targets (reusing existing rows by email) and link them to the
    /// group in one transaction
    async fn bulk_insert_targets(
        &self,
        group_id: GroupId,
        targets: &[Recipient],
    ) -> Result<BulkInsertOutcome>;

    /// Remove the links between a group and the given targets
    async fn delete_group_links(&self, group_id: GroupId, target_ids: &[TargetId]) -> Result<u64>;

    async fn delete_targets(&self, ids: &[TargetId]) -> Result<u64>;
}

/// Database group repository
#[derive(Clone)]
pub struct DbGroupRepository {
    pool: DatabasePool,
}

impl DbGroupRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupStore for DbGroupRepository {
    async fn get_group(&self, id: GroupId) -> Result<Option<Group>> {
        sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_group_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Group>> {
        sqlx::query_as::<_, Group>(
            r#"
            SELECT * FROM groups
            WHERE user_id = $1 AND name = $2
            ORDER BY modified_date DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn create_group_shell(
        &self,
        user_id: UserId,
        name: &str,
        group_type: &str,
    ) -> Result<Group> {
        sqlx::query_as::<_, Group>(
            r#"
            INSERT INTO groups (id, user_id, name, group_type, is_active, modified_date)
            VALUES ($1, $2, $3, $4, FALSE, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(name)
        .bind(group_type)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update_group(&self, id: GroupId, name: Option<&str>, group_type: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE groups SET
                name = COALESCE($2, name),
                group_type = $3,
                modified_date = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(group_type)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn set_group_active(&self, id: GroupId, active: bool) -> Result<()> {
        let result =
            sqlx::query("UPDATE groups SET is_active = $2, modified_date = NOW() WHERE id = $1")
                .bind(id)
                .bind(active)
                .execute(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("group {}", id)));
        }
        Ok(())
    }

    // group_targets rows cascade
    async fn delete_group(&self, id: GroupId) -> Result<()> {
        sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_targets(&self, group_id: GroupId) -> Result<Vec<Target>> {
        sqlx::query_as::<_, Target>(
            r#"
            SELECT t.id, t.email, t.first_name, t.last_name, t.position
            FROM targets t
            JOIN group_targets gt ON gt.target_id = t.id
            WHERE gt.group_id = $1
            ORDER BY t.email ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get_targets(&self, ids: &[TargetId]) -> Result<Vec<Target>> {
        sqlx::query_as::<_, Target>("SELECT * FROM targets WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn bulk_insert_targets(
        &self,
        group_id: GroupId,
        targets: &[Recipient],
    ) -> Result<BulkInsertOutcome> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut outcome = BulkInsertOutcome::default();

        for target in targets {
            let inserted: Option<TargetId> = sqlx::query_scalar(
                r#"
                INSERT INTO targets (id, email, first_name, last_name, position)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (email) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&target.email)
            .bind(&target.first_name)
            .bind(&target.last_name)
            .bind(&target.position)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            let target_id = match inserted {
                Some(id) => {
                    outcome.added_targets.push(id);
                    id
                }
                None => sqlx::query_scalar("SELECT id FROM targets WHERE email = $1")
                    .bind(&target.email)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| Error::Database(e.to_string()))?,
            };

            let linked = sqlx::query(
                r#"
                INSERT INTO group_targets (group_id, target_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(group_id)
            .bind(target_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            if linked.rows_affected() > 0 {
                outcome.added_links.push(target_id);
            }
        }

        debug!(
            group_id = %group_id,
            added_targets = outcome.added_targets.len(),
            added_links = outcome.added_links.len(),
            "Bulk inserted targets"
        );

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(outcome)
    }

    async fn delete_group_links(&self, group_id: GroupId, target_ids: &[TargetId]) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM group_targets WHERE group_id = $1 AND target_id = ANY($2)",
        )
        .bind(group_id)
        .bind(target_ids)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn delete_targets(&self, ids: &[TargetId]) -> Result<u64> {
        let result = sqlx::query("DELETE FROM targets WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
