use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use nsmr_core::domain::identity::Principal;
use nsmr_core::domain::level::ApprovalLevel;

use super::{format_timestamp, ApproverRepository, RepositoryError};
use crate::DbPool;

pub struct SqlApproverRepository {
    pool: DbPool,
}

impl SqlApproverRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ApproverRepository for SqlApproverRepository {
    async fn assign(
        &self,
        level: ApprovalLevel,
        approver: &Principal,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let inserted = sqlx::query(
            "INSERT INTO level_approver (level, approver, assigned_at)
             VALUES (?, ?, ?)
             ON CONFLICT(level, approver) DO NOTHING",
        )
        .bind(i64::from(level))
        .bind(approver.as_str())
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn remove(
        &self,
        level: ApprovalLevel,
        approver: &Principal,
    ) -> Result<bool, RepositoryError> {
        let deleted = sqlx::query("DELETE FROM level_approver WHERE level = ? AND approver = ?")
            .bind(i64::from(level))
            .bind(approver.as_str())
            .execute(&self.pool)
            .await?;

        Ok(deleted.rows_affected() == 1)
    }

    async fn reassign(
        &self,
        level: ApprovalLevel,
        approvers: &BTreeSet<Principal>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let assigned_at = format_timestamp(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM level_approver WHERE level = ?")
            .bind(i64::from(level))
            .execute(&mut *tx)
            .await?;

        for approver in approvers {
            sqlx::query("INSERT INTO level_approver (level, approver, assigned_at) VALUES (?, ?, ?)")
                .bind(i64::from(level))
                .bind(approver.as_str())
                .bind(&assigned_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn is_approver(
        &self,
        level: ApprovalLevel,
        identity: &Principal,
    ) -> Result<bool, RepositoryError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM level_approver WHERE level = ? AND approver = ?)",
        )
        .bind(i64::from(level))
        .bind(identity.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists == 1)
    }

    async fn approvers_of(
        &self,
        level: ApprovalLevel,
    ) -> Result<BTreeSet<Principal>, RepositoryError> {
        let approvers: Vec<String> =
            sqlx::query_scalar("SELECT approver FROM level_approver WHERE level = ? ORDER BY approver")
                .bind(i64::from(level))
                .fetch_all(&self.pool)
                .await?;

        Ok(approvers.into_iter().map(Principal).collect())
    }
}
