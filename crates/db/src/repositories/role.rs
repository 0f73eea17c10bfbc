use chrono::{DateTime, Utc};

use nsmr_core::domain::identity::{Principal, UserRole};

use super::{format_timestamp, RepositoryError, RoleRepository};
use crate::DbPool;

pub struct SqlRoleRepository {
    pool: DbPool,
}

impl SqlRoleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RoleRepository for SqlRoleRepository {
    async fn role_of(&self, identity: &Principal) -> Result<Option<UserRole>, RepositoryError> {
        let stored: Option<String> =
            sqlx::query_scalar("SELECT role FROM user_role WHERE principal = ?")
                .bind(identity.as_str())
                .fetch_optional(&self.pool)
                .await?;

        stored
            .map(|raw| {
                UserRole::parse(&raw)
                    .ok_or_else(|| RepositoryError::Decode(format!("unknown role `{raw}`")))
            })
            .transpose()
    }

    async fn set_role(
        &self,
        identity: &Principal,
        role: UserRole,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO user_role (principal, role, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(principal) DO UPDATE SET
                 role = excluded.role,
                 updated_at = excluded.updated_at",
        )
        .bind(identity.as_str())
        .bind(role.as_str())
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
