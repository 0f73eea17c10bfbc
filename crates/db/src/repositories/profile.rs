use chrono::{DateTime, Utc};

use nsmr_core::domain::identity::{Principal, UserProfile};

use super::{format_timestamp, ProfileRepository, RepositoryError};
use crate::DbPool;

pub struct SqlProfileRepository {
    pool: DbPool,
}

impl SqlProfileRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProfileRepository for SqlProfileRepository {
    async fn find(&self, identity: &Principal) -> Result<Option<UserProfile>, RepositoryError> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT name FROM user_profile WHERE principal = ?")
                .bind(identity.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(name.map(|name| UserProfile { name }))
    }

    async fn save(
        &self,
        identity: &Principal,
        profile: UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO user_profile (principal, name, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(principal) DO UPDATE SET
                 name = excluded.name,
                 updated_at = excluded.updated_at",
        )
        .bind(identity.as_str())
        .bind(&profile.name)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use nsmr_core::domain::identity::{Principal, UserProfile};

    use super::SqlProfileRepository;
    use crate::repositories::ProfileRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn save_overwrites_existing_profile() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let repo = SqlProfileRepository::new(pool);
        let identity = Principal::new("line-engineer");

        assert_eq!(repo.find(&identity).await.expect("missing"), None);

        repo.save(&identity, UserProfile { name: "Dana".to_owned() }, Utc::now())
            .await
            .expect("save");
        repo.save(&identity, UserProfile { name: "Dana R.".to_owned() }, Utc::now())
            .await
            .expect("overwrite");

        let found = repo.find(&identity).await.expect("find");
        assert_eq!(found.map(|profile| profile.name), Some("Dana R.".to_owned()));
    }
}
