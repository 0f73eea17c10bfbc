use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Number of forward migrations embedded in the binary.
pub fn embedded_count() -> i64 {
    MIGRATOR.iter().filter(|migration| !migration.migration_type.is_down_migration()).count() as i64
}

/// Number of migrations recorded as applied in `_sqlx_migrations`.
pub async fn applied_count(pool: &DbPool) -> Result<i64, sqlx::Error> {
    let table_exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?;
    if table_exists == 0 {
        return Ok(0);
    }

    sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::{applied_count, embedded_count, run_pending};
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "manufacturing_request",
        "approval_record",
        "level_approver",
        "user_role",
        "user_profile",
        "idx_manufacturing_request_creator",
        "idx_manufacturing_request_status_level",
        "idx_level_approver_approver",
    ];

    async fn table_count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(table)
        .fetch_one(pool)
        .await
        .expect("check table")
    }

    #[tokio::test]
    async fn migrations_create_baseline_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        assert_eq!(applied_count(&pool).await.expect("count before"), 0);

        run_pending(&pool).await.expect("run migrations");

        for table in
            ["manufacturing_request", "approval_record", "level_approver", "user_role", "user_profile"]
        {
            assert_eq!(table_count(&pool, table).await, 1, "table `{table}` should exist");
        }
        assert_eq!(applied_count(&pool).await.expect("count after"), embedded_count());
    }

    #[tokio::test]
    async fn level_bounds_are_enforced_by_schema() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let outcome = sqlx::query(
            "INSERT INTO level_approver (level, approver, assigned_at) VALUES (8, 'u-1', 'now')",
        )
        .execute(&pool)
        .await;

        assert!(outcome.is_err(), "level 8 must violate the check constraint");
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        let after_down_signature = managed_schema_signature(&pool).await;
        assert!(
            after_down_signature.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");

        let after_second_up_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            after_second_up_signature, initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects");

        let mut signature: Vec<(String, String, String)> = rows
            .into_iter()
            .filter(|(_, name, _)| MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()))
            .collect();
        signature.sort();
        signature
    }
}
