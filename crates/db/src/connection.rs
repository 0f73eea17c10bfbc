use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::debug;

use nsmr_core::config::DatabaseConfig;

pub type DbPool = sqlx::SqlitePool;

pub async fn connect_with_config(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// Opens a pool with foreign keys, WAL and a busy timeout on every connection.
///
/// In-memory databases are private to one connection, so their pool is pinned to a
/// single connection that is never recycled.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let in_memory = is_in_memory(database_url);
    let max_connections = if in_memory { 1 } else { max_connections.max(1) };
    debug!(
        event_name = "db.pool.connect",
        in_memory,
        max_connections,
        "opening sqlite pool"
    );

    let mut options = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)));
    if in_memory {
        options = options.min_connections(1).idle_timeout(None).max_lifetime(None);
    }

    options
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await
}

pub fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::{connect_with_settings, is_in_memory};

    #[test]
    fn memory_urls_are_detected() {
        assert!(is_in_memory("sqlite::memory:"));
        assert!(is_in_memory("sqlite://nsmr?mode=memory"));
        assert!(!is_in_memory("sqlite://nsmr.db?mode=rwc"));
    }

    #[tokio::test]
    async fn memory_pool_keeps_a_single_shared_connection() {
        let pool = connect_with_settings("sqlite::memory:", 8, 30).await.expect("connect");
        sqlx::query("CREATE TABLE scratch (id INTEGER)").execute(&pool).await.expect("create");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scratch")
            .fetch_one(&pool)
            .await
            .expect("table visible through the pool");

        assert_eq!(count, 0);
        assert_eq!(pool.options().get_max_connections(), 1);
    }
}
