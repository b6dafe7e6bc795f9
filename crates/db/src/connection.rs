use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;

pub type DbPool = sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    // Every connection to `sqlite::memory:` opens its own database.
    let max_connections =
        if is_memory_url(database_url) { 1 } else { max_connections.max(1) };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&with_create_mode(database_url))
        .await
}

/// Round trip used by health and doctor checks.
pub async fn ping(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

pub fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn with_create_mode(database_url: &str) -> String {
    if is_memory_url(database_url) || database_url.contains("mode=") {
        return database_url.to_string();
    }
    let separator = if database_url.contains('?') { '&' } else { '?' };
    format!("{database_url}{separator}mode=rwc")
}

#[cfg(test)]
mod tests {
    use super::{connect_with_settings, is_memory_url, ping, with_create_mode};

    #[test]
    fn file_urls_get_create_mode_once() {
        assert_eq!(with_create_mode("sqlite://leadflow.db"), "sqlite://leadflow.db?mode=rwc");
        assert_eq!(with_create_mode("sqlite://leadflow.db?mode=ro"), "sqlite://leadflow.db?mode=ro");
        assert_eq!(with_create_mode("sqlite::memory:"), "sqlite::memory:");
        assert!(is_memory_url("sqlite::memory:"));
        assert!(!is_memory_url("sqlite://leadflow.db"));
    }

    #[tokio::test]
    async fn memory_pool_answers_ping() {
        let pool = connect_with_settings("sqlite::memory:", 8, 5).await.expect("connect");
        ping(&pool).await.expect("ping");
        assert_eq!(pool.options().get_max_connections(), 1);
        pool.close().await;
    }
}
