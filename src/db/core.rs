use rand::Rng;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::future::Future;
use std::str::FromStr;
use tokio::time::{sleep, Duration};
use tracing::{info, instrument, warn};

use crate::TARGET_DB;

#[derive(Clone, Debug)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Get access to the database pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

// Helper method to check if an sqlx error is a database lock error
pub trait DbLockErrorExt {
    fn is_database_lock_error(&self) -> bool;
}

impl DbLockErrorExt for sqlx::Error {
    fn is_database_lock_error(&self) -> bool {
        match self {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
            sqlx::Error::Database(err) => {
                err.code()
                    .and_then(|c| c.parse::<i32>().ok())
                    .map_or(false, |c| c & 0xff == 5 || c & 0xff == 6)
                    || err.message().contains("database is locked")
            }
            _ => false,
        }
    }
}

/// Runs `op`, retrying with exponential backoff while SQLite reports the database as locked.
pub(crate) async fn retry_on_lock<T, F, Fut>(what: &str, mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut backoff = 100; // initial delay in milliseconds
    let max_retries = 5;

    for attempt in 1..=max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_database_lock_error() && attempt < max_retries => {
                info!(target: TARGET_DB, "Database is locked, waiting {}ms before retrying attempt {}/{}: {}", backoff, attempt, max_retries, what);
                let jitter = rand::rng().random_range(0..50);
                sleep(Duration::from_millis(backoff + jitter)).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => {
                warn!(target: TARGET_DB, "{} failed: {}", what, err);
                return Err(err);
            }
        }
    }

    Err(sqlx::Error::Protocol(format!(
        "Maximum retries exceeded for {}",
        what
    )))
}

impl Database {
    #[instrument(target = "db", level = "info")]
    pub async fn new(database_path: &str) -> Result<Self, sqlx::Error> {
        info!(target: TARGET_DB, "Creating database pool for: {}", database_path);

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .synchronous(SqliteSynchronous::Normal)
                .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        info!(target: TARGET_DB, "Database pool created");

        let db = Database { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Single-connection in-memory database with the full schema, for tests and dry runs.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        // Every connection to :memory: is a separate database, so keep exactly one.
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;

        let db = Database { pool };
        db.initialize_schema().await?;
        Ok(db)
    }

    /// Row counts per table and status, for operator tooling.
    pub async fn collect_stats(&self) -> Result<Vec<(String, String, i64)>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            r#"
            SELECT 'raw_articles', CASE WHEN filter_checked = 1 THEN 'checked' ELSE 'unchecked' END, COUNT(*)
            FROM raw_articles GROUP BY 2
            UNION ALL
            SELECT 'filtered_articles', status, COUNT(*) FROM filtered_articles GROUP BY status
            UNION ALL
            SELECT 'primary_articles', status, COUNT(*) FROM primary_articles GROUP BY status
            UNION ALL
            SELECT 'news_summaries', status, COUNT(*) FROM news_summaries GROUP BY status
            UNION ALL
            SELECT 'manual_reviews', status, COUNT(*) FROM manual_reviews GROUP BY status
            UNION ALL
            SELECT 'cluster_index', bucket, COUNT(*) FROM cluster_index GROUP BY bucket
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}
