use tracing::{debug, instrument};

use super::core::Database;
use crate::{now_ts, TARGET_DB};

impl Database {
    /// Takes the named lock if it is free or its lease has run out. Never waits.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl_secs: i64,
    ) -> Result<bool, sqlx::Error> {
        let now = now_ts();
        let result = sqlx::query(
            r#"
            INSERT INTO named_locks (name, holder, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE
            SET holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE named_locks.expires_at <= ?3
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now)
        .bind(now + ttl_secs)
        .execute(self.pool())
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(target: TARGET_DB, "Lock {} requested by {}: acquired={}", name, holder, acquired);
        Ok(acquired)
    }

    /// Releases the lock if `holder` still owns it.
    pub async fn release_lock(&self, name: &str, holder: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM named_locks WHERE name = ?1 AND holder = ?2")
            .bind(name)
            .bind(holder)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
