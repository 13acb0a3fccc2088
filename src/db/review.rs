use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use super::core::{retry_on_lock, Database};
use crate::review::Disposition;
use crate::{now_ts, TARGET_DB};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ManualReview {
    pub summary_id: i64,
    pub status: String,
    pub summary_override: Option<String>,
    pub source_override: Option<String>,
    pub sort_rank: Option<i64>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub updated_by: Option<String>,
    pub decided_at: Option<i64>,
}

/// Fields a reviewer write may touch. `None` leaves the column as is; an empty override
/// string clears the override.
#[derive(Debug, Clone, Default)]
pub struct ReviewChange {
    pub status: Option<Disposition>,
    pub summary_override: Option<String>,
    pub source_override: Option<String>,
    pub sort_rank: Option<i64>,
    /// Only apply while the row still has this disposition.
    pub require_status: Option<Disposition>,
}

#[derive(Debug, Clone)]
pub struct ReviewUpdate {
    pub summary_id: i64,
    pub change: ReviewChange,
    pub expected_version: Option<i64>,
}

/// Result of one compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewWrite {
    Applied { version: i64 },
    Conflict { current_version: i64 },
    NotFound,
}

impl ReviewWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, ReviewWrite::Applied { .. })
    }
}

/// Conditional update of one review row: succeeds when `expected_version` is absent or equal to
/// the stored version, bumping the version by one.
pub(crate) async fn write_review(
    conn: &mut SqliteConnection,
    update: &ReviewUpdate,
    actor: Option<&str>,
) -> Result<ReviewWrite, sqlx::Error> {
    let change = &update.change;
    let version: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE manual_reviews
        SET status = COALESCE(?1, status),
            decided_at = CASE
                WHEN ?1 IS NULL THEN decided_at
                WHEN ?1 = 'pending' THEN NULL
                ELSE ?5
            END,
            summary_override = CASE
                WHEN ?2 IS NULL THEN summary_override
                WHEN ?2 = '' THEN NULL
                ELSE ?2
            END,
            source_override = CASE
                WHEN ?3 IS NULL THEN source_override
                WHEN ?3 = '' THEN NULL
                ELSE ?3
            END,
            sort_rank = COALESCE(?4, sort_rank),
            version = version + 1,
            updated_at = ?5,
            updated_by = ?6
        WHERE summary_id = ?7
          AND (?8 IS NULL OR version = ?8)
          AND (?9 IS NULL OR status = ?9)
        RETURNING version
        "#,
    )
    .bind(change.status.map(|d| d.as_str()))
    .bind(change.summary_override.as_deref())
    .bind(change.source_override.as_deref())
    .bind(change.sort_rank)
    .bind(now_ts())
    .bind(actor)
    .bind(update.summary_id)
    .bind(update.expected_version)
    .bind(change.require_status.map(|d| d.as_str()))
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(version) = version {
        return Ok(ReviewWrite::Applied { version });
    }

    let current: Option<i64> =
        sqlx::query_scalar("SELECT version FROM manual_reviews WHERE summary_id = ?1")
            .bind(update.summary_id)
            .fetch_optional(&mut *conn)
            .await?;

    Ok(match current {
        Some(current_version) => ReviewWrite::Conflict { current_version },
        None => ReviewWrite::NotFound,
    })
}

impl Database {
    pub async fn get_review(&self, summary_id: i64) -> Result<Option<ManualReview>, sqlx::Error> {
        sqlx::query_as::<_, ManualReview>("SELECT * FROM manual_reviews WHERE summary_id = ?1")
            .bind(summary_id)
            .fetch_optional(self.pool())
            .await
    }

    /// Applies one reviewer write on its own.
    #[instrument(target = "db", level = "debug", skip(self, update))]
    pub async fn update_review(
        &self,
        update: &ReviewUpdate,
        actor: Option<&str>,
    ) -> Result<ReviewWrite, sqlx::Error> {
        retry_on_lock("update_review", || async move {
            let mut conn = self.pool().acquire().await?;
            write_review(&mut conn, update, actor).await
        })
        .await
    }

    /// Applies every update inside one transaction, stopping and rolling back at the first one
    /// that is not applied. The returned list ends with that failing write; on success it has
    /// one entry per update and everything is committed.
    #[instrument(target = "db", level = "info", skip(self, updates), fields(count = updates.len()))]
    pub async fn update_reviews_atomically(
        &self,
        updates: &[ReviewUpdate],
        actor: Option<&str>,
    ) -> Result<Vec<ReviewWrite>, sqlx::Error> {
        retry_on_lock("update_reviews_atomically", || async move {
            let mut transaction = self.pool().begin().await?;
            let mut results = Vec::with_capacity(updates.len());

            for update in updates {
                let result = write_review(&mut transaction, update, actor).await?;
                results.push(result);
                if !result.is_applied() {
                    transaction.rollback().await?;
                    debug!(target: TARGET_DB, "Review batch rolled back at summary {}", update.summary_id);
                    return Ok(results);
                }
            }

            transaction.commit().await?;
            Ok(results)
        })
        .await
    }
}
