use serde::Serialize;
use sqlx::Row;
use tracing::{debug, instrument, warn};

use super::core::{retry_on_lock, Database};
use crate::fingerprint::{simhash_from_db, simhash_to_db, Fingerprint, SIMHASH_BANDS};
use crate::{now_ts, TARGET_DB};

/// Resolution state of a filtered article.
pub const STATUS_UNRESOLVED: &str = "unresolved";
pub const STATUS_PRIMARY: &str = "primary";
pub const STATUS_DUPLICATE: &str = "duplicate";
/// No usable fingerprint; never retried automatically.
pub const STATUS_UNRESOLVED_SKIPPED: &str = "unresolved_skipped";

#[derive(Debug, Clone, Serialize)]
pub struct FilteredArticle {
    pub id: i64,
    pub raw_article_id: i64,
    pub matched_keywords: Vec<String>,
    pub content_hash: Option<String>,
    pub simhash: Option<u64>,
    pub primary_article_id: Option<i64>,
    pub status: String,
    pub created_at: i64,
}

/// A stored article that shares a SimHash band with the one being resolved.
#[derive(Debug, Clone)]
pub struct BandCandidate {
    pub id: i64,
    pub simhash: u64,
    pub primary_article_id: i64,
}

fn row_to_filtered(row: &sqlx::sqlite::SqliteRow) -> FilteredArticle {
    let keywords_json: String = row.get("matched_keywords");
    FilteredArticle {
        id: row.get("id"),
        raw_article_id: row.get("raw_article_id"),
        matched_keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
        content_hash: row.get("content_hash"),
        simhash: row.get::<Option<i64>, _>("simhash").map(simhash_from_db),
        primary_article_id: row.get("primary_article_id"),
        status: row.get("status"),
        created_at: row.get("created_at"),
    }
}

impl Database {
    /// Creates the filtered record for a keyword-matching raw article. Returns the existing id
    /// if the raw article was already filtered.
    #[instrument(target = "db", level = "info", skip(self, matched_keywords, fingerprint))]
    pub async fn add_filtered_article(
        &self,
        raw_article_id: i64,
        matched_keywords: &[String],
        fingerprint: Option<&Fingerprint>,
    ) -> Result<i64, sqlx::Error> {
        let keywords_json = serde_json::to_string(matched_keywords)
            .map_err(|e| sqlx::Error::Protocol(format!("keyword encoding failed: {}", e)))?;
        let keywords_json = keywords_json.as_str();
        let bands: [Option<i64>; SIMHASH_BANDS] = match fingerprint {
            Some(fp) => fp.bands().map(Some),
            None => [None; SIMHASH_BANDS],
        };
        let bands = &bands;
        let created_at = now_ts();

        let inserted = retry_on_lock("add_filtered_article", || async move {
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO filtered_articles (
                    raw_article_id, matched_keywords, content_hash, simhash,
                    simhash_band0, simhash_band1, simhash_band2, simhash_band3,
                    status, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(raw_article_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(raw_article_id)
            .bind(keywords_json)
            .bind(fingerprint.map(|fp| fp.content_hash.as_str()))
            .bind(fingerprint.map(|fp| simhash_to_db(fp.simhash)))
            .bind(bands[0])
            .bind(bands[1])
            .bind(bands[2])
            .bind(bands[3])
            .bind(STATUS_UNRESOLVED)
            .bind(created_at)
            .fetch_optional(self.pool())
            .await
        })
        .await?;

        match inserted {
            Some(id) => Ok(id),
            None => {
                sqlx::query_scalar("SELECT id FROM filtered_articles WHERE raw_article_id = ?1")
                    .bind(raw_article_id)
                    .fetch_one(self.pool())
                    .await
            }
        }
    }

    pub async fn get_filtered_article(
        &self,
        id: i64,
    ) -> Result<Option<FilteredArticle>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM filtered_articles WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(row_to_filtered))
    }

    /// Articles awaiting primary resolution, in creation order.
    pub async fn fetch_unresolved_filtered(
        &self,
        limit: i64,
    ) -> Result<Vec<FilteredArticle>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM filtered_articles
            WHERE status = ?1
            ORDER BY created_at ASC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(STATUS_UNRESOLVED)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(row_to_filtered).collect())
    }

    /// The earliest-created primary among resolved articles with this content hash.
    pub async fn find_primary_by_content_hash(
        &self,
        content_hash: &str,
        exclude_id: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT p.id
            FROM filtered_articles f
            JOIN filtered_articles p ON p.id = f.primary_article_id
            WHERE f.content_hash = ?1 AND f.id != ?2 AND f.primary_article_id IS NOT NULL
            ORDER BY p.created_at ASC, p.id ASC
            LIMIT 1
            "#,
        )
        .bind(content_hash)
        .bind(exclude_id)
        .fetch_optional(self.pool())
        .await
    }

    /// Resolved articles sharing at least one SimHash band, ordered by their primary's age.
    pub async fn find_band_candidates(
        &self,
        bands: &[i64; SIMHASH_BANDS],
        exclude_id: i64,
    ) -> Result<Vec<BandCandidate>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT f.id, f.simhash, f.primary_article_id
            FROM filtered_articles f
            JOIN filtered_articles p ON p.id = f.primary_article_id
            WHERE f.id != ?5
              AND f.simhash IS NOT NULL
              AND (f.simhash_band0 = ?1 OR f.simhash_band1 = ?2
                   OR f.simhash_band2 = ?3 OR f.simhash_band3 = ?4)
            ORDER BY p.created_at ASC, p.id ASC, f.id ASC
            "#,
        )
        .bind(bands[0])
        .bind(bands[1])
        .bind(bands[2])
        .bind(bands[3])
        .bind(exclude_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| BandCandidate {
                id: row.get("id"),
                simhash: simhash_from_db(row.get("simhash")),
                primary_article_id: row.get("primary_article_id"),
            })
            .collect())
    }

    /// Makes the article its own primary and creates the `primary_articles` row.
    /// Returns false if the article already had a primary.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn establish_primary(&self, filtered_id: i64) -> Result<bool, sqlx::Error> {
        let mut transaction = self.pool().begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE filtered_articles
            SET primary_article_id = id, status = ?1
            WHERE id = ?2 AND primary_article_id IS NULL
            "#,
        )
        .bind(STATUS_PRIMARY)
        .bind(filtered_id)
        .execute(&mut *transaction)
        .await?;

        if updated.rows_affected() == 0 {
            transaction.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO primary_articles (id, title, body, source, url, matched_keywords, published_at, created_at)
            SELECT f.id, r.title, COALESCE(r.body, ''), r.source, r.url, f.matched_keywords, r.published_at, ?2
            FROM filtered_articles f
            JOIN raw_articles r ON r.id = f.raw_article_id
            WHERE f.id = ?1
            "#,
        )
        .bind(filtered_id)
        .bind(now_ts())
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        debug!(target: TARGET_DB, "Filtered article {} established as primary", filtered_id);
        Ok(true)
    }

    /// Points the article at `primary_id`'s root primary. The target is re-rooted inside the
    /// transaction so a pointer never lands on a duplicate. Returns the primary actually used,
    /// or `None` if the article already had a primary.
    #[instrument(target = "db", level = "info", skip(self))]
    pub async fn attach_to_primary(
        &self,
        filtered_id: i64,
        primary_id: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        let mut transaction = self.pool().begin().await?;

        let root: Option<i64> = sqlx::query_scalar(
            "SELECT primary_article_id FROM filtered_articles WHERE id = ?1",
        )
        .bind(primary_id)
        .fetch_optional(&mut *transaction)
        .await?
        .flatten();

        let root = match root {
            Some(root) => root,
            None => {
                transaction.rollback().await?;
                return Err(sqlx::Error::Protocol(format!(
                    "article {} has no established primary",
                    primary_id
                )));
            }
        };

        let root_is_self_rooted: Option<i64> = sqlx::query_scalar(
            "SELECT primary_article_id FROM filtered_articles WHERE id = ?1",
        )
        .bind(root)
        .fetch_optional(&mut *transaction)
        .await?
        .flatten();
        if root_is_self_rooted != Some(root) || root == filtered_id {
            transaction.rollback().await?;
            warn!(target: TARGET_DB, "Refusing to attach {} to {}: root {} is not a primary", filtered_id, primary_id, root);
            return Err(sqlx::Error::Protocol(format!(
                "primary chain detected at article {}",
                root
            )));
        }

        let updated = sqlx::query(
            r#"
            UPDATE filtered_articles
            SET primary_article_id = ?1, status = ?2
            WHERE id = ?3 AND primary_article_id IS NULL
            "#,
        )
        .bind(root)
        .bind(STATUS_DUPLICATE)
        .bind(filtered_id)
        .execute(&mut *transaction)
        .await?;

        if updated.rows_affected() == 0 {
            transaction.rollback().await?;
            return Ok(None);
        }

        transaction.commit().await?;
        debug!(target: TARGET_DB, "Filtered article {} attached to primary {}", filtered_id, root);
        Ok(Some(root))
    }

    pub async fn mark_resolution_skipped(&self, filtered_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE filtered_articles SET status = ?1 WHERE id = ?2 AND primary_article_id IS NULL",
        )
        .bind(STATUS_UNRESOLVED_SKIPPED)
        .bind(filtered_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Ids whose primary pointer does not land on a self-rooted primary.
    pub async fn find_primary_chain_violations(&self) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT f.id
            FROM filtered_articles f
            LEFT JOIN filtered_articles p ON p.id = f.primary_article_id
            WHERE f.primary_article_id IS NOT NULL
              AND (p.id IS NULL OR p.primary_article_id IS NULL OR p.primary_article_id != p.id)
            ORDER BY f.id
            "#,
        )
        .fetch_all(self.pool())
        .await
    }

    pub async fn count_primary_articles(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM primary_articles")
            .fetch_one(self.pool())
            .await
    }
}
