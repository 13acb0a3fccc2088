use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};
use url::Url;
use urlnorm::UrlNormalizer;

use super::core::{retry_on_lock, Database};
use crate::{now_ts, TARGET_DB};

/// A crawl result as handed over by a source crawler.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawArticle {
    pub id: i64,
    pub source: String,
    pub url: String,
    pub title: String,
    pub body: Option<String>,
    pub published_at: Option<i64>,
    pub crawled_at: i64,
}

/// Input shape for [`Database::add_raw_article`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRawArticle {
    pub source: String,
    pub url: String,
    pub title: String,
    pub body: Option<String>,
    pub published_at: Option<i64>,
}

pub fn normalize_url(url: &str) -> Result<String, sqlx::Error> {
    let parsed_url = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(target: TARGET_DB, "Attempted to add an invalid URL ({}): {}", url, e);
            return Err(sqlx::Error::Protocol("Invalid URL provided".into()));
        }
    };
    let normalizer = UrlNormalizer::default();
    Ok(normalizer.compute_normalization_string(&parsed_url))
}

impl Database {
    /// Stores a crawl result. A URL that normalizes to an existing row returns that row's id
    /// and leaves it untouched.
    #[instrument(target = "db", level = "info", skip(self, article), fields(url = %article.url))]
    pub async fn add_raw_article(&self, article: &NewRawArticle) -> Result<i64, sqlx::Error> {
        if article.url.trim().is_empty() {
            error!(target: TARGET_DB, "Attempted to add a raw article with an empty URL");
            return Err(sqlx::Error::Protocol("Empty URL provided".into()));
        }
        let normalized_url = normalize_url(&article.url)?;
        let normalized_url = normalized_url.as_str();
        let crawled_at = now_ts();

        let inserted = retry_on_lock("add_raw_article", || async move {
            sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO raw_articles (source, url, normalized_url, title, body, published_at, crawled_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(normalized_url) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&article.source)
            .bind(&article.url)
            .bind(normalized_url)
            .bind(&article.title)
            .bind(&article.body)
            .bind(article.published_at)
            .bind(crawled_at)
            .fetch_optional(self.pool())
            .await
        })
        .await?;

        match inserted {
            Some(id) => {
                debug!(target: TARGET_DB, "Raw article added: {} with id {}", article.url, id);
                Ok(id)
            }
            None => {
                let id = sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM raw_articles WHERE normalized_url = ?1",
                )
                .bind(normalized_url)
                .fetch_one(self.pool())
                .await?;
                debug!(target: TARGET_DB, "Raw article already known: {} (id {})", normalized_url, id);
                Ok(id)
            }
        }
    }

    /// Fills in a body the crawler could not fetch the first time. Returns false when the row
    /// already had a body (crawl results are otherwise immutable).
    #[instrument(target = "db", level = "info", skip(self, body))]
    pub async fn backfill_raw_body(&self, id: i64, body: &str) -> Result<bool, sqlx::Error> {
        if body.trim().is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE raw_articles
            SET body = ?1, filter_checked = 0
            WHERE id = ?2 AND (body IS NULL OR TRIM(body) = '')
            "#,
        )
        .bind(body)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_raw_article(&self, id: i64) -> Result<Option<RawArticle>, sqlx::Error> {
        sqlx::query_as::<_, RawArticle>(
            r#"
            SELECT id, source, url, title, body, published_at, crawled_at
            FROM raw_articles
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
    }

    /// Raw articles with a body that the keyword filter has not looked at yet, oldest first.
    pub async fn fetch_unchecked_raw_articles(
        &self,
        limit: i64,
    ) -> Result<Vec<RawArticle>, sqlx::Error> {
        sqlx::query_as::<_, RawArticle>(
            r#"
            SELECT id, source, url, title, body, published_at, crawled_at
            FROM raw_articles
            WHERE filter_checked = 0 AND body IS NOT NULL AND TRIM(body) != ''
            ORDER BY id ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await
    }

    pub async fn mark_filter_checked(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE raw_articles SET filter_checked = 1 WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
