use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{info, instrument};

use super::core::Database;
use crate::pipeline::types::{Category, Region};
use crate::review::Disposition;
use crate::{now_ts, TARGET_DB};

/// Summaries that are export-ready and still awaiting a reviewer, with everything ranking and
/// display need.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ReviewCandidate {
    pub id: i64,
    pub title: String,
    pub summary: String,
    pub source: String,
    pub url: String,
    pub is_beijing_related: bool,
    pub sentiment: Option<String>,
    pub importance_score: Option<f64>,
    pub sort_rank: Option<i64>,
    pub relevance_score: Option<f64>,
    pub published_at: Option<i64>,
    pub version: i64,
}

impl ReviewCandidate {
    pub fn category(&self) -> Option<Category> {
        let sentiment = self.sentiment.as_deref()?.parse().ok()?;
        Some(Category::new(Region::from_flag(self.is_beijing_related), sentiment))
    }
}

/// One cached cluster as stored: an ordered list of summary ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredCluster {
    pub bucket: String,
    pub position: i64,
    pub article_ids: Vec<i64>,
    pub representative_id: i64,
    pub refresh_id: String,
    pub refreshed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCluster {
    pub bucket: String,
    pub article_ids: Vec<i64>,
}

const CANDIDATE_SELECT: &str = r#"
    SELECT s.id, p.title,
           COALESCE(m.summary_override, s.summary) AS summary,
           COALESCE(m.source_override, s.detected_source, p.source) AS source,
           p.url, s.is_beijing_related, s.sentiment, s.importance_score, m.sort_rank,
           s.relevance_score, p.published_at, m.version
    FROM news_summaries s
    JOIN manual_reviews m ON m.summary_id = s.id
    JOIN primary_articles p ON p.id = s.primary_article_id
    WHERE s.status = 'ready_for_export' AND m.status = "#;

/// SQLite's bound parameter limit is generous, but keep id lists modest.
const IDS_PER_QUERY: usize = 500;

impl Database {
    /// Current review-pending candidates, at most `cap`, highest importance first.
    pub async fn fetch_review_candidates(
        &self,
        cap: i64,
    ) -> Result<Vec<ReviewCandidate>, sqlx::Error> {
        let sql = format!(
            "{}?1 ORDER BY s.importance_score IS NULL, s.importance_score DESC, s.id ASC LIMIT ?2",
            CANDIDATE_SELECT
        );
        sqlx::query_as::<_, ReviewCandidate>(&sql)
            .bind(Disposition::Pending.as_str())
            .bind(cap)
            .fetch_all(self.pool())
            .await
    }

    /// The subset of `ids` that is still export-ready and review-pending, read live.
    pub async fn fetch_live_candidates(
        &self,
        ids: &[i64],
    ) -> Result<Vec<ReviewCandidate>, sqlx::Error> {
        let mut live = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IDS_PER_QUERY) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(CANDIDATE_SELECT);
            builder.push_bind(Disposition::Pending.as_str());
            builder.push(" AND s.id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<ReviewCandidate>()
                .fetch_all(self.pool())
                .await?;
            live.extend(rows);
        }
        Ok(live)
    }

    /// Replaces every cached cluster of `buckets` in one transaction. A failure leaves the
    /// previous clusters in place.
    #[instrument(target = "db", level = "info", skip(self, buckets, clusters))]
    pub async fn replace_clusters(
        &self,
        buckets: &[String],
        clusters: &[NewCluster],
        refresh_id: &str,
    ) -> Result<(), sqlx::Error> {
        let refreshed_at = now_ts();
        let mut transaction = self.pool().begin().await?;

        for bucket in buckets {
            sqlx::query("DELETE FROM cluster_index WHERE bucket = ?1")
                .bind(bucket)
                .execute(&mut *transaction)
                .await?;
        }

        let mut positions: std::collections::HashMap<&str, i64> = Default::default();
        for cluster in clusters {
            let Some(&representative_id) = cluster.article_ids.first() else {
                continue;
            };
            let position = positions.entry(cluster.bucket.as_str()).or_insert(0);
            let article_ids = serde_json::to_string(&cluster.article_ids)
                .map_err(|e| sqlx::Error::Protocol(format!("cluster encoding failed: {}", e)))?;

            sqlx::query(
                r#"
                INSERT INTO cluster_index (bucket, position, article_ids, representative_id, refresh_id, refreshed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&cluster.bucket)
            .bind(*position)
            .bind(article_ids)
            .bind(representative_id)
            .bind(refresh_id)
            .bind(refreshed_at)
            .execute(&mut *transaction)
            .await?;
            *position += 1;
        }

        transaction.commit().await?;
        info!(target: TARGET_DB, "Cluster index replaced: {} clusters over {} buckets ({})", clusters.len(), buckets.len(), refresh_id);
        Ok(())
    }

    /// Cached clusters in stored order, optionally for one bucket.
    pub async fn load_clusters(
        &self,
        bucket: Option<&str>,
    ) -> Result<Vec<StoredCluster>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT bucket, position, article_ids, representative_id, refresh_id, refreshed_at
            FROM cluster_index
            WHERE ?1 IS NULL OR bucket = ?1
            ORDER BY bucket ASC, position ASC
            "#,
        )
        .bind(bucket)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let ids_json: String = row.get("article_ids");
                let article_ids = serde_json::from_str(&ids_json).map_err(|e| {
                    sqlx::Error::Protocol(format!("corrupt cluster id list: {}", e))
                })?;
                Ok(StoredCluster {
                    bucket: row.get("bucket"),
                    position: row.get("position"),
                    article_ids,
                    representative_id: row.get("representative_id"),
                    refresh_id: row.get("refresh_id"),
                    refreshed_at: row.get("refreshed_at"),
                })
            })
            .collect()
    }
}
