use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};
use tracing::{debug, instrument};

use super::core::{retry_on_lock, Database};
use crate::pipeline::state::Transition;
use crate::pipeline::types::{Sentiment, SummaryStatus};
use crate::{now_ts, TARGET_DB};

pub const PRIMARY_AWAITING_SUMMARY: &str = "awaiting_summary";
pub const PRIMARY_SUMMARIZED: &str = "summarized";
pub const PRIMARY_SUMMARY_FAILED: &str = "summary_failed";

/// A primary article waiting for the relevance/summarization call.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PrimaryForSummary {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub source: String,
    pub url: String,
    pub matched_keywords: String,
    pub published_at: Option<i64>,
    pub summarize_fail_count: i64,
}

impl PrimaryForSummary {
    pub fn keywords(&self) -> Vec<String> {
        serde_json::from_str(&self.matched_keywords).unwrap_or_default()
    }
}

/// A `news_summaries` row joined with the fields of its primary article the gates need.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NewsSummary {
    pub id: i64,
    pub primary_article_id: i64,
    pub title: String,
    pub body: String,
    pub source: String,
    pub published_at: Option<i64>,
    pub summary: String,
    pub detected_source: Option<String>,
    pub relevance_score: f64,
    pub status: String,
    pub is_beijing_related: bool,
    pub beijing_keyword_match: bool,
    pub beijing_llm_confirmed: Option<bool>,
    pub sentiment: Option<String>,
    pub sentiment_confidence: Option<f64>,
    pub importance_score: Option<f64>,
    pub classify_fail_count: i64,
    pub beijing_gate_attempts: i64,
    pub beijing_gate_fail_count: i64,
    pub external_filter_attempts: i64,
    pub external_filter_fail_count: i64,
    pub failure_reason: Option<String>,
}

impl NewsSummary {
    pub fn status(&self) -> Result<SummaryStatus, String> {
        self.status.parse()
    }

    pub fn sentiment(&self) -> Option<Sentiment> {
        self.sentiment.as_deref().and_then(|s| s.parse().ok())
    }
}

/// Which gate an attempt belongs to; selects the attempt/failure columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Classify,
    BeijingGate,
    ExternalFilter,
}

impl Gate {
    pub fn for_status(status: SummaryStatus) -> Option<Gate> {
        match status {
            SummaryStatus::Pending => Some(Gate::Classify),
            SummaryStatus::PendingBeijingGate => Some(Gate::BeijingGate),
            SummaryStatus::PendingExternalFilter => Some(Gate::ExternalFilter),
            _ => None,
        }
    }

    fn status(&self) -> SummaryStatus {
        match self {
            Gate::Classify => SummaryStatus::Pending,
            Gate::BeijingGate => SummaryStatus::PendingBeijingGate,
            Gate::ExternalFilter => SummaryStatus::PendingExternalFilter,
        }
    }

    fn fail_column(&self) -> &'static str {
        match self {
            Gate::Classify => "classify_fail_count",
            Gate::BeijingGate => "beijing_gate_fail_count",
            Gate::ExternalFilter => "external_filter_fail_count",
        }
    }

    fn last_attempt_column(&self) -> &'static str {
        match self {
            Gate::Classify => "classify_last_attempt_at",
            Gate::BeijingGate => "beijing_gate_last_attempt_at",
            Gate::ExternalFilter => "external_filter_last_attempt_at",
        }
    }

    fn attempts_column(&self) -> Option<&'static str> {
        match self {
            Gate::Classify => None,
            Gate::BeijingGate => Some("beijing_gate_attempts"),
            Gate::ExternalFilter => Some("external_filter_attempts"),
        }
    }
}

/// Data a gate produced alongside its transition. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default)]
pub struct GateUpdate {
    pub beijing_keyword_match: Option<bool>,
    pub sentiment: Option<Sentiment>,
    pub sentiment_confidence: Option<f64>,
    pub beijing_gate_rationale: Option<String>,
    pub importance_score: Option<f64>,
    pub importance_rationale: Option<String>,
    pub failure_reason: Option<String>,
}

const SUMMARY_SELECT: &str = r#"
    SELECT s.id, s.primary_article_id, p.title, p.body, p.source, p.published_at,
           s.summary, s.detected_source, s.relevance_score, s.status,
           s.is_beijing_related, s.beijing_keyword_match, s.beijing_llm_confirmed,
           s.sentiment, s.sentiment_confidence, s.importance_score,
           s.classify_fail_count, s.beijing_gate_attempts, s.beijing_gate_fail_count,
           s.external_filter_attempts, s.external_filter_fail_count, s.failure_reason
    FROM news_summaries s
    JOIN primary_articles p ON p.id = s.primary_article_id
"#;

impl Database {
    /// Claims up to `limit` primaries without a summary whose last attempt is older than
    /// `attempted_before` by stamping their attempt time, and returns them. A primary claimed
    /// by one worker is not handed to another until its cool-down passes again.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn claim_primaries_for_summary(
        &self,
        limit: i64,
        attempted_before: i64,
    ) -> Result<Vec<PrimaryForSummary>, sqlx::Error> {
        let now = now_ts();
        let claimed: Vec<i64> = retry_on_lock("claim_primaries_for_summary", || async move {
            sqlx::query_scalar(
                r#"
                UPDATE primary_articles
                SET summarize_last_attempt_at = ?1
                WHERE id IN (
                    SELECT id FROM primary_articles
                    WHERE status = ?2
                      AND (summarize_last_attempt_at IS NULL OR summarize_last_attempt_at <= ?3)
                    ORDER BY created_at ASC, id ASC
                    LIMIT ?4
                )
                RETURNING id
                "#,
            )
            .bind(now)
            .bind(PRIMARY_AWAITING_SUMMARY)
            .bind(attempted_before)
            .bind(limit)
            .fetch_all(self.pool())
            .await
        })
        .await?;

        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT id, title, body, source, url, matched_keywords, published_at, summarize_fail_count
            FROM primary_articles
            WHERE id IN ("#,
        );
        let mut separated = builder.separated(", ");
        for id in &claimed {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY created_at ASC, id ASC");

        builder
            .build_query_as::<PrimaryForSummary>()
            .fetch_all(self.pool())
            .await
    }

    /// Stores the summarization result as a `pending` news summary. Returns `None` when the
    /// primary was already summarized by another worker.
    #[instrument(target = "db", level = "info", skip(self, summary, detected_source))]
    pub async fn create_news_summary(
        &self,
        primary_article_id: i64,
        summary: &str,
        detected_source: Option<&str>,
        relevance_score: f64,
    ) -> Result<Option<i64>, sqlx::Error> {
        let now = now_ts();
        let mut transaction = self.pool().begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE primary_articles
            SET status = ?1, relevance_score = ?2, summarize_attempts = summarize_attempts + 1,
                summarize_last_attempt_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
        )
        .bind(PRIMARY_SUMMARIZED)
        .bind(relevance_score)
        .bind(now)
        .bind(primary_article_id)
        .bind(PRIMARY_AWAITING_SUMMARY)
        .execute(&mut *transaction)
        .await?;

        if claimed.rows_affected() == 0 {
            transaction.rollback().await?;
            return Ok(None);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO news_summaries (
                primary_article_id, summary, detected_source, relevance_score, status,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            RETURNING id
            "#,
        )
        .bind(primary_article_id)
        .bind(summary)
        .bind(detected_source)
        .bind(relevance_score)
        .bind(SummaryStatus::Pending.as_str())
        .bind(now)
        .fetch_one(&mut *transaction)
        .await?;

        transaction.commit().await?;
        debug!(target: TARGET_DB, "News summary {} created for primary {}", id, primary_article_id);
        Ok(Some(id))
    }

    /// Records a failed summarization attempt; the primary is parked as `summary_failed` once
    /// `max_retries` failures accumulate. The write only lands if the failure count is still
    /// `failures_so_far`, so an attempt is counted once however many workers made it.
    ///
    /// Returns the new failure count, or `None` if the attempt was already counted or the
    /// primary moved on.
    pub async fn record_summary_failure(
        &self,
        primary_article_id: i64,
        failures_so_far: i64,
        max_retries: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        let now = now_ts();
        retry_on_lock("record_summary_failure", || async move {
            sqlx::query_scalar(
                r#"
                UPDATE primary_articles
                SET summarize_attempts = summarize_attempts + 1,
                    summarize_fail_count = summarize_fail_count + 1,
                    summarize_last_attempt_at = ?1,
                    status = CASE WHEN summarize_fail_count + 1 >= ?2 THEN ?3 ELSE status END
                WHERE id = ?4 AND status = ?5 AND summarize_fail_count = ?6
                RETURNING summarize_fail_count
                "#,
            )
            .bind(now)
            .bind(max_retries)
            .bind(PRIMARY_SUMMARY_FAILED)
            .bind(primary_article_id)
            .bind(PRIMARY_AWAITING_SUMMARY)
            .bind(failures_so_far)
            .fetch_optional(self.pool())
            .await
        })
        .await
    }

    pub async fn get_news_summary(&self, id: i64) -> Result<Option<NewsSummary>, sqlx::Error> {
        sqlx::query_as::<_, NewsSummary>(&format!("{} WHERE s.id = ?1", SUMMARY_SELECT))
            .bind(id)
            .fetch_optional(self.pool())
            .await
    }

    /// Claims up to `limit` rows waiting at `gate` whose last attempt there is older than
    /// `attempted_before`, stamping the attempt time, and returns them.
    #[instrument(target = "db", level = "debug", skip(self))]
    pub async fn claim_summaries_for_gate(
        &self,
        gate: Gate,
        limit: i64,
        attempted_before: i64,
    ) -> Result<Vec<NewsSummary>, sqlx::Error> {
        let now = now_ts();
        let claim_sql = format!(
            r#"
            UPDATE news_summaries
            SET {last} = ?1
            WHERE id IN (
                SELECT id FROM news_summaries
                WHERE status = ?2
                  AND ({last} IS NULL OR {last} <= ?3)
                ORDER BY created_at ASC, id ASC
                LIMIT ?4
            )
            RETURNING id
            "#,
            last = gate.last_attempt_column(),
        );
        let claim_sql = claim_sql.as_str();
        let status = gate.status().as_str();

        let claimed: Vec<i64> = retry_on_lock("claim_summaries_for_gate", || async move {
            sqlx::query_scalar(claim_sql)
                .bind(now)
                .bind(status)
                .bind(attempted_before)
                .bind(limit)
                .fetch_all(self.pool())
                .await
        })
        .await?;

        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(SUMMARY_SELECT);
        builder.push(" WHERE s.id IN (");
        let mut separated = builder.separated(", ");
        for id in &claimed {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY s.created_at ASC, s.id ASC");

        builder
            .build_query_as::<NewsSummary>()
            .fetch_all(self.pool())
            .await
    }

    /// Applies a gate's transition to one row. The write is conditional on the row still being
    /// at the gate with `failures_so_far` failures there, so two workers racing on the same row
    /// cannot both apply and one attempt is never counted twice. Reaching `ready_for_export`
    /// creates the pending review in the same transaction.
    ///
    /// Returns false if another worker got there first.
    #[instrument(target = "db", level = "debug", skip(self, update))]
    pub async fn apply_gate_transition(
        &self,
        summary_id: i64,
        gate: Gate,
        transition: Transition,
        failures_so_far: i64,
        update: &GateUpdate,
    ) -> Result<bool, sqlx::Error> {
        let current = gate.status();
        let next = transition.next_status(current);
        let now = now_ts();

        let mut assignments = vec![
            "status = ?1".to_string(),
            "updated_at = ?2".to_string(),
            format!("{} = ?2", gate.last_attempt_column()),
            "beijing_keyword_match = COALESCE(?3, beijing_keyword_match)".to_string(),
            "sentiment = COALESCE(?4, sentiment)".to_string(),
            "sentiment_confidence = COALESCE(?5, sentiment_confidence)".to_string(),
            "beijing_gate_rationale = COALESCE(?6, beijing_gate_rationale)".to_string(),
            "importance_score = COALESCE(?7, importance_score)".to_string(),
            "importance_rationale = COALESCE(?8, importance_rationale)".to_string(),
            "failure_reason = ?9".to_string(),
        ];
        if let Some(attempts) = gate.attempts_column() {
            assignments.push(format!("{0} = {0} + 1", attempts));
        }
        if transition.counts_as_failure() {
            assignments.push(format!("{0} = {0} + 1", gate.fail_column()));
        }
        match (gate, transition) {
            (Gate::Classify, _) => {
                // the keyword guess becomes the working region flag
                assignments
                    .push("is_beijing_related = COALESCE(?3, is_beijing_related)".to_string());
            }
            (Gate::BeijingGate, Transition::Advance { .. }) => {
                assignments.push("beijing_llm_confirmed = 1".to_string());
                assignments.push("is_beijing_related = 1".to_string());
            }
            (Gate::BeijingGate, Transition::FailOpen) => {
                assignments.push("beijing_llm_confirmed = NULL".to_string());
                assignments.push("is_beijing_related = 1".to_string());
            }
            (Gate::BeijingGate, Transition::RegionOverturned) => {
                assignments.push("beijing_llm_confirmed = 0".to_string());
                assignments.push("is_beijing_related = 0".to_string());
                assignments.push("beijing_gate_fail_count = 0".to_string());
                assignments.push("external_filter_attempts = 0".to_string());
                assignments.push("external_filter_fail_count = 0".to_string());
                assignments.push("external_filter_last_attempt_at = NULL".to_string());
            }
            _ => {}
        }

        let sql = format!(
            "UPDATE news_summaries SET {} WHERE id = ?10 AND status = ?11 AND {} = ?12",
            assignments.join(", "),
            gate.fail_column()
        );

        let sql = sql.as_str();
        let next_str = next.as_str();
        let current_str = current.as_str();
        let sentiment = update.sentiment.map(|s| s.as_str());

        retry_on_lock("apply_gate_transition", || async move {
            let mut transaction = self.pool().begin().await?;

            let updated = sqlx::query(sql)
                .bind(next_str)
                .bind(now)
                .bind(update.beijing_keyword_match)
                .bind(sentiment)
                .bind(update.sentiment_confidence)
                .bind(update.beijing_gate_rationale.as_deref())
                .bind(update.importance_score)
                .bind(update.importance_rationale.as_deref())
                .bind(update.failure_reason.as_deref())
                .bind(summary_id)
                .bind(current_str)
                .bind(failures_so_far)
                .execute(&mut *transaction)
                .await?;

            if updated.rows_affected() == 0 {
                transaction.rollback().await?;
                return Ok(false);
            }

            // keep the denormalized scoring fields on the primary in step
            sqlx::query(
                r#"
                UPDATE primary_articles
                SET is_beijing_related = (SELECT is_beijing_related FROM news_summaries WHERE id = ?1),
                    sentiment = (SELECT sentiment FROM news_summaries WHERE id = ?1),
                    importance_score = (SELECT importance_score FROM news_summaries WHERE id = ?1)
                WHERE id = (SELECT primary_article_id FROM news_summaries WHERE id = ?1)
                "#,
            )
            .bind(summary_id)
            .execute(&mut *transaction)
            .await?;

            if next == SummaryStatus::ReadyForExport {
                sqlx::query(
                    r#"
                    INSERT INTO manual_reviews (summary_id, status, version, created_at, updated_at)
                    VALUES (?1, 'pending', 1, ?2, ?2)
                    ON CONFLICT(summary_id) DO NOTHING
                    "#,
                )
                .bind(summary_id)
                .bind(now)
                .execute(&mut *transaction)
                .await?;
            }

            transaction.commit().await?;
            Ok(true)
        })
        .await
    }

    /// Counts rows per summary status.
    pub async fn count_summaries_by_status(&self) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM news_summaries GROUP BY status ORDER BY status",
        )
        .fetch_all(self.pool())
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::gates::tests::{seed_pending, seed_primary};

    #[tokio::test]
    async fn test_summary_failure_counts_once_per_observed_count() {
        let db = Database::in_memory().await.unwrap();
        let primary = seed_primary(&db, "Subway escalator outage", "Two stations affected.").await;

        assert_eq!(db.record_summary_failure(primary, 0, 3).await.unwrap(), Some(1));
        // a second worker that read the same count is not counted again
        assert_eq!(db.record_summary_failure(primary, 0, 3).await.unwrap(), None);
        assert_eq!(db.record_summary_failure(primary, 1, 3).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_stale_failure_count_does_not_apply() {
        let db = Database::in_memory().await.unwrap();
        let id = seed_pending(&db, "Subway signal fault", "Delays on line 2.").await;
        let failed = GateUpdate {
            failure_reason: Some("timed out".to_string()),
            ..Default::default()
        };

        assert!(db
            .apply_gate_transition(id, Gate::Classify, Transition::RetryLater, 0, &failed)
            .await
            .unwrap());
        assert!(!db
            .apply_gate_transition(id, Gate::Classify, Transition::RetryLater, 0, &failed)
            .await
            .unwrap());

        let row = db.get_news_summary(id).await.unwrap().unwrap();
        assert_eq!(row.classify_fail_count, 1);
        assert_eq!(row.status().unwrap(), SummaryStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_hands_rows_out_once_per_cooldown() {
        let db = Database::in_memory().await.unwrap();
        let id = seed_pending(&db, "Subway wifi upgrade", "Faster connections underground.").await;
        let cooled = now_ts() - 300;

        let first = db.claim_summaries_for_gate(Gate::Classify, 10, cooled).await.unwrap();
        assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![id]);
        assert!(db
            .claim_summaries_for_gate(Gate::Classify, 10, cooled)
            .await
            .unwrap()
            .is_empty());
    }
}
