use tracing::info;

use super::core::Database;
use crate::TARGET_DB;

impl Database {
    pub(crate) async fn initialize_schema(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool().acquire().await?;
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS raw_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                url TEXT NOT NULL,
                normalized_url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                body TEXT,
                published_at INTEGER,
                crawled_at INTEGER NOT NULL,
                filter_checked INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_raw_articles_filter_checked ON raw_articles (filter_checked);

            -- One row per raw article that matched the keyword filter
            CREATE TABLE IF NOT EXISTS filtered_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_article_id INTEGER NOT NULL UNIQUE,
                matched_keywords TEXT NOT NULL, -- JSON array
                content_hash TEXT,
                simhash INTEGER,
                simhash_band0 INTEGER,
                simhash_band1 INTEGER,
                simhash_band2 INTEGER,
                simhash_band3 INTEGER,
                primary_article_id INTEGER, -- always a self-rooted primary, never a chain
                status TEXT NOT NULL DEFAULT 'unresolved', -- unresolved, primary, duplicate, unresolved_skipped
                created_at INTEGER NOT NULL,
                FOREIGN KEY (raw_article_id) REFERENCES raw_articles (id),
                FOREIGN KEY (primary_article_id) REFERENCES filtered_articles (id)
            );
            CREATE INDEX IF NOT EXISTS idx_filtered_content_hash ON filtered_articles (content_hash);
            CREATE INDEX IF NOT EXISTS idx_filtered_band0 ON filtered_articles (simhash_band0);
            CREATE INDEX IF NOT EXISTS idx_filtered_band1 ON filtered_articles (simhash_band1);
            CREATE INDEX IF NOT EXISTS idx_filtered_band2 ON filtered_articles (simhash_band2);
            CREATE INDEX IF NOT EXISTS idx_filtered_band3 ON filtered_articles (simhash_band3);
            CREATE INDEX IF NOT EXISTS idx_filtered_status ON filtered_articles (status);
            CREATE INDEX IF NOT EXISTS idx_filtered_primary ON filtered_articles (primary_article_id);

            -- Canonical record per real-world event; id is the filtered article id
            CREATE TABLE IF NOT EXISTS primary_articles (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                source TEXT NOT NULL,
                url TEXT NOT NULL,
                matched_keywords TEXT NOT NULL,
                published_at INTEGER,
                relevance_score REAL,
                is_beijing_related INTEGER,
                sentiment TEXT,
                importance_score REAL,
                status TEXT NOT NULL DEFAULT 'awaiting_summary', -- awaiting_summary, summarized, summary_failed
                summarize_attempts INTEGER NOT NULL DEFAULT 0,
                summarize_fail_count INTEGER NOT NULL DEFAULT 0,
                summarize_last_attempt_at INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (id) REFERENCES filtered_articles (id)
            );
            CREATE INDEX IF NOT EXISTS idx_primary_status ON primary_articles (status, summarize_last_attempt_at);

            CREATE TABLE IF NOT EXISTS news_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                primary_article_id INTEGER NOT NULL UNIQUE,
                summary TEXT NOT NULL,
                detected_source TEXT,
                relevance_score REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                is_beijing_related INTEGER NOT NULL DEFAULT 0,
                beijing_keyword_match INTEGER NOT NULL DEFAULT 0,
                beijing_llm_confirmed INTEGER,
                beijing_gate_rationale TEXT,
                sentiment TEXT,
                sentiment_confidence REAL,
                importance_score REAL,
                importance_rationale TEXT,
                classify_fail_count INTEGER NOT NULL DEFAULT 0,
                classify_last_attempt_at INTEGER,
                beijing_gate_attempts INTEGER NOT NULL DEFAULT 0,
                beijing_gate_fail_count INTEGER NOT NULL DEFAULT 0,
                beijing_gate_last_attempt_at INTEGER,
                external_filter_attempts INTEGER NOT NULL DEFAULT 0,
                external_filter_fail_count INTEGER NOT NULL DEFAULT 0,
                external_filter_last_attempt_at INTEGER,
                failure_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (primary_article_id) REFERENCES primary_articles (id)
            );
            CREATE INDEX IF NOT EXISTS idx_news_summaries_status ON news_summaries (status);

            -- Reviewer state; summary_id doubles as the review item id
            CREATE TABLE IF NOT EXISTS manual_reviews (
                summary_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending', -- pending, selected, backup, discarded, exported
                summary_override TEXT,
                source_override TEXT,
                sort_rank INTEGER,
                version INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                updated_by TEXT,
                decided_at INTEGER,
                FOREIGN KEY (summary_id) REFERENCES news_summaries (id)
            );
            CREATE INDEX IF NOT EXISTS idx_manual_reviews_status ON manual_reviews (status);

            -- Disposable cache of review clusters, rebuilt wholesale by refresh
            CREATE TABLE IF NOT EXISTS cluster_index (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket TEXT NOT NULL,
                position INTEGER NOT NULL,
                article_ids TEXT NOT NULL, -- JSON array of summary ids, rank order
                representative_id INTEGER NOT NULL,
                refresh_id TEXT NOT NULL,
                refreshed_at INTEGER NOT NULL,
                UNIQUE (bucket, position)
            );

            CREATE TABLE IF NOT EXISTS named_locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await?;
        info!(target: TARGET_DB, "Tables ensured to exist");

        Ok(())
    }
}
