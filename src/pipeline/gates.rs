//! One function per stage. Each claims the rows due at its stage (respecting the cool-down),
//! calls its collaborator under a timeout with bounded concurrency, and applies the decided
//! transition. Claims and the failure-count check on apply keep concurrent workers from
//! counting one attempt twice.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::state::{transition, GateResult, RegionVerdict, Transition};
use super::types::{Category, Region, SummaryStatus};
use super::{Collaborators, PassStats};
use crate::db::summary::{Gate, GateUpdate, NewsSummary, PrimaryForSummary};
use crate::db::Database;
use crate::environment::Settings;
use crate::keywords::KeywordFilter;
use crate::llm::{ImportanceRequest, RegionRequest, SummaryRequest};
use crate::{now_ts, TARGET_PIPELINE};

/// Outcome of one row at one gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Advanced,
    Retried,
    Skipped,
}

fn tally(outcomes: Vec<RowOutcome>) -> PassStats {
    let mut stats = PassStats {
        attempted: outcomes.len(),
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            RowOutcome::Advanced => stats.advanced += 1,
            RowOutcome::Retried => stats.retried += 1,
            RowOutcome::Skipped => stats.skipped += 1,
        }
    }
    stats
}

/// Awaits a collaborator call, folding a timeout into the error case.
async fn call_with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(target: TARGET_PIPELINE, "{} failed: {:#}", what, e);
            Err(format!("{}: {:#}", what, e))
        }
        Err(_) => {
            warn!(target: TARGET_PIPELINE, "{} timed out after {:?}", what, limit);
            Err(format!("{}: timed out after {}s", what, limit.as_secs()))
        }
    }
}

fn attempted_before(settings: &Settings) -> i64 {
    now_ts() - settings.gate_cooldown.as_secs() as i64
}

/// Summarizes primary articles that have no news summary yet.
pub async fn run_summarize_pass(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
) -> Result<PassStats> {
    let primaries = db
        .claim_primaries_for_summary(settings.batch_size, attempted_before(settings))
        .await
        .context("Failed to claim primaries awaiting summary")?;

    let outcomes: Vec<RowOutcome> = stream::iter(primaries)
        .map(|primary| summarize_one(db, settings, collaborators, primary))
        .buffer_unordered(settings.worker_concurrency.max(1))
        .collect()
        .await;

    let stats = tally(outcomes);
    if stats.did_work() {
        info!(target: TARGET_PIPELINE, "Summarize pass: {:?}", stats);
    }
    Ok(stats)
}

async fn summarize_one(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
    primary: PrimaryForSummary,
) -> RowOutcome {
    let request = SummaryRequest {
        title: primary.title.clone(),
        body: primary.body.clone(),
        matched_keywords: primary.keywords(),
        published_at: primary.published_at,
    };
    let response = call_with_timeout(
        settings.llm_timeout,
        "summarize",
        collaborators.summarizer.summarize(&request),
    )
    .await;

    let stored = match response {
        Ok(response) => db
            .create_news_summary(
                primary.id,
                &response.summary,
                response.detected_source.as_deref(),
                response.relevance_score,
            )
            .await
            .map(|created| {
                if created.is_some() {
                    RowOutcome::Advanced
                } else {
                    RowOutcome::Skipped
                }
            }),
        Err(_) => db
            .record_summary_failure(
                primary.id,
                primary.summarize_fail_count,
                settings.gate_max_retries,
            )
            .await
            .map(|recorded| match recorded {
                Some(count) if count >= settings.gate_max_retries => {
                    warn!(target: TARGET_PIPELINE, "Primary {} parked as summary_failed", primary.id);
                    RowOutcome::Advanced
                }
                Some(_) => RowOutcome::Retried,
                None => RowOutcome::Skipped,
            }),
    };

    stored.unwrap_or_else(|e| {
        warn!(target: TARGET_PIPELINE, "Failed to store summarize result for primary {}: {}", primary.id, e);
        RowOutcome::Skipped
    })
}

/// Applies a gate decision for one row and logs the move.
#[allow(clippy::too_many_arguments)]
async fn apply(
    db: &Database,
    row: &NewsSummary,
    gate: Gate,
    status: SummaryStatus,
    result: &GateResult,
    failures_so_far: i64,
    settings: &Settings,
    update: GateUpdate,
) -> RowOutcome {
    let decided = match transition(status, result, failures_so_far, settings.gate_max_retries) {
        Ok(decided) => decided,
        Err(e) => {
            warn!(target: TARGET_PIPELINE, "Summary {}: {}", row.id, e);
            return RowOutcome::Skipped;
        }
    };

    let mut update = update;
    if decided == Transition::FailOpen {
        update.failure_reason = Some(format!(
            "region gate gave no answer after {} attempts, kept as region-related",
            failures_so_far + 1
        ));
    }

    match db
        .apply_gate_transition(row.id, gate, decided, failures_so_far, &update)
        .await
    {
        Ok(true) => {
            let next = decided.next_status(status);
            debug!(target: TARGET_PIPELINE, "Summary {}: {} -> {} ({:?})", row.id, status, next, decided);
            if next == status {
                RowOutcome::Retried
            } else {
                RowOutcome::Advanced
            }
        }
        Ok(false) => RowOutcome::Skipped,
        Err(e) => {
            warn!(target: TARGET_PIPELINE, "Failed to apply {:?} to summary {}: {}", decided, row.id, e);
            RowOutcome::Skipped
        }
    }
}

/// Classifies `pending` rows: relevance threshold, keyword region flag and sentiment.
pub async fn run_classify_pass(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
) -> Result<PassStats> {
    let rows = db
        .claim_summaries_for_gate(Gate::Classify, settings.batch_size, attempted_before(settings))
        .await
        .context("Failed to claim pending summaries")?;
    let region_filter = KeywordFilter::new(&settings.region_keywords);

    let outcomes: Vec<RowOutcome> = stream::iter(rows)
        .map(|row| classify_one(db, settings, collaborators, &region_filter, row))
        .buffer_unordered(settings.worker_concurrency.max(1))
        .collect()
        .await;

    let stats = tally(outcomes);
    if stats.did_work() {
        info!(target: TARGET_PIPELINE, "Classify pass: {:?}", stats);
    }
    Ok(stats)
}

async fn classify_one(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
    region_filter: &KeywordFilter,
    row: NewsSummary,
) -> RowOutcome {
    let passes_threshold = row.relevance_score >= settings.relevance_threshold;
    let region_related = region_filter.is_match(&row.title) || region_filter.is_match(&row.body);
    let mut update = GateUpdate {
        beijing_keyword_match: Some(region_related),
        ..Default::default()
    };

    let result = if !passes_threshold {
        GateResult::Classified {
            passes_threshold,
            region_related,
            sentiment_in_scope: false,
        }
    } else {
        let sentiment = call_with_timeout(
            settings.llm_timeout,
            "sentiment",
            collaborators
                .sentiment
                .classify_sentiment(&row.title, &row.summary),
        )
        .await;

        match sentiment {
            Ok(sentiment) => {
                update.sentiment = Some(sentiment.sentiment);
                update.sentiment_confidence = Some(sentiment.confidence);
                GateResult::Classified {
                    passes_threshold,
                    region_related,
                    sentiment_in_scope: sentiment.confidence >= settings.sentiment_min_confidence
                        && settings.external_sentiments.contains(&sentiment.sentiment),
                }
            }
            Err(reason) => {
                update.failure_reason = Some(reason);
                GateResult::CallFailed
            }
        }
    };

    apply(
        db,
        &row,
        Gate::Classify,
        SummaryStatus::Pending,
        &result,
        row.classify_fail_count,
        settings,
        update,
    )
    .await
}

/// Re-verifies keyword-based region guesses with the LLM.
pub async fn run_region_gate_pass(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
) -> Result<PassStats> {
    let rows = db
        .claim_summaries_for_gate(Gate::BeijingGate, settings.batch_size, attempted_before(settings))
        .await
        .context("Failed to claim summaries awaiting the region gate")?;

    let outcomes: Vec<RowOutcome> = stream::iter(rows)
        .map(|row| region_gate_one(db, settings, collaborators, row))
        .buffer_unordered(settings.worker_concurrency.max(1))
        .collect()
        .await;

    let stats = tally(outcomes);
    if stats.did_work() {
        info!(target: TARGET_PIPELINE, "Region gate pass: {:?}", stats);
    }
    Ok(stats)
}

async fn region_gate_one(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
    row: NewsSummary,
) -> RowOutcome {
    let request = RegionRequest {
        title: row.title.clone(),
        summary: row.summary.clone(),
        region: settings
            .region_keywords
            .first()
            .cloned()
            .unwrap_or_else(|| Region::Beijing.as_str().to_string()),
    };
    let verdict = call_with_timeout(
        settings.llm_timeout,
        "region verification",
        collaborators.region_verifier.verify_region(&request),
    )
    .await;

    let mut update = GateUpdate::default();
    let result = match verdict {
        Ok(verdict) => {
            match &verdict {
                RegionVerdict::ConfirmedRelated { rationale }
                | RegionVerdict::ConfirmedUnrelated { rationale } => {
                    update.beijing_gate_rationale = Some(rationale.clone());
                }
                RegionVerdict::Inconclusive { reason } => {
                    update.failure_reason = Some(format!("inconclusive: {}", reason));
                }
            }
            GateResult::Region(verdict)
        }
        Err(reason) => {
            update.failure_reason = Some(reason);
            GateResult::CallFailed
        }
    };

    apply(
        db,
        &row,
        Gate::BeijingGate,
        SummaryStatus::PendingBeijingGate,
        &result,
        row.beijing_gate_fail_count,
        settings,
        update,
    )
    .await
}

/// Scores external rows for importance against their category's threshold.
pub async fn run_external_filter_pass(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
) -> Result<PassStats> {
    let rows = db
        .claim_summaries_for_gate(
            Gate::ExternalFilter,
            settings.batch_size,
            attempted_before(settings),
        )
        .await
        .context("Failed to claim summaries awaiting the external filter")?;

    let outcomes: Vec<RowOutcome> = stream::iter(rows)
        .map(|row| external_filter_one(db, settings, collaborators, row))
        .buffer_unordered(settings.worker_concurrency.max(1))
        .collect()
        .await;

    let stats = tally(outcomes);
    if stats.did_work() {
        info!(target: TARGET_PIPELINE, "External filter pass: {:?}", stats);
    }
    Ok(stats)
}

async fn external_filter_one(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
    row: NewsSummary,
) -> RowOutcome {
    let mut update = GateUpdate::default();

    let result = match row.sentiment() {
        None => {
            update.failure_reason = Some("no sentiment recorded".to_string());
            GateResult::CallFailed
        }
        Some(sentiment) => {
            let category = Category::new(Region::from_flag(row.is_beijing_related), sentiment);
            let request = ImportanceRequest {
                title: row.title.clone(),
                summary: row.summary.clone(),
                category,
            };
            let scored = call_with_timeout(
                settings.llm_timeout,
                "importance scoring",
                collaborators.importance_judge.score_importance(&request),
            )
            .await;

            match scored {
                Ok(response) => {
                    let threshold = settings.importance_threshold(category);
                    update.importance_score = Some(response.score);
                    update.importance_rationale = Some(response.rationale);
                    GateResult::Importance {
                        accepted: response.score >= threshold,
                    }
                }
                Err(reason) => {
                    update.failure_reason = Some(reason);
                    GateResult::CallFailed
                }
            }
        }
    };

    apply(
        db,
        &row,
        Gate::ExternalFilter,
        SummaryStatus::PendingExternalFilter,
        &result,
        row.external_filter_fail_count,
        settings,
        update,
    )
    .await
}

/// Runs every stage after resolution once, in pipeline order.
pub async fn run_gate_passes(
    db: &Database,
    settings: &Settings,
    collaborators: &Collaborators,
) -> Result<PassStats> {
    let mut stats = PassStats::default();
    stats.merge(run_summarize_pass(db, settings, collaborators).await?);
    stats.merge(run_classify_pass(db, settings, collaborators).await?);
    stats.merge(run_region_gate_pass(db, settings, collaborators).await?);
    stats.merge(run_external_filter_pass(db, settings, collaborators).await?);
    Ok(stats)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::raw::NewRawArticle;
    use crate::db::summary::PRIMARY_SUMMARY_FAILED;
    use crate::fingerprint::fingerprint;
    use crate::llm::{
        HeadlineGrouper, ImportanceJudge, ImportanceResponse, RegionVerifier,
        SentimentClassifier, SentimentResponse, StrsimHeadlineGrouper, SummaryResponse,
        Summarizer,
    };
    use crate::pipeline::types::Sentiment;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedSummarizer {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for ScriptedSummarizer {
        async fn summarize(&self, request: &SummaryRequest) -> anyhow::Result<SummaryResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("model unavailable");
            }
            Ok(SummaryResponse {
                summary: format!("Summary of {}", request.title),
                relevance_score: 0.9,
                detected_source: None,
            })
        }
    }

    /// Answers with the queued verdicts, then never answers.
    #[derive(Default)]
    struct ScriptedVerifier {
        verdicts: Mutex<VecDeque<RegionVerdict>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegionVerifier for ScriptedVerifier {
        async fn verify_region(&self, _request: &RegionRequest) -> anyhow::Result<RegionVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.verdicts.lock().unwrap().pop_front();
            match next {
                Some(verdict) => Ok(verdict),
                None => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    anyhow::bail!("no answer")
                }
            }
        }
    }

    #[derive(Default)]
    struct ScriptedJudge {
        fail: bool,
        categories: Mutex<Vec<Category>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ImportanceJudge for ScriptedJudge {
        async fn score_importance(
            &self,
            request: &ImportanceRequest,
        ) -> anyhow::Result<ImportanceResponse> {
            self.categories.lock().unwrap().push(request.category);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                anyhow::bail!("scoring failed");
            }
            Ok(ImportanceResponse {
                score: 7.0,
                rationale: "scripted".to_string(),
            })
        }
    }

    struct NegativeSentiment;

    #[async_trait]
    impl SentimentClassifier for NegativeSentiment {
        async fn classify_sentiment(
            &self,
            _title: &str,
            _summary: &str,
        ) -> anyhow::Result<SentimentResponse> {
            Ok(SentimentResponse {
                sentiment: Sentiment::Negative,
                confidence: 0.9,
            })
        }
    }

    #[derive(Default)]
    struct Fakes {
        summarizer: Arc<ScriptedSummarizer>,
        verifier: Arc<ScriptedVerifier>,
        judge: Arc<ScriptedJudge>,
    }

    impl Fakes {
        fn with_verdicts(verdicts: Vec<RegionVerdict>) -> Self {
            let fakes = Fakes::default();
            fakes.verifier.verdicts.lock().unwrap().extend(verdicts);
            fakes
        }

        fn collaborators(&self) -> Collaborators {
            let grouper: Arc<dyn HeadlineGrouper> = Arc::new(StrsimHeadlineGrouper);
            Collaborators {
                summarizer: self.summarizer.clone(),
                region_verifier: self.verifier.clone(),
                importance_judge: self.judge.clone(),
                sentiment: Arc::new(NegativeSentiment),
                grouper,
            }
        }
    }

    fn settings() -> Settings {
        Settings {
            gate_cooldown: Duration::ZERO,
            gate_max_retries: 3,
            llm_timeout: Duration::from_millis(200),
            worker_concurrency: 2,
            ..Settings::default()
        }
    }

    /// A resolved primary article; returns its id.
    pub(crate) async fn seed_primary(db: &Database, title: &str, body: &str) -> i64 {
        let raw = db
            .add_raw_article(&NewRawArticle {
                source: "wire".to_string(),
                url: format!("https://example.com/{}", title.replace(' ', "-")),
                title: title.to_string(),
                body: Some(body.to_string()),
                published_at: Some(1_700_000_000),
            })
            .await
            .unwrap();
        let filtered = db
            .add_filtered_article(raw, &["subway".to_string()], fingerprint(body).as_ref())
            .await
            .unwrap();
        assert!(db.establish_primary(filtered).await.unwrap());
        filtered
    }

    /// A `pending` news summary; returns its id.
    pub(crate) async fn seed_pending(db: &Database, title: &str, body: &str) -> i64 {
        let primary = seed_primary(db, title, body).await;
        db.create_news_summary(primary, "summary", None, 0.9)
            .await
            .unwrap()
            .unwrap()
    }

    async fn summary(db: &Database, id: i64) -> NewsSummary {
        db.get_news_summary(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_region_passes_count_each_attempt_once() {
        let db = Database::in_memory().await.unwrap();
        let settings = settings();
        let fakes = Fakes::default();
        let collaborators = fakes.collaborators();
        let id = seed_pending(&db, "Beijing subway adds night service", "Beijing trains run late.").await;

        run_classify_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(summary(&db, id).await.status().unwrap(), SummaryStatus::PendingBeijingGate);

        let mut rounds = 0;
        while summary(&db, id).await.status().unwrap() == SummaryStatus::PendingBeijingGate {
            rounds += 1;
            assert!(rounds <= 5, "region gate never failed open");
            let (a, b, c) = tokio::join!(
                run_region_gate_pass(&db, &settings, &collaborators),
                run_region_gate_pass(&db, &settings, &collaborators),
                run_region_gate_pass(&db, &settings, &collaborators),
            );
            a.unwrap();
            b.unwrap();
            c.unwrap();

            let row = summary(&db, id).await;
            assert_eq!(row.beijing_gate_fail_count, rounds);
        }

        let row = summary(&db, id).await;
        assert_eq!(rounds, 3);
        assert_eq!(row.status().unwrap(), SummaryStatus::ReadyForExport);
        assert_eq!(row.beijing_gate_fail_count, 3);
        assert!(row.is_beijing_related);
    }

    #[tokio::test]
    async fn test_region_overturn_resets_and_scores_as_external() {
        let db = Database::in_memory().await.unwrap();
        let settings = settings();
        let fakes = Fakes::with_verdicts(vec![
            RegionVerdict::Inconclusive {
                reason: "unsure".to_string(),
            },
            RegionVerdict::ConfirmedUnrelated {
                rationale: "about Beijing Road in Guangzhou".to_string(),
            },
        ]);
        let collaborators = fakes.collaborators();
        let id = seed_pending(&db, "Beijing Road subway exit reopens", "Guangzhou shoppers return.").await;

        run_classify_pass(&db, &settings, &collaborators).await.unwrap();
        run_region_gate_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(summary(&db, id).await.beijing_gate_fail_count, 1);

        let stats = run_region_gate_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(stats.advanced, 1);
        let row = summary(&db, id).await;
        assert_eq!(row.status().unwrap(), SummaryStatus::PendingExternalFilter);
        assert!(!row.is_beijing_related);
        assert_eq!(row.beijing_llm_confirmed, Some(false));
        assert_eq!(row.beijing_gate_fail_count, 0);

        run_external_filter_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(summary(&db, id).await.status().unwrap(), SummaryStatus::ReadyForExport);
        assert_eq!(
            *fakes.judge.categories.lock().unwrap(),
            vec![Category::new(Region::External, Sentiment::Negative)]
        );
    }

    #[tokio::test]
    async fn test_external_filter_errors_end_in_failed() {
        let db = Database::in_memory().await.unwrap();
        let settings = settings();
        let fakes = Fakes {
            judge: Arc::new(ScriptedJudge {
                fail: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let collaborators = fakes.collaborators();
        let id = seed_pending(&db, "Subway drivers plan strike", "Talks have stalled.").await;

        run_classify_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(summary(&db, id).await.status().unwrap(), SummaryStatus::PendingExternalFilter);

        for _ in 0..3 {
            run_external_filter_pass(&db, &settings, &collaborators).await.unwrap();
        }
        let row = summary(&db, id).await;
        assert_eq!(row.status().unwrap(), SummaryStatus::Failed);
        assert_eq!(row.external_filter_fail_count, 3);

        // terminal rows are not picked up again
        let stats = run_external_filter_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(stats.attempted, 0);
        assert_eq!(fakes.judge.categories.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_summarize_failures_park_the_primary() {
        let db = Database::in_memory().await.unwrap();
        let settings = settings();
        let fakes = Fakes {
            summarizer: Arc::new(ScriptedSummarizer {
                fail: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let collaborators = fakes.collaborators();
        let primary = seed_primary(&db, "Subway map redesigned", "New colours for every line.").await;

        let mut parked = 0;
        for _ in 0..3 {
            parked += run_summarize_pass(&db, &settings, &collaborators)
                .await
                .unwrap()
                .advanced;
        }
        assert_eq!(parked, 1);

        let (status, fail_count) = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, summarize_fail_count FROM primary_articles WHERE id = ?1",
        )
        .bind(primary)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(status, PRIMARY_SUMMARY_FAILED);
        assert_eq!(fail_count, 3);

        let stats = run_summarize_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(stats.attempted, 0);
        assert_eq!(fakes.summarizer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cooldown_skips_recently_attempted_rows() {
        let db = Database::in_memory().await.unwrap();
        let settings = Settings {
            gate_cooldown: Duration::from_secs(300),
            ..settings()
        };
        let fakes = Fakes::with_verdicts(vec![RegionVerdict::Inconclusive {
            reason: "unsure".to_string(),
        }]);
        let collaborators = fakes.collaborators();
        let id = seed_pending(&db, "Beijing subway fares", "Beijing fares stay flat.").await;

        run_classify_pass(&db, &settings, &collaborators).await.unwrap();
        let first = run_region_gate_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!((first.attempted, first.retried), (1, 1));

        let second = run_region_gate_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(second.attempted, 0);
        assert_eq!(fakes.verifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary(&db, id).await.beijing_gate_fail_count, 1);
    }

    #[tokio::test]
    async fn test_pass_bounds_simultaneous_calls() {
        let db = Database::in_memory().await.unwrap();
        let settings = settings();
        let fakes = Fakes::default();
        let collaborators = fakes.collaborators();
        for n in 0..5 {
            seed_pending(&db, &format!("Subway story number {}", n), &format!("Body {} about trains.", n)).await;
        }

        run_classify_pass(&db, &settings, &collaborators).await.unwrap();
        let stats = run_external_filter_pass(&db, &settings, &collaborators).await.unwrap();
        assert_eq!(stats.advanced, 5);
        assert!(fakes.judge.max_in_flight.load(Ordering::SeqCst) <= settings.worker_concurrency);
    }
}
