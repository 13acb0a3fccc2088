//! Reviewer decisions on export-ready summaries.
//!
//! Every write may carry the `expected_version` the reviewer last saw. A stale version turns
//! that item into a conflict instead of overwriting someone else's decision; the rest of a
//! best-effort batch still goes through. Omitting the version always wins.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::db::review::{ReviewChange, ReviewUpdate, ReviewWrite};
use crate::db::Database;
use crate::TARGET_WEB_REQUEST;

/// A request that can never apply, as opposed to a conflict or a storage failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRequest(pub String);

impl fmt::Display for InvalidRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvalidRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Pending,
    Selected,
    Backup,
    Discarded,
    Exported,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Pending => "pending",
            Disposition::Selected => "selected",
            Disposition::Backup => "backup",
            Disposition::Discarded => "discarded",
            Disposition::Exported => "exported",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Disposition::Pending),
            "selected" => Ok(Disposition::Selected),
            "backup" => Ok(Disposition::Backup),
            "discarded" => Ok(Disposition::Discarded),
            "exported" => Ok(Disposition::Exported),
            other => Err(format!("unknown disposition: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Each item stands alone; conflicts are reported per item.
    #[default]
    BestEffort,
    /// All or nothing: the first item that does not apply rolls the batch back.
    Strict,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionItem {
    pub id: i64,
    pub disposition: Disposition,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Applied { version: i64 },
    Conflict { current_version: i64 },
    NotFound,
    /// Would have applied, but a strict batch was rolled back.
    RolledBack,
}

impl From<ReviewWrite> for DecisionOutcome {
    fn from(write: ReviewWrite) -> Self {
        match write {
            ReviewWrite::Applied { version } => DecisionOutcome::Applied { version },
            ReviewWrite::Conflict { current_version } => {
                DecisionOutcome::Conflict { current_version }
            }
            ReviewWrite::NotFound => DecisionOutcome::NotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionResult {
    pub id: i64,
    #[serde(flatten)]
    pub outcome: DecisionOutcome,
}

/// Applies a batch of dispositions.
pub async fn apply_decisions(
    db: &Database,
    items: &[DecisionItem],
    mode: BatchMode,
    actor: Option<&str>,
) -> Result<Vec<DecisionResult>> {
    let updates: Vec<ReviewUpdate> = items
        .iter()
        .map(|item| ReviewUpdate {
            summary_id: item.id,
            change: ReviewChange {
                status: Some(item.disposition),
                ..Default::default()
            },
            expected_version: item.expected_version,
        })
        .collect();

    let results = run_batch(db, &updates, mode, actor).await?;
    let conflicts = results
        .iter()
        .filter(|r| !matches!(r.outcome, DecisionOutcome::Applied { .. }))
        .count();
    info!(target: TARGET_WEB_REQUEST, "Applied {} decisions ({:?}), {} not applied", results.len() - conflicts, mode, conflicts);
    Ok(results)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewEdit {
    /// Replacement summary text; an empty string restores the generated summary.
    #[serde(default)]
    pub summary_override: Option<String>,
    #[serde(default)]
    pub source_override: Option<String>,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

/// Overrides the summary and/or source shown for one item.
pub async fn edit_review(
    db: &Database,
    id: i64,
    edit: &ReviewEdit,
    actor: Option<&str>,
) -> Result<DecisionOutcome> {
    if edit.summary_override.is_none() && edit.source_override.is_none() {
        return Err(InvalidRequest(format!("edit for item {} changes nothing", id)).into());
    }

    let update = ReviewUpdate {
        summary_id: id,
        change: ReviewChange {
            summary_override: edit.summary_override.clone(),
            source_override: edit.source_override.clone(),
            ..Default::default()
        },
        expected_version: edit.expected_version,
    };
    Ok(db.update_review(&update, actor).await?.into())
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReorderRequest {
    pub disposition: Disposition,
    /// Full order for the disposition, first id shown first.
    pub ids: Vec<i64>,
    #[serde(default)]
    pub expected_versions: HashMap<i64, i64>,
    #[serde(default)]
    pub actor: Option<String>,
}

/// Assigns manual ranks so `ids` sort in the given order. An item that has meanwhile left the
/// disposition is reported as a conflict.
pub async fn reorder(db: &Database, request: &ReorderRequest) -> Result<Vec<DecisionResult>> {
    let mut seen = HashSet::new();
    if let Some(dup) = request.ids.iter().find(|id| !seen.insert(**id)) {
        return Err(InvalidRequest(format!("item {} appears twice in the order", dup)).into());
    }

    let count = request.ids.len() as i64;
    let updates: Vec<ReviewUpdate> = request
        .ids
        .iter()
        .enumerate()
        .map(|(index, id)| ReviewUpdate {
            summary_id: *id,
            change: ReviewChange {
                sort_rank: Some(count - index as i64),
                require_status: Some(request.disposition),
                ..Default::default()
            },
            expected_version: request.expected_versions.get(id).copied(),
        })
        .collect();

    run_batch(db, &updates, BatchMode::BestEffort, request.actor.as_deref()).await
}

async fn run_batch(
    db: &Database,
    updates: &[ReviewUpdate],
    mode: BatchMode,
    actor: Option<&str>,
) -> Result<Vec<DecisionResult>> {
    match mode {
        BatchMode::BestEffort => {
            let mut results = Vec::with_capacity(updates.len());
            for update in updates {
                let outcome = db.update_review(update, actor).await?.into();
                results.push(DecisionResult {
                    id: update.summary_id,
                    outcome,
                });
            }
            Ok(results)
        }
        BatchMode::Strict => {
            let writes = db.update_reviews_atomically(updates, actor).await?;
            let committed =
                writes.len() == updates.len() && writes.iter().all(|w| w.is_applied());
            if !committed {
                warn!(target: TARGET_WEB_REQUEST, "Strict decision batch of {} rolled back", updates.len());
            }

            Ok(updates
                .iter()
                .enumerate()
                .map(|(i, update)| {
                    let outcome = match writes.get(i) {
                        Some(write) if committed || !write.is_applied() => (*write).into(),
                        _ => DecisionOutcome::RolledBack,
                    };
                    DecisionResult {
                        id: update.summary_id,
                        outcome,
                    }
                })
                .collect())
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::raw::NewRawArticle;
    use crate::db::summary::{Gate, GateUpdate};
    use crate::fingerprint::fingerprint;
    use crate::pipeline::state::Transition;
    use crate::pipeline::types::{Sentiment, SummaryStatus};

    /// Pushes one article through storage to `ready_for_export` and returns its summary id.
    pub(crate) async fn seed_ready(
        db: &Database,
        title: &str,
        beijing: bool,
        sentiment: Sentiment,
        importance: Option<f64>,
    ) -> i64 {
        let url = format!("https://example.com/{}", title.replace(' ', "-"));
        let raw = db
            .add_raw_article(&NewRawArticle {
                source: "wire".to_string(),
                url,
                title: title.to_string(),
                body: Some(format!("{} body", title)),
                published_at: Some(1_700_000_000),
            })
            .await
            .unwrap();
        let body = format!("{} body", title);
        let filtered = db
            .add_filtered_article(raw, &["beijing".to_string()], fingerprint(&body).as_ref())
            .await
            .unwrap();
        assert!(db.establish_primary(filtered).await.unwrap());
        let summary = db
            .create_news_summary(filtered, "summary", Some("Wire"), 0.9)
            .await
            .unwrap()
            .unwrap();

        let next = if beijing {
            SummaryStatus::PendingBeijingGate
        } else {
            SummaryStatus::PendingExternalFilter
        };
        let classified = GateUpdate {
            beijing_keyword_match: Some(beijing),
            sentiment: Some(sentiment),
            sentiment_confidence: Some(0.9),
            ..Default::default()
        };
        assert!(db
            .apply_gate_transition(summary, Gate::Classify, Transition::Advance { to: next }, 0, &classified)
            .await
            .unwrap());

        let ready = Transition::Advance {
            to: SummaryStatus::ReadyForExport,
        };
        let gate = if beijing {
            Gate::BeijingGate
        } else {
            Gate::ExternalFilter
        };
        let scored = GateUpdate {
            importance_score: importance,
            ..Default::default()
        };
        assert!(db
            .apply_gate_transition(summary, gate, ready, 0, &scored)
            .await
            .unwrap());
        summary
    }

    fn decide(id: i64, disposition: Disposition, expected_version: Option<i64>) -> DecisionItem {
        DecisionItem {
            id,
            disposition,
            expected_version,
        }
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_and_one_writer_wins() {
        let db = Database::in_memory().await.unwrap();
        let id = seed_ready(&db, "airport line", true, Sentiment::Positive, None).await;
        assert_eq!(db.get_review(id).await.unwrap().unwrap().version, 1);

        let first = apply_decisions(&db, &[decide(id, Disposition::Selected, Some(1))], BatchMode::BestEffort, Some("alice"))
            .await
            .unwrap();
        let second = apply_decisions(&db, &[decide(id, Disposition::Discarded, Some(1))], BatchMode::BestEffort, Some("bob"))
            .await
            .unwrap();

        assert_eq!(first[0].outcome, DecisionOutcome::Applied { version: 2 });
        assert_eq!(second[0].outcome, DecisionOutcome::Conflict { current_version: 2 });

        let review = db.get_review(id).await.unwrap().unwrap();
        assert_eq!(review.status, "selected");
        assert_eq!(review.updated_by.as_deref(), Some("alice"));
        assert!(review.decided_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_version_always_applies() {
        let db = Database::in_memory().await.unwrap();
        let id = seed_ready(&db, "heatwave", false, Sentiment::Negative, Some(8.0)).await;

        for disposition in [Disposition::Selected, Disposition::Backup, Disposition::Pending] {
            let results = apply_decisions(&db, &[decide(id, disposition, None)], BatchMode::BestEffort, None)
                .await
                .unwrap();
            assert!(matches!(results[0].outcome, DecisionOutcome::Applied { .. }));
        }
        let review = db.get_review(id).await.unwrap().unwrap();
        assert_eq!(review.version, 4);
        assert_eq!(review.status, "pending");
        assert_eq!(review.decided_at, None);
    }

    #[tokio::test]
    async fn test_best_effort_batch_applies_around_conflicts() {
        let db = Database::in_memory().await.unwrap();
        let a = seed_ready(&db, "first story", true, Sentiment::Positive, None).await;
        let b = seed_ready(&db, "second story", true, Sentiment::Positive, None).await;

        let results = apply_decisions(
            &db,
            &[
                decide(a, Disposition::Selected, Some(7)),
                decide(b, Disposition::Selected, Some(1)),
                decide(9999, Disposition::Selected, None),
            ],
            BatchMode::BestEffort,
            None,
        )
        .await
        .unwrap();

        assert_eq!(results[0].outcome, DecisionOutcome::Conflict { current_version: 1 });
        assert_eq!(results[1].outcome, DecisionOutcome::Applied { version: 2 });
        assert_eq!(results[2].outcome, DecisionOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_strict_batch_rolls_back_on_conflict() {
        let db = Database::in_memory().await.unwrap();
        let a = seed_ready(&db, "first story", true, Sentiment::Positive, None).await;
        let b = seed_ready(&db, "second story", true, Sentiment::Positive, None).await;

        let results = apply_decisions(
            &db,
            &[
                decide(a, Disposition::Selected, Some(1)),
                decide(b, Disposition::Selected, Some(5)),
                decide(a, Disposition::Backup, None),
            ],
            BatchMode::Strict,
            None,
        )
        .await
        .unwrap();

        assert_eq!(results[0].outcome, DecisionOutcome::RolledBack);
        assert_eq!(results[1].outcome, DecisionOutcome::Conflict { current_version: 1 });
        assert_eq!(results[2].outcome, DecisionOutcome::RolledBack);

        let review = db.get_review(a).await.unwrap().unwrap();
        assert_eq!(review.version, 1);
        assert_eq!(review.status, "pending");
    }

    #[tokio::test]
    async fn test_edit_and_clear_override() {
        let db = Database::in_memory().await.unwrap();
        let id = seed_ready(&db, "river cleanup", true, Sentiment::Positive, None).await;

        let edit = ReviewEdit {
            summary_override: Some("Tighter summary".to_string()),
            source_override: Some("Xinhua".to_string()),
            expected_version: Some(1),
        };
        assert_eq!(
            edit_review(&db, id, &edit, Some("carol")).await.unwrap(),
            DecisionOutcome::Applied { version: 2 }
        );
        let candidates = db.fetch_review_candidates(10).await.unwrap();
        assert_eq!(candidates[0].summary, "Tighter summary");
        assert_eq!(candidates[0].source, "Xinhua");

        let clear = ReviewEdit {
            summary_override: Some(String::new()),
            ..Default::default()
        };
        edit_review(&db, id, &clear, None).await.unwrap();
        let candidates = db.fetch_review_candidates(10).await.unwrap();
        assert_eq!(candidates[0].summary, "summary");
        assert_eq!(candidates[0].source, "Xinhua");

        assert!(edit_review(&db, id, &ReviewEdit::default(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_reorder_ranks_first_id_highest() {
        let db = Database::in_memory().await.unwrap();
        let a = seed_ready(&db, "first story", true, Sentiment::Positive, None).await;
        let b = seed_ready(&db, "second story", true, Sentiment::Positive, None).await;
        let c = seed_ready(&db, "third story", true, Sentiment::Positive, None).await;
        apply_decisions(&db, &[decide(c, Disposition::Selected, None)], BatchMode::BestEffort, None)
            .await
            .unwrap();

        let request = ReorderRequest {
            disposition: Disposition::Pending,
            ids: vec![b, a, c],
            expected_versions: HashMap::new(),
            actor: Some("dave".to_string()),
        };
        let results = reorder(&db, &request).await.unwrap();
        assert!(matches!(results[0].outcome, DecisionOutcome::Applied { .. }));
        assert!(matches!(results[1].outcome, DecisionOutcome::Applied { .. }));
        assert!(matches!(results[2].outcome, DecisionOutcome::Conflict { .. }));

        let rank_a = db.get_review(a).await.unwrap().unwrap().sort_rank.unwrap();
        let rank_b = db.get_review(b).await.unwrap().unwrap().sort_rank.unwrap();
        assert!(rank_b > rank_a);

        let duplicated = ReorderRequest {
            ids: vec![a, a],
            ..request
        };
        assert!(reorder(&db, &duplicated).await.is_err());
    }
}
