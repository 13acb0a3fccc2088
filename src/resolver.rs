//! Collapses syndicated copies of one story onto a single primary article.
//!
//! Resolution order for each unresolved filtered article:
//! 1. exact `content_hash` match against an already resolved article,
//! 2. SimHash band candidates within `simhash_max_distance` bits,
//! 3. otherwise the article becomes its own primary.
//!
//! On several matches the earliest-created primary wins, so reruns group the same way.
//! Articles are resolved one at a time within a pass; an established pointer is never moved.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::filtered::FilteredArticle;
use crate::db::Database;
use crate::fingerprint::{hamming_distance, simhash_bands};
use crate::TARGET_PIPELINE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    NewPrimary,
    ExactDuplicate { primary_id: i64 },
    NearDuplicate { primary_id: i64, distance: u32 },
    /// No fingerprint; left ungrouped.
    Skipped,
    /// Another resolver got there first.
    AlreadyResolved,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolveStats {
    pub new_primaries: usize,
    pub exact_duplicates: usize,
    pub near_duplicates: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl ResolveStats {
    pub fn resolved(&self) -> usize {
        self.new_primaries + self.exact_duplicates + self.near_duplicates + self.skipped
    }

    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::NewPrimary => self.new_primaries += 1,
            Resolution::ExactDuplicate { .. } => self.exact_duplicates += 1,
            Resolution::NearDuplicate { .. } => self.near_duplicates += 1,
            Resolution::Skipped => self.skipped += 1,
            Resolution::AlreadyResolved => {}
        }
    }
}

/// Resolves a single filtered article.
pub async fn resolve_article(
    db: &Database,
    article: &FilteredArticle,
    max_distance: u32,
) -> Result<Resolution> {
    let (Some(content_hash), Some(simhash)) = (article.content_hash.as_deref(), article.simhash)
    else {
        db.mark_resolution_skipped(article.id).await?;
        return Ok(Resolution::Skipped);
    };

    if let Some(primary_id) = db
        .find_primary_by_content_hash(content_hash, article.id)
        .await?
    {
        return Ok(match db.attach_to_primary(article.id, primary_id).await? {
            Some(primary_id) => Resolution::ExactDuplicate { primary_id },
            None => Resolution::AlreadyResolved,
        });
    }

    let candidates = db
        .find_band_candidates(&simhash_bands(simhash), article.id)
        .await?;
    // candidates come ordered by primary age, so the first hit is the earliest primary
    let nearest = candidates.iter().find_map(|candidate| {
        let distance = hamming_distance(simhash, candidate.simhash);
        (distance <= max_distance).then_some((candidate.primary_article_id, distance))
    });

    if let Some((primary_id, distance)) = nearest {
        return Ok(match db.attach_to_primary(article.id, primary_id).await? {
            Some(primary_id) => Resolution::NearDuplicate {
                primary_id,
                distance,
            },
            None => Resolution::AlreadyResolved,
        });
    }

    Ok(if db.establish_primary(article.id).await? {
        Resolution::NewPrimary
    } else {
        Resolution::AlreadyResolved
    })
}

/// Resolves every unresolved filtered article, batch by batch, until none are left or a batch
/// makes no progress.
pub async fn resolve_pending(
    db: &Database,
    max_distance: u32,
    batch_size: i64,
) -> Result<ResolveStats> {
    let mut stats = ResolveStats::default();

    loop {
        let batch = db
            .fetch_unresolved_filtered(batch_size)
            .await
            .context("Failed to fetch unresolved filtered articles")?;
        if batch.is_empty() {
            break;
        }

        let before = stats.resolved();
        for article in &batch {
            match resolve_article(db, article, max_distance).await {
                Ok(resolution) => {
                    debug!(target: TARGET_PIPELINE, "Filtered article {}: {:?}", article.id, resolution);
                    stats.record(resolution);
                }
                Err(e) => {
                    warn!(target: TARGET_PIPELINE, "Failed to resolve filtered article {}: {:?}", article.id, e);
                    stats.errors += 1;
                }
            }
        }

        if stats.resolved() == before {
            break;
        }
    }

    if stats.resolved() > 0 || stats.errors > 0 {
        info!(target: TARGET_PIPELINE, "Resolution pass: {:?}", stats);
    }
    Ok(stats)
}

/// Ids of filtered articles whose primary pointer does not land on a self-rooted primary.
/// Empty when the store is consistent.
pub async fn verify_primary_invariant(db: &Database) -> Result<Vec<i64>> {
    db.find_primary_chain_violations()
        .await
        .context("Failed to check primary pointers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::filtered::{STATUS_DUPLICATE, STATUS_PRIMARY, STATUS_UNRESOLVED_SKIPPED};
    use crate::db::raw::NewRawArticle;
    use crate::fingerprint::{fingerprint, Fingerprint};

    async fn seed(db: &Database, url: &str, body: &str, fp: Option<Fingerprint>) -> i64 {
        let raw_id = db
            .add_raw_article(&NewRawArticle {
                source: "wire".to_string(),
                url: url.to_string(),
                title: format!("Story at {}", url),
                body: Some(body.to_string()),
                published_at: None,
            })
            .await
            .unwrap();
        db.add_filtered_article(raw_id, &["beijing".to_string()], fp.as_ref())
            .await
            .unwrap()
    }

    fn hashed(simhash: u64, tag: &str) -> Option<Fingerprint> {
        Some(Fingerprint {
            content_hash: tag.to_string(),
            simhash,
        })
    }

    const BASE: u64 = 0x0123_4567_89ab_cdef;

    #[tokio::test]
    async fn test_identical_bodies_share_one_primary() {
        let db = Database::in_memory().await.unwrap();
        let body = "Beijing opens a new subway line connecting the airport and the city centre.";
        let first = seed(&db, "https://a.example/1", body, fingerprint(body)).await;
        let second = seed(&db, "https://b.example/1", body, fingerprint(body)).await;

        let stats = resolve_pending(&db, 3, 10).await.unwrap();
        assert_eq!(stats.new_primaries, 1);
        assert_eq!(stats.exact_duplicates, 1);
        assert_eq!(db.count_primary_articles().await.unwrap(), 1);

        let dup = db.get_filtered_article(second).await.unwrap().unwrap();
        assert_eq!(dup.primary_article_id, Some(first));
        assert_eq!(dup.status, STATUS_DUPLICATE);
    }

    #[tokio::test]
    async fn test_near_duplicates_use_hamming_threshold() {
        let db = Database::in_memory().await.unwrap();
        let primary = seed(&db, "https://a.example/1", "a", hashed(BASE, "a")).await;
        let near = seed(&db, "https://a.example/2", "b", hashed(BASE ^ 0b101, "b")).await;
        // one whole band differs: still a band candidate, but too far away
        let far = seed(&db, "https://a.example/3", "c", hashed(BASE ^ 0xffff, "c")).await;

        let stats = resolve_pending(&db, 3, 10).await.unwrap();
        assert_eq!(stats.near_duplicates, 1);
        assert_eq!(stats.new_primaries, 2);

        let near = db.get_filtered_article(near).await.unwrap().unwrap();
        assert_eq!(near.primary_article_id, Some(primary));
        let far = db.get_filtered_article(far).await.unwrap().unwrap();
        assert_eq!(far.primary_article_id, Some(far.id));
        assert_eq!(far.status, STATUS_PRIMARY);
    }

    #[tokio::test]
    async fn test_earliest_primary_wins() {
        let db = Database::in_memory().await.unwrap();
        let earliest = seed(&db, "https://a.example/1", "a", hashed(BASE, "a")).await;
        let later = seed(&db, "https://a.example/2", "b", hashed(BASE ^ 0xf, "b")).await;
        let between = seed(&db, "https://a.example/3", "c", hashed(BASE ^ 0x3, "c")).await;

        resolve_pending(&db, 3, 10).await.unwrap();

        let later = db.get_filtered_article(later).await.unwrap().unwrap();
        assert_eq!(later.primary_article_id, Some(later.id));
        let between = db.get_filtered_article(between).await.unwrap().unwrap();
        assert_eq!(between.primary_article_id, Some(earliest));
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent_and_never_chains() {
        let db = Database::in_memory().await.unwrap();
        let mut ids = Vec::new();
        for (i, bits) in [0u64, 0b1, 0b11, 0xff00, 0xff01].iter().enumerate() {
            let url = format!("https://a.example/{}", i);
            ids.push(seed(&db, &url, "x", hashed(BASE ^ bits, &i.to_string())).await);
        }

        resolve_pending(&db, 3, 2).await.unwrap();
        let mut before = Vec::new();
        for id in &ids {
            before.push(db.get_filtered_article(*id).await.unwrap().unwrap().primary_article_id);
        }

        let again = resolve_pending(&db, 3, 2).await.unwrap();
        assert_eq!(again, ResolveStats::default());
        for (id, pointer) in ids.iter().zip(&before) {
            let article = db.get_filtered_article(*id).await.unwrap().unwrap();
            assert_eq!(&article.primary_article_id, pointer);
        }
        assert!(verify_primary_invariant(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_fingerprint_is_skipped_not_retried() {
        let db = Database::in_memory().await.unwrap();
        let id = seed(&db, "https://a.example/1", "", None).await;

        let stats = resolve_pending(&db, 3, 10).await.unwrap();
        assert_eq!(stats.skipped, 1);
        let article = db.get_filtered_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, STATUS_UNRESOLVED_SKIPPED);
        assert_eq!(article.primary_article_id, None);

        assert_eq!(resolve_pending(&db, 3, 10).await.unwrap().skipped, 0);
    }

    #[tokio::test]
    async fn test_attach_refuses_unresolved_target() {
        let db = Database::in_memory().await.unwrap();
        let a = seed(&db, "https://a.example/1", "a", hashed(BASE, "a")).await;
        let b = seed(&db, "https://a.example/2", "b", hashed(BASE, "b")).await;
        assert!(db.attach_to_primary(b, a).await.is_err());
        assert!(db.establish_primary(a).await.unwrap());
        assert!(!db.establish_primary(a).await.unwrap());
        assert_eq!(db.attach_to_primary(b, a).await.unwrap(), Some(a));
        assert_eq!(db.attach_to_primary(b, a).await.unwrap(), None);
    }
}
