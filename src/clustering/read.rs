use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::rank::sort_by_rank;
use super::refresh::refresh_clusters;
use super::types::{paginate, CandidatePage, ClusterPage, ReviewCluster, ReviewQuery};
use crate::db::Database;
use crate::environment::Settings;
use crate::llm::HeadlineGrouper;
use crate::TARGET_CACHE;

/// Serves cached clusters reconciled against live state.
///
/// Each stored id list is re-read from the live tables and filtered to rows that are still
/// export-ready and review-pending; size and representative are recomputed and emptied
/// clusters dropped before paging. With `force_refresh` a refresh is attempted first; if that
/// is skipped or fails the existing cache is served.
pub async fn list_clusters(
    db: &Database,
    settings: &Settings,
    grouper: &dyn HeadlineGrouper,
    query: &ReviewQuery,
) -> Result<ClusterPage> {
    if query.force_refresh {
        if let Err(e) = refresh_clusters(db, settings, grouper).await {
            warn!(target: TARGET_CACHE, "Forced refresh failed, serving previous cache: {:?}", e);
        }
    }

    let (page, page_size) = query.paging();
    let mut stored = Vec::new();
    for bucket in query.buckets() {
        stored.extend(
            db.load_clusters(Some(bucket.as_str()))
                .await
                .context("Failed to load cached clusters")?
                .into_iter()
                .map(|cluster| (bucket, cluster)),
        );
    }

    let ids: Vec<i64> = stored
        .iter()
        .flat_map(|(_, cluster)| cluster.article_ids.iter().copied())
        .collect();
    let live: HashMap<i64, _> = db
        .fetch_live_candidates(&ids)
        .await
        .context("Failed to read live review state")?
        .into_iter()
        .map(|candidate| (candidate.id, candidate))
        .collect();

    let mut clusters = Vec::with_capacity(stored.len());
    for (bucket, cluster) in stored {
        let mut members: Vec<_> = cluster
            .article_ids
            .iter()
            .filter_map(|id| live.get(id))
            .filter(|candidate| candidate.category() == Some(bucket))
            .cloned()
            .collect();
        if members.is_empty() {
            continue;
        }
        sort_by_rank(&mut members);
        clusters.push(ReviewCluster {
            bucket,
            representative: members[0].clone(),
            size: members.len(),
            members,
        });
    }

    let total = clusters.len();
    debug!(target: TARGET_CACHE, "{} live clusters for {:?}", total, query.buckets());
    Ok(ClusterPage {
        clusters: paginate(clusters, page, page_size),
        total,
        page,
        page_size,
    })
}

/// Flat, live list of review-pending candidates in rank order.
pub async fn list_candidates(
    db: &Database,
    settings: &Settings,
    query: &ReviewQuery,
) -> Result<CandidatePage> {
    let (page, page_size) = query.paging();
    let buckets = query.buckets();

    let mut candidates: Vec<_> = db
        .fetch_review_candidates(settings.cluster_candidate_cap)
        .await
        .context("Failed to fetch review candidates")?
        .into_iter()
        .filter(|candidate| {
            candidate
                .category()
                .is_some_and(|category| buckets.contains(&category))
        })
        .collect();
    sort_by_rank(&mut candidates);

    let total = candidates.len();
    Ok(CandidatePage {
        candidates: paginate(candidates, page, page_size),
        total,
        page,
        page_size,
    })
}
