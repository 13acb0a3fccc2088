use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rank::sort_by_rank;
use super::types::RefreshOutcome;
use crate::db::cluster_index::{NewCluster, ReviewCandidate};
use crate::db::Database;
use crate::environment::Settings;
use crate::llm::HeadlineGrouper;
use crate::pipeline::types::Category;
use crate::TARGET_CACHE;

pub const CLUSTER_LOCK_NAME: &str = "cluster_refresh";

/// Rebuilds the whole cluster cache under the refresh lock.
///
/// Never waits for the lock: if another refresh holds it this returns `Skipped` and the
/// current cache stays as it is. The lock is held across the grouping call and released in
/// every outcome.
pub async fn refresh_clusters(
    db: &Database,
    settings: &Settings,
    grouper: &dyn HeadlineGrouper,
) -> Result<RefreshOutcome> {
    let holder = Uuid::new_v4().to_string();
    let ttl = settings.cluster_lock_ttl.as_secs() as i64;

    if !db
        .try_acquire_lock(CLUSTER_LOCK_NAME, &holder, ttl)
        .await
        .context("Failed to request the cluster refresh lock")?
    {
        info!(target: TARGET_CACHE, "Cluster refresh already running elsewhere, skipping");
        return Ok(RefreshOutcome::Skipped);
    }

    let result = rebuild(db, settings, grouper, &holder).await;

    match db.release_lock(CLUSTER_LOCK_NAME, &holder).await {
        Ok(true) => {}
        Ok(false) => warn!(target: TARGET_CACHE, "Cluster refresh lock expired before release ({})", holder),
        Err(e) => warn!(target: TARGET_CACHE, "Failed to release cluster refresh lock: {}", e),
    }

    match &result {
        Ok(outcome) => info!(target: TARGET_CACHE, "Cluster refresh {}: {:?}", holder, outcome),
        Err(e) => warn!(target: TARGET_CACHE, "Cluster refresh {} failed, keeping previous cache: {:?}", holder, e),
    }
    result
}

async fn rebuild(
    db: &Database,
    settings: &Settings,
    grouper: &dyn HeadlineGrouper,
    refresh_id: &str,
) -> Result<RefreshOutcome> {
    let candidates = db
        .fetch_review_candidates(settings.cluster_candidate_cap)
        .await
        .context("Failed to fetch review candidates")?;

    // every bucket is rewritten, including ones that are now empty
    let mut buckets: BTreeMap<Category, Vec<ReviewCandidate>> =
        Category::all().into_iter().map(|c| (c, Vec::new())).collect();
    for candidate in candidates {
        match candidate.category() {
            Some(category) => buckets.entry(category).or_default().push(candidate),
            None => warn!(target: TARGET_CACHE, "Summary {} has no usable sentiment, left out of clusters", candidate.id),
        }
    }

    let mut clusters = Vec::new();
    let mut articles = 0;
    for category in Category::all() {
        let members = buckets.remove(&category).unwrap_or_default();
        articles += members.len();
        let grouped = group_bucket(members, grouper, settings.cluster_similarity_threshold)
            .await
            .with_context(|| format!("Failed to group bucket {}", category))?;
        debug!(target: TARGET_CACHE, "Bucket {}: {} clusters", category, grouped.len());

        clusters.extend(grouped.into_iter().map(|group| NewCluster {
            bucket: category.as_str().to_string(),
            article_ids: group.iter().map(|c| c.id).collect(),
        }));
    }

    let bucket_names: Vec<String> = Category::all()
        .iter()
        .map(|c| c.as_str().to_string())
        .collect();
    db.replace_clusters(&bucket_names, &clusters, refresh_id)
        .await
        .context("Failed to store refreshed clusters")?;

    Ok(RefreshOutcome::Refreshed {
        clusters: clusters.len(),
        articles,
    })
}

/// Ranks a bucket, groups it by headline, and ranks each group. Groups come back in the order
/// of their best member.
pub async fn group_bucket(
    mut members: Vec<ReviewCandidate>,
    grouper: &dyn HeadlineGrouper,
    threshold: f64,
) -> Result<Vec<Vec<ReviewCandidate>>> {
    if members.is_empty() {
        return Ok(Vec::new());
    }
    sort_by_rank(&mut members);

    let titles: Vec<String> = members.iter().map(|c| c.title.clone()).collect();
    let assignment = grouper.group_headlines(&titles, threshold).await?;
    if assignment.len() != members.len() {
        return Err(anyhow!(
            "grouper returned {} assignments for {} headlines",
            assignment.len(),
            members.len()
        ));
    }

    let mut order: Vec<usize> = Vec::new();
    let mut groups: BTreeMap<usize, Vec<ReviewCandidate>> = BTreeMap::new();
    for (group, member) in assignment.into_iter().zip(members) {
        if !groups.contains_key(&group) {
            order.push(group);
        }
        groups.entry(group).or_default().push(member);
    }

    Ok(order
        .into_iter()
        .filter_map(|group| groups.remove(&group))
        .map(|mut group| {
            sort_by_rank(&mut group);
            group
        })
        .collect())
}
