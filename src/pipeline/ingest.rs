use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::db::Database;
use crate::fingerprint::fingerprint;
use crate::keywords::KeywordFilter;
use crate::TARGET_PIPELINE;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub checked: usize,
    pub matched: usize,
    pub unfingerprinted: usize,
}

/// Runs the keyword filter over every unchecked raw article with a body. A match creates the
/// filtered article with its fingerprints; every checked article is marked so it is not
/// looked at again unless its body is backfilled.
pub async fn run_filter_pass(
    db: &Database,
    filter: &KeywordFilter,
    batch_size: i64,
) -> Result<FilterStats> {
    let mut stats = FilterStats::default();

    loop {
        let batch = db
            .fetch_unchecked_raw_articles(batch_size)
            .await
            .context("Failed to fetch unchecked raw articles")?;
        if batch.is_empty() {
            break;
        }

        for article in &batch {
            let body = article.body.as_deref().unwrap_or_default();
            let matched = filter.matches(&article.title, body);
            if !matched.is_empty() {
                let fp = fingerprint(body);
                if fp.is_none() {
                    stats.unfingerprinted += 1;
                }
                let filtered_id = db
                    .add_filtered_article(article.id, &matched, fp.as_ref())
                    .await
                    .with_context(|| format!("Failed to store filtered article for raw {}", article.id))?;
                debug!(target: TARGET_PIPELINE, "Raw article {} matched {:?} -> filtered {}", article.id, matched, filtered_id);
                stats.matched += 1;
            }
            db.mark_filter_checked(article.id).await?;
            stats.checked += 1;
        }
    }

    if stats.checked > 0 {
        info!(target: TARGET_PIPELINE, "Keyword filter checked {} raw articles, {} matched", stats.checked, stats.matched);
    }
    Ok(stats)
}
