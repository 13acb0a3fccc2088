use serde::{Deserialize, Serialize};

use crate::db::cluster_index::ReviewCandidate;
use crate::pipeline::types::{Category, Region, Sentiment};

/// A cluster as served to reviewers, rebuilt from live rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewCluster {
    pub bucket: Category,
    pub representative: ReviewCandidate,
    pub members: Vec<ReviewCandidate>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterPage {
    pub clusters: Vec<ReviewCluster>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePage {
    pub candidates: Vec<ReviewCandidate>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed { clusters: usize, articles: usize },
    /// Another refresh holds the lock; the previous cache is untouched.
    Skipped,
}

/// Bucket filter and paging for cluster and candidate reads. Pages are 1-based.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewQuery {
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub force_refresh: bool,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

impl Default for ReviewQuery {
    fn default() -> Self {
        Self {
            region: None,
            sentiment: None,
            page: default_page(),
            page_size: default_page_size(),
            force_refresh: false,
        }
    }
}

impl ReviewQuery {
    /// Buckets selected by the region/sentiment filter, in display order.
    pub fn buckets(&self) -> Vec<Category> {
        Category::all()
            .into_iter()
            .filter(|c| self.region.map_or(true, |r| c.region == r))
            .filter(|c| self.sentiment.map_or(true, |s| c.sentiment == s))
            .collect()
    }

    /// Clamped `(page, page_size)`.
    pub fn paging(&self) -> (usize, usize) {
        (self.page.max(1), self.page_size.clamp(1, super::MAX_PAGE_SIZE))
    }
}

/// Cuts one page out of `items`.
pub fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Vec<T> {
    items
        .into_iter()
        .skip((page - 1).saturating_mul(page_size))
        .take(page_size)
        .collect()
}
