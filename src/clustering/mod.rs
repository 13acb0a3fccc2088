//! Precomputed review clusters.
//!
//! Refresh groups review-pending candidates per bucket and stores only ordered id lists in
//! `cluster_index`. Reads expand those lists against live state, so a reviewer's decision hides
//! an item on the very next read even though the cache itself is only rebuilt periodically.

pub mod rank;
pub mod read;
pub mod refresh;
pub mod types;

pub use types::*;

pub use rank::{rank_order, sort_by_rank};
pub use read::{list_candidates, list_clusters};
pub use refresh::{refresh_clusters, CLUSTER_LOCK_NAME};

/// Upper bound for one page of clusters or candidates.
pub const MAX_PAGE_SIZE: usize = 200;
