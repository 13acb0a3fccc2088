//! Composite rank key: importance score, manual rank, relevance score, publish time, each
//! descending with missing values last. The summary id breaks remaining ties so the order is
//! total.

use std::cmp::Ordering;

use crate::db::cluster_index::ReviewCandidate;

fn descending_nulls_last<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn rank_order(a: &ReviewCandidate, b: &ReviewCandidate) -> Ordering {
    descending_nulls_last(a.importance_score, b.importance_score)
        .then_with(|| descending_nulls_last(a.sort_rank, b.sort_rank))
        .then_with(|| descending_nulls_last(a.relevance_score, b.relevance_score))
        .then_with(|| descending_nulls_last(a.published_at, b.published_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_by_rank(candidates: &mut [ReviewCandidate]) {
    candidates.sort_by(rank_order);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64, importance: Option<f64>, rank: Option<i64>, relevance: Option<f64>) -> ReviewCandidate {
        ReviewCandidate {
            id,
            title: format!("story {}", id),
            summary: String::new(),
            source: "wire".to_string(),
            url: format!("https://example.com/{}", id),
            is_beijing_related: true,
            sentiment: Some("positive".to_string()),
            importance_score: importance,
            sort_rank: rank,
            relevance_score: relevance,
            published_at: None,
            version: 1,
        }
    }

    #[test]
    fn test_rank_key_order_and_nulls_last() {
        let mut items = vec![
            candidate(1, None, None, Some(0.9)),
            candidate(2, Some(5.0), None, Some(0.7)),
            candidate(3, Some(5.0), Some(2), Some(0.1)),
            candidate(4, Some(9.0), None, None),
            candidate(5, None, None, Some(0.9)),
            candidate(6, Some(5.0), None, Some(0.8)),
        ];
        sort_by_rank(&mut items);
        let ids: Vec<i64> = items.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![4, 3, 6, 2, 1, 5]);
    }
}
