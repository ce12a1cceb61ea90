//! Reciprocal Rank Fusion: score = Σ weight_i / (k + rank_i)
//!
//! Combines ranked lists without normalizing their raw scores against each
//! other. Ranks are 1-based; an id missing from a list gets nothing from it.

use std::collections::{HashMap, HashSet};

/// Fuse weighted ranked lists of contact ids.
///
/// Returns `(contact_id, fused_score)` sorted by score descending, ties
/// broken by id ascending. An id repeated within one list only counts at
/// its best rank.
pub fn fuse(lists: &[(f64, Vec<i64>)], k: f64) -> Vec<(i64, f64)> {
    let mut scores: HashMap<i64, f64> = HashMap::new();

    for (weight, ids) in lists {
        let mut seen = HashSet::new();
        for (index, id) in ids.iter().enumerate() {
            if !seen.insert(*id) {
                continue;
            }
            let rank = (index + 1) as f64;
            *scores.entry(*id).or_default() += weight / (k + rank);
        }
    }

    let mut fused: Vec<(i64, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused
}
