//! Deterministic ranking of vector search candidates.
//!
//! The retrieval engine fetches an inflated candidate set from a
//! [`VectorIndex`](crate::index::VectorIndex), drops candidates that are not
//! visible, and hands the rest to [`rank`].
//!
//! # Ranking
//!
//! 1. Drop candidates below `similarity_threshold`.
//! 2. Sort by [`compare_candidates`]: score (desc), `uploaded_at` (desc),
//!    sequence (asc), document id (asc), chunk id (asc). The last two keys
//!    make the order total, so a fixed index state always ranks the same.
//! 3. Walk the sorted list; drop a candidate if a higher-ranked candidate of
//!    the same document has a sequence index within `dedup_distance`.
//! 4. Truncate to `top_k`. Returning fewer results is expected.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::index::Candidate;

/// Post-filter parameters for one query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankParams {
    pub top_k: usize,
    pub similarity_threshold: f32,
    /// Same-document candidates whose sequences differ by at most this much
    /// are near-duplicates; `0` disables deduplication.
    pub dedup_distance: usize,
}

/// Total order over candidates, best first.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(b.record.uploaded_at.cmp(&a.record.uploaded_at))
        .then(a.record.sequence.cmp(&b.record.sequence))
        .then(a.record.document_id.cmp(&b.record.document_id))
        .then(a.record.chunk_id.cmp(&b.record.chunk_id))
}

/// Apply threshold, ordering, deduplication and truncation.
pub fn rank(mut candidates: Vec<Candidate>, params: &RankParams) -> Vec<Candidate> {
    candidates.retain(|c| c.score >= params.similarity_threshold);
    candidates.sort_by(compare_candidates);
    let mut ranked = dedupe_adjacent(candidates, params.dedup_distance);
    ranked.truncate(params.top_k);
    ranked
}

/// Keep only the best candidate among same-document neighbours.
///
/// `candidates` must already be sorted best first.
pub fn dedupe_adjacent(candidates: Vec<Candidate>, distance: usize) -> Vec<Candidate> {
    if distance == 0 {
        return candidates;
    }
    let mut kept: HashMap<String, Vec<usize>> = HashMap::new();
    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let sequences = kept
            .entry(candidate.record.document_id.clone())
            .or_default();
        let seq = candidate.record.sequence;
        if sequences.iter().any(|&s| s.abs_diff(seq) <= distance) {
            continue;
        }
        sequences.push(seq);
        out.push(candidate);
    }
    out
}

/// True if `text` contains every keyword, ignoring case.
pub fn contains_keywords(text: &str, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return true;
    }
    let haystack = text.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .all(|k| haystack.contains(&k.trim().to_lowercase()))
}
