//! Retrieval engine: query text in, ranked chunks out.
//!
//! # Algorithm
//!
//! 1. Embed the query (query vectors are not cached).
//! 2. Ask the index for `top_k × candidate_multiplier` candidates, with
//!    the metadata filters applied inside the index.
//! 3. Drop candidates whose document is not visible, judged against the
//!    [`Visibility`](crate::lifecycle::Visibility) snapshots taken just
//!    before and just after the search, and candidates missing any
//!    required keyword.
//! 4. [`rank`]: threshold, total order, same-document deduplication,
//!    truncation to `top_k`.
//!
//! If filtering left fewer than `top_k` results although the index
//! returned a full page whose every score clears the threshold, the search
//! is repeated with a wider candidate window (a bounded number of times).
//!
//! Any embedding or index error fails the whole query; a query never
//! returns partial results.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use audit_intel_core::index::{Candidate, SearchFilters, VectorIndex};
use audit_intel_core::models::Category;
use audit_intel_core::search::{contains_keywords, rank, RankParams};
use audit_intel_core::{Error, Result};

use crate::config::RetrievalConfig;
use crate::lifecycle::DocumentManager;
use crate::pipeline::EmbeddingPipeline;

const MAX_WIDENINGS: usize = 3;

/// A retrieval request.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub text: String,
    /// Defaults to `retrieval.top_k`.
    pub top_k: Option<usize>,
    /// Defaults to `retrieval.similarity_threshold`.
    pub similarity_threshold: Option<f32>,
    pub filters: SearchFilters,
    /// Every keyword must occur in the chunk text (case-insensitive).
    pub keywords: Vec<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub document_id: String,
    pub filename: String,
    pub chunk_id: String,
    pub sequence: usize,
    /// Byte span of the chunk in the document's extracted text.
    pub start: usize,
    pub end: usize,
    pub location: Option<String>,
    pub text: String,
    pub score: f32,
    pub uploaded_at: i64,
    pub category: Category,
}

impl From<Candidate> for RetrievedChunk {
    fn from(c: Candidate) -> Self {
        let r = c.record;
        Self {
            document_id: r.document_id,
            filename: r.filename,
            chunk_id: r.chunk_id,
            sequence: r.sequence,
            start: r.start,
            end: r.end,
            location: r.location,
            text: r.text,
            score: c.score,
            uploaded_at: r.uploaded_at,
            category: r.category,
        }
    }
}

pub struct Retriever {
    manager: DocumentManager,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<EmbeddingPipeline>,
    settings: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        manager: DocumentManager,
        index: Arc<dyn VectorIndex>,
        pipeline: Arc<EmbeddingPipeline>,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            manager,
            index,
            pipeline,
            settings,
        }
    }

    pub async fn retrieve(&self, query: &Query) -> Result<Vec<RetrievedChunk>> {
        if query.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let top_k = query.top_k.unwrap_or(self.settings.top_k);
        if top_k == 0 || top_k > self.settings.max_top_k {
            return Err(Error::InvalidInput(format!(
                "top_k must be between 1 and {}, got {top_k}",
                self.settings.max_top_k
            )));
        }
        let params = RankParams {
            top_k,
            similarity_threshold: query
                .similarity_threshold
                .unwrap_or(self.settings.similarity_threshold),
            dedup_distance: self.settings.dedup_distance,
        };

        let vector = self.pipeline.embed_query(&query.text).await?;

        let mut k = top_k * self.settings.candidate_multiplier.max(1);
        let mut widenings = 0;
        loop {
            let before = self.manager.visibility().await;
            let mut candidates = self.index.search(&vector, k, &query.filters).await?;
            let after = self.manager.visibility().await;

            let returned = candidates.len();
            // Pages come back best first; past the threshold nothing wider helps.
            let reached_threshold = candidates
                .iter()
                .any(|c| c.score < params.similarity_threshold);
            let hidden = before.retain_across(&after, &mut candidates);
            candidates.retain(|c| contains_keywords(&c.record.text, &query.keywords));
            let ranked = rank(candidates, &params);

            let starved = ranked.len() < top_k && ranked.len() < returned;
            let full_page = returned >= k;
            if !starved || !full_page || reached_threshold || widenings == MAX_WIDENINGS {
                debug!(
                    candidates = returned,
                    hidden,
                    results = ranked.len(),
                    top_k,
                    "query ranked"
                );
                return Ok(ranked.into_iter().map(RetrievedChunk::from).collect());
            }
            widenings += 1;
            k *= 2;
            debug!(hidden, k, "widening candidate window");
        }
    }
}
