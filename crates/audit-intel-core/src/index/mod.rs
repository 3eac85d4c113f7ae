//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the narrow seam between the lifecycle
//! manager / retrieval engine and whatever stores the vectors: the
//! [`InMemoryIndex`](memory::InMemoryIndex) here, or the SQLite and Qdrant
//! adapters in the app crate.
//!
//! # Contract
//!
//! | Method | Guarantee |
//! |--------|-----------|
//! | [`upsert`](VectorIndex::upsert) | Idempotent by chunk id; all records of one call become visible together |
//! | [`delete_document`](VectorIndex::delete_document) | Removes every record of the document; readers never see a partial delete |
//! | [`search`](VectorIndex::search) | At most `top_k` candidates in [`compare_candidates`](crate::search::compare_candidates) order |
//!
//! Implementations must be `Send + Sync`; operations on different documents
//! must not interfere with each other.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Category, IndexRecord};

/// A record returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub record: IndexRecord,
    /// Cosine similarity between the query and the record's vector.
    pub score: f32,
}

/// Metadata filters applied inside the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Restrict results to these documents.
    pub document_ids: Option<Vec<String>>,
    /// Only documents uploaded at or after this time (Unix milliseconds).
    pub uploaded_after: Option<i64>,
    /// Only documents in one of these access groups.
    pub access_groups: Option<Vec<String>>,
    pub category: Option<Category>,
}

impl SearchFilters {
    /// Whether `record` passes every filter that is set.
    pub fn matches(&self, record: &IndexRecord) -> bool {
        if let Some(ids) = &self.document_ids {
            if !ids.iter().any(|id| *id == record.document_id) {
                return false;
            }
        }
        if let Some(after) = self.uploaded_after {
            if record.uploaded_at < after {
                return false;
            }
        }
        if let Some(groups) = &self.access_groups {
            if !groups.iter().any(|g| *g == record.access_group) {
                return false;
            }
        }
        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }
        true
    }
}

/// Storage for index records supporting nearest-neighbour search.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records, keyed by chunk id.
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()>;

    /// Remove every record of `document_id`. Returns how many were removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    /// Up to `top_k` records most similar to `vector` that pass `filters`.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>>;

    /// Every record stored for `document_id`, ordered by sequence.
    async fn document_records(&self, document_id: &str) -> Result<Vec<IndexRecord>>;

    /// Chunk ids currently stored for `document_id`, sorted.
    async fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .document_records(document_id)
            .await?
            .into_iter()
            .map(|r| r.chunk_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Total number of stored records.
    async fn count(&self) -> Result<usize>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;
}
