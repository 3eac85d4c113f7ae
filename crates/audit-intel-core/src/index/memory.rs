//! In-memory [`VectorIndex`] for tests and single-process deployments.
//!
//! Records live in a `HashMap` behind one `std::sync::RwLock`, so every
//! upsert or delete is applied under a single write guard and readers see
//! either all of it or none of it. Search is brute-force cosine similarity.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::Result;
use crate::models::IndexRecord;
use crate::search::compare_candidates;

use super::{Candidate, SearchFilters, VectorIndex};

#[derive(Default)]
struct Records {
    by_chunk: HashMap<String, IndexRecord>,
    by_document: HashMap<String, BTreeSet<String>>,
}

/// Vector index held entirely in memory.
#[derive(Default)]
pub struct InMemoryIndex {
    records: RwLock<Records>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    // Writers finish each map update before anything can panic, so a
    // poisoned lock still guards consistent records.
    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        let mut guard = self.write();
        for record in records {
            if let Some(old) = guard.by_chunk.insert(record.chunk_id.clone(), record.clone()) {
                if old.document_id != record.document_id {
                    if let Some(ids) = guard.by_document.get_mut(&old.document_id) {
                        ids.remove(&old.chunk_id);
                    }
                }
            }
            guard
                .by_document
                .entry(record.document_id.clone())
                .or_default()
                .insert(record.chunk_id.clone());
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut guard = self.write();
        let ids = guard.by_document.remove(document_id).unwrap_or_default();
        for id in &ids {
            guard.by_chunk.remove(id);
        }
        Ok(ids.len())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let guard = self.read();
        let mut candidates: Vec<Candidate> = guard
            .by_chunk
            .values()
            .filter(|r| filters.matches(r))
            .map(|r| Candidate {
                score: cosine_similarity(vector, &r.vector),
                record: r.clone(),
            })
            .collect();
        candidates.sort_by(compare_candidates);
        candidates.truncate(top_k);
        Ok(candidates)
    }

    async fn document_records(&self, document_id: &str) -> Result<Vec<IndexRecord>> {
        let guard = self.read();
        let mut records: Vec<IndexRecord> = guard
            .by_document
            .get(document_id)
            .into_iter()
            .flatten()
            .filter_map(|id| guard.by_chunk.get(id).cloned())
            .collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    async fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        let guard = self.read();
        Ok(guard
            .by_document
            .get(document_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read().by_chunk.len())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
