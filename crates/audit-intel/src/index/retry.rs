//! Timeout and retry decorator for remote vector indexes.

use std::sync::Arc;

use async_trait::async_trait;

use audit_intel_core::index::{Candidate, SearchFilters, VectorIndex};
use audit_intel_core::models::IndexRecord;
use audit_intel_core::{Error, Result};

use crate::retry::{with_retry, RetryPolicy};

/// Wraps a [`VectorIndex`] so that every call runs under the policy's
/// timeout and [`Error::IndexUnavailable`] failures are retried with
/// backoff. Other errors pass through unchanged.
///
/// Upserts are idempotent by chunk id and deletes by document id, so
/// retrying a call whose first attempt actually landed is harmless.
pub struct RetryingIndex {
    inner: Arc<dyn VectorIndex>,
    policy: RetryPolicy,
}

impl RetryingIndex {
    pub fn new(inner: Arc<dyn VectorIndex>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl VectorIndex for RetryingIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        with_retry(&self.policy, "index upsert", Error::IndexUnavailable, || {
            self.inner.upsert(records)
        })
        .await
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        with_retry(&self.policy, "index delete", Error::IndexUnavailable, || {
            self.inner.delete_document(document_id)
        })
        .await
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        with_retry(&self.policy, "index search", Error::IndexUnavailable, || {
            self.inner.search(vector, top_k, filters)
        })
        .await
    }

    async fn document_records(&self, document_id: &str) -> Result<Vec<IndexRecord>> {
        with_retry(&self.policy, "index read", Error::IndexUnavailable, || {
            self.inner.document_records(document_id)
        })
        .await
    }

    async fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        with_retry(&self.policy, "index read", Error::IndexUnavailable, || {
            self.inner.document_chunk_ids(document_id)
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        with_retry(&self.policy, "index count", Error::IndexUnavailable, || {
            self.inner.count()
        })
        .await
    }

    /// Health probes are not retried; they report the current state.
    async fn ping(&self) -> Result<()> {
        match tokio::time::timeout(self.policy.timeout, self.inner.ping()).await {
            Ok(result) => result,
            Err(_) => Err(Error::IndexUnavailable(format!(
                "ping timed out after {:?}",
                self.policy.timeout
            ))),
        }
    }
}
