//! Qdrant-backed [`VectorIndex`] (feature `qdrant`).
//!
//! One point per index record; the point id is the chunk id (a UUID) and
//! the record fields travel as payload. The collection uses cosine
//! distance and is created on first upsert with the vector size of the
//! records. Writes use `wait = true` so a successful call is visible to
//! the next search.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::vectors_output::VectorsOptions;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointId, PointStruct, Range, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant, QdrantError};
use serde_json::json;
use tracing::debug;

use audit_intel_core::index::{Candidate, SearchFilters, VectorIndex};
use audit_intel_core::models::IndexRecord;
use audit_intel_core::search::compare_candidates;
use audit_intel_core::{Error, Result};

const SCROLL_PAGE: u32 = 1_000;

pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    ready: AtomicBool,
}

fn unavailable(err: QdrantError) -> Error {
    Error::IndexUnavailable(format!("qdrant: {err}"))
}

impl QdrantIndex {
    pub fn connect(url: &str, collection: &str) -> anyhow::Result<Self> {
        let client = Qdrant::from_url(url).build()?;
        Ok(Self {
            client,
            collection: collection.to_string(),
            ready: AtomicBool::new(false),
        })
    }

    async fn exists(&self) -> Result<bool> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(true);
        }
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(unavailable)?;
        if exists {
            self.ready.store(true, Ordering::Release);
        }
        Ok(exists)
    }

    async fn ensure_collection(&self, dims: usize) -> Result<()> {
        if self.exists().await? {
            return Ok(());
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(dims as u64, Distance::Cosine)),
            )
            .await
            .map_err(unavailable)?;
        debug!(collection = %self.collection, dims, "created qdrant collection");
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn document_filter(document_id: &str) -> Filter {
        Filter::must([Condition::matches("document_id", document_id.to_string())])
    }

    fn search_filter(filters: &SearchFilters) -> Option<Filter> {
        let mut conditions = Vec::new();
        if let Some(ids) = &filters.document_ids {
            conditions.push(Condition::matches("document_id", ids.clone()));
        }
        if let Some(groups) = &filters.access_groups {
            conditions.push(Condition::matches("access_group", groups.clone()));
        }
        if let Some(after) = filters.uploaded_after {
            conditions.push(Condition::range(
                "uploaded_at",
                Range {
                    gte: Some(after as f64),
                    ..Default::default()
                },
            ));
        }
        if let Some(category) = filters.category {
            conditions.push(Condition::matches("category", category.as_str().to_string()));
        }
        (!conditions.is_empty()).then(|| Filter::must(conditions))
    }
}

fn payload_of(record: &IndexRecord) -> Payload {
    let value = json!({
        "chunk_id": record.chunk_id,
        "document_id": record.document_id,
        "document_fingerprint": record.document_fingerprint,
        "sequence": record.sequence,
        "uploaded_at": record.uploaded_at,
        "filename": record.filename,
        "category": record.category.as_str(),
        "access_group": record.access_group,
        "start": record.start,
        "end": record.end,
        "text": record.text,
        "location": record.location,
    });
    Payload::try_from(value).unwrap_or_default()
}

fn string(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<String> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::StringValue(s) => Some(s.clone()),
        _ => None,
    }
}

fn integer(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<i64> {
    match payload.get(key)?.kind.as_ref()? {
        Kind::IntegerValue(n) => Some(*n),
        Kind::DoubleValue(d) => Some(*d as i64),
        _ => None,
    }
}

fn record_from_payload(
    payload: &HashMap<String, QdrantValue>,
    vector: Vec<f32>,
) -> Result<IndexRecord> {
    let missing = |key: &str| Error::IndexUnavailable(format!("qdrant point without '{key}'"));
    Ok(IndexRecord {
        chunk_id: string(payload, "chunk_id").ok_or_else(|| missing("chunk_id"))?,
        document_id: string(payload, "document_id").ok_or_else(|| missing("document_id"))?,
        document_fingerprint: string(payload, "document_fingerprint").unwrap_or_default(),
        sequence: integer(payload, "sequence").ok_or_else(|| missing("sequence"))? as usize,
        uploaded_at: integer(payload, "uploaded_at").unwrap_or_default(),
        filename: string(payload, "filename").unwrap_or_default(),
        category: string(payload, "category")
            .unwrap_or_default()
            .parse()
            .unwrap_or_default(),
        access_group: string(payload, "access_group").unwrap_or_default(),
        start: integer(payload, "start").unwrap_or_default() as usize,
        end: integer(payload, "end").unwrap_or_default() as usize,
        text: string(payload, "text").unwrap_or_default(),
        location: string(payload, "location"),
        vector,
    })
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        self.ensure_collection(first.vector.len()).await?;

        let points: Vec<PointStruct> = records
            .iter()
            .map(|r| PointStruct::new(r.chunk_id.clone(), r.vector.clone(), payload_of(r)))
            .collect();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(unavailable)?;
        debug!(collection = %self.collection, count = records.len(), "upserted points");
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        if !self.exists().await? {
            return Ok(0);
        }
        let counted = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection)
                    .filter(Self::document_filter(document_id))
                    .exact(true),
            )
            .await
            .map_err(unavailable)?;
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(Self::document_filter(document_id))
                    .wait(true),
            )
            .await
            .map_err(unavailable)?;
        Ok(counted.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        if top_k == 0 || !self.exists().await? {
            return Ok(Vec::new());
        }
        let mut request =
            SearchPointsBuilder::new(&self.collection, vector.to_vec(), top_k as u64)
                .with_payload(true);
        if let Some(filter) = Self::search_filter(filters) {
            request = request.filter(filter);
        }
        let response = self.client.search_points(request).await.map_err(unavailable)?;

        let mut candidates = Vec::with_capacity(response.result.len());
        for point in response.result {
            candidates.push(Candidate {
                record: record_from_payload(&point.payload, Vec::new())?,
                score: point.score,
            });
        }
        // Qdrant orders by score only; apply the full tie-break order.
        candidates.sort_by(compare_candidates);
        Ok(candidates)
    }

    async fn document_records(&self, document_id: &str) -> Result<Vec<IndexRecord>> {
        if !self.exists().await? {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let mut offset: Option<PointId> = None;
        loop {
            let mut request = ScrollPointsBuilder::new(&self.collection)
                .filter(Self::document_filter(document_id))
                .limit(SCROLL_PAGE)
                .with_payload(true)
                .with_vectors(true);
            if let Some(id) = offset.take() {
                request = request.offset(id);
            }
            let page = self.client.scroll(request).await.map_err(unavailable)?;
            for point in page.result {
                #[allow(deprecated)]
                let vector = match point.vectors.and_then(|v| v.vectors_options) {
                    Some(VectorsOptions::Vector(v)) => v.data,
                    _ => Vec::new(),
                };
                records.push(record_from_payload(&point.payload, vector)?);
            }
            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    async fn count(&self) -> Result<usize> {
        if !self.exists().await? {
            return Ok(0);
        }
        let counted = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await
            .map_err(unavailable)?;
        Ok(counted.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        self.client.health_check().await.map_err(unavailable)?;
        Ok(())
    }
}
