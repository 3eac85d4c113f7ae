//! Document lifecycle manager.
//!
//! Owns every [`Document`] and drives it through its states:
//!
//! ```text
//!            ┌──────────► failed ──(reingest)──┐
//!  upload ─► pending ◄───────────────────────────┘
//!            └──────────► ingested ──(new version)──► superseded
//!  pending | ingested | failed ──(delete)──► deleted
//! ```
//!
//! # Ingestion
//!
//! An upload stores the raw bytes, records the document as `pending` and
//! queues a job on the [`WorkerPool`]. The job extracts, cleans and chunks
//! the text, embeds the chunks through the [`EmbeddingPipeline`] (taking one
//! cache reference per chunk), and upserts the index records while the
//! document is still `pending`, so queries cannot see them yet.
//!
//! The job then performs the *switch*: in one catalog transaction, the new
//! version becomes `ingested` and the previously ingested version of the
//! same logical document (same owner and filename) becomes `superseded`;
//! both in-memory states then change under a single write of the document
//! map. Only after the switch are the old version's records deleted and its
//! cache references released.
//!
//! State changes are serialized by a transition mutex. Catalog writes run
//! under that mutex only, so the document map is never locked across I/O
//! and queries reading it never wait on another document's storage. A
//! query judges visibility with a [`Visibility`] snapshot taken on each
//! side of its index search, which keeps exactly one version of every
//! logical document visible to it.
//!
//! Jobs for the same logical document are serialized by a per-identity
//! async mutex; jobs for different documents run concurrently. A job that
//! finishes after a newer version of its document was already switched in
//! ends `superseded` without ever becoming visible.
//!
//! # Failure and cancellation
//!
//! Any error before the switch rolls the job back: index records written
//! so far are deleted, cache references are given back (the vectors stay
//! cached unpinned), and the document becomes `failed` with a
//! [`FailureKind`]. Cancellation is checked between steps and honoured up
//! to the switch. Index deletes that still fail after retries leave the
//! document id in an orphan list that [`DocumentManager::purge_orphans`]
//! retries later.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use audit_intel_core::cache::CacheStats;
use audit_intel_core::chunk::{chunk_document, ChunkParams};
use audit_intel_core::index::{Candidate, VectorIndex};
use audit_intel_core::models::{
    fingerprint, Category, Document, DocumentState, Failure, FailureKind, IndexRecord, LogicalKey,
    DEFAULT_ACCESS_GROUP,
};
use audit_intel_core::{Error, Result};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::extract::{clean_document, mime_from_filename, Extractor};
use crate::pipeline::EmbeddingPipeline;
use crate::uploads::UploadStore;
use crate::worker::{CancelToken, PoolStats, Slot, WorkerPool};

const FALLBACK_MIME: &str = "application/octet-stream";

/// Tunables of the manager, taken from configuration.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub chunking: ChunkParams,
    pub clean_text: bool,
    pub upsert_batch: usize,
    pub max_upload_bytes: u64,
    pub failed_backlog_limit: usize,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunking: config.chunking.params(),
            clean_text: config.ingest.clean_text,
            upsert_batch: config.index.upsert_batch.max(1),
            max_upload_bytes: config.uploads.max_upload_bytes(),
            failed_backlog_limit: config.ingest.failed_backlog_limit,
            workers: config.ingest.workers,
            queue_capacity: config.ingest.queue_capacity,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A document submitted for ingestion.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub owner: String,
    /// Detected from the filename extension when absent.
    pub mime: Option<String>,
    pub category: Category,
    /// Defaults to [`DEFAULT_ACCESS_GROUP`].
    pub access_group: Option<String>,
}

impl UploadRequest {
    pub fn new(filename: impl Into<String>, owner: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
            owner: owner.into(),
            mime: None,
            category: Category::default(),
            access_group: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub document_id: String,
    pub state: DocumentState,
}

/// Process health as reported to load balancers and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub index_reachable: bool,
    /// Documents failed for transient reasons, waiting to be re-ingested.
    pub failed_backlog: usize,
    pub orphaned_documents: usize,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub documents: usize,
    pub by_state: BTreeMap<String, usize>,
    /// Ingested documents per MIME type.
    pub by_mime: BTreeMap<String, usize>,
    /// Ingested documents per category.
    pub by_category: BTreeMap<String, usize>,
    /// Chunks of ingested documents.
    pub chunks: usize,
    pub index_records: usize,
    pub cache: CacheStats,
    pub jobs: PoolStats,
    pub embedding_calls: u64,
    pub orphaned_documents: usize,
}

/// What [`DocumentManager::recover`] found in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub documents: usize,
    /// Pending documents whose job died with the previous process.
    pub interrupted: usize,
    /// Cache entries restored from the index.
    pub warmed: usize,
}

/// The ingested documents at one instant, with their logical identities.
#[derive(Debug, Clone, Default)]
pub struct Visibility {
    ingested: HashMap<String, LogicalKey>,
}

impl Visibility {
    pub fn contains(&self, document_id: &str) -> bool {
        self.ingested.contains_key(document_id)
    }

    /// Filter index candidates fetched between this snapshot and `later`.
    ///
    /// A candidate survives when its document is visible in `later`, or
    /// was visible here and no candidate of another version of the same
    /// logical document is visible in `later`. A version superseded while
    /// the search ran therefore still answers for its document when the
    /// search only saw its records, and two versions never answer together.
    /// Returns how many candidates were dropped.
    pub fn retain_across(&self, later: &Visibility, candidates: &mut Vec<Candidate>) -> usize {
        let current: HashSet<&LogicalKey> = candidates
            .iter()
            .filter_map(|c| later.ingested.get(&c.record.document_id))
            .collect();
        let before = candidates.len();
        candidates.retain(|c| {
            let id = &c.record.document_id;
            later.contains(id)
                || self
                    .ingested
                    .get(id)
                    .is_some_and(|key| !current.contains(key))
        });
        before - candidates.len()
    }
}

/// Side effects of a job so far, undone on failure.
#[derive(Default)]
struct Progress {
    wrote_index: bool,
    pinned: Vec<String>,
}

struct Inner {
    docs: RwLock<HashMap<String, Document>>,
    /// Held across every state change and its catalog write.
    transitions: tokio::sync::Mutex<()>,
    catalog: Arc<dyn Catalog>,
    index: Arc<dyn VectorIndex>,
    pipeline: Arc<EmbeddingPipeline>,
    extractor: Arc<dyn Extractor>,
    uploads: Arc<UploadStore>,
    settings: ManagerSettings,
    identities: Mutex<HashMap<LogicalKey, Arc<tokio::sync::Mutex<()>>>>,
    orphans: Mutex<BTreeSet<String>>,
    last_upload: AtomicI64,
    pool: WorkerPool,
}

/// Handle to the lifecycle manager. Cheap to clone.
#[derive(Clone)]
pub struct DocumentManager {
    inner: Arc<Inner>,
}

impl DocumentManager {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        index: Arc<dyn VectorIndex>,
        pipeline: Arc<EmbeddingPipeline>,
        extractor: Arc<dyn Extractor>,
        uploads: Arc<UploadStore>,
        settings: ManagerSettings,
    ) -> Self {
        let pool = WorkerPool::new(settings.workers, settings.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                docs: RwLock::new(HashMap::new()),
                transitions: tokio::sync::Mutex::new(()),
                catalog,
                index,
                pipeline,
                extractor,
                uploads,
                settings,
                identities: Mutex::new(HashMap::new()),
                orphans: Mutex::new(BTreeSet::new()),
                last_upload: AtomicI64::new(0),
                pool,
            }),
        }
    }

    /// Accept a document and queue its ingestion.
    ///
    /// Returns as soon as the document is recorded as `pending`; use
    /// [`wait`](Self::wait) to observe the outcome. Fails with
    /// [`Error::Overloaded`] when the ingestion queue is full.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt> {
        let inner = &self.inner;
        let filename = request.filename.trim().to_string();
        let owner = request.owner.trim().to_string();
        if filename.is_empty() || owner.is_empty() {
            return Err(Error::InvalidInput(
                "filename and owner must not be empty".to_string(),
            ));
        }
        if request.bytes.is_empty() {
            return Err(Error::InvalidInput(format!("{filename} is empty")));
        }
        let size = request.bytes.len() as u64;
        if size > inner.settings.max_upload_bytes {
            return Err(Error::InvalidInput(format!(
                "{filename} is {size} bytes; the upload limit is {} bytes",
                inner.settings.max_upload_bytes
            )));
        }

        let slot = inner.pool.try_reserve()?;

        let mime = request
            .mime
            .filter(|m| !m.trim().is_empty())
            .or_else(|| mime_from_filename(&filename).map(str::to_string))
            .unwrap_or_else(|| FALLBACK_MIME.to_string());
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            filename,
            owner,
            mime,
            category: request.category,
            access_group: request
                .access_group
                .filter(|g| !g.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ACCESS_GROUP.to_string()),
            uploaded_at: inner.next_timestamp(),
            fingerprint: fingerprint(&request.bytes),
            size_bytes: size,
            state: DocumentState::Pending,
            chunk_count: 0,
            embedding_model: inner.pipeline.model_name().to_string(),
            failure: None,
        };

        inner.uploads.put(&doc.id, &request.bytes).await?;
        if let Err(err) = inner.catalog.save_document(&doc).await {
            if let Err(cleanup) = inner.uploads.remove(&doc.id).await {
                warn!(document.id = %doc.id, error = %cleanup, "failed to remove upload bytes");
            }
            return Err(err);
        }
        inner
            .docs
            .write()
            .await
            .insert(doc.id.clone(), doc.clone());

        info!(
            document.id = %doc.id,
            identity = %doc.key(),
            mime = %doc.mime,
            size_bytes = doc.size_bytes,
            "document accepted"
        );
        self.launch(slot, &doc.id);
        Ok(UploadReceipt {
            document_id: doc.id,
            state: DocumentState::Pending,
        })
    }

    fn launch(&self, slot: Slot, id: &str) {
        let inner = Arc::clone(&self.inner);
        let job_id = id.to_string();
        slot.launch(id, move |cancel| async move { inner.run_job(job_id, cancel).await });
    }

    /// Wait until no ingestion job runs for the document and return its
    /// state at that point.
    ///
    /// The state can differ from the job's own outcome: a version that
    /// ingested may already have been superseded by a newer one.
    pub async fn wait(&self, id: &str) -> Result<DocumentState> {
        self.state(id).await?;
        if let Some(outcome) = self.inner.pool.wait(id).await {
            debug!(document.id = %id, outcome = %outcome, "ingestion job observed");
        }
        self.state(id).await
    }

    /// Cancel a pending ingestion and wait for its rollback.
    ///
    /// Returns the resulting state. Cancelling a document that is not
    /// being ingested is a no-op that reports its current state.
    pub async fn cancel(&self, id: &str) -> Result<DocumentState> {
        let current = self.state(id).await?;
        if !self.inner.pool.cancel(id) {
            return Ok(current);
        }
        info!(document.id = %id, "cancellation requested");
        self.wait(id).await
    }

    /// Delete a document.
    ///
    /// The document becomes `deleted` (invisible to queries) first; its
    /// index records are deleted next, then its cache references released.
    /// A pending ingestion is cancelled before the document is deleted.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let inner = &self.inner;
        match self.state(id).await? {
            DocumentState::Deleted => return Ok(()),
            DocumentState::Pending => {
                inner.pool.cancel(id);
                inner.pool.wait(id).await;
            }
            _ => {}
        }

        let prior = {
            let _transition = inner.transitions.lock().await;
            let mut deleted = self.get(id).await?;
            let prior = deleted.state;
            if prior == DocumentState::Deleted {
                return Ok(());
            }
            deleted.state = DocumentState::Deleted;
            inner.catalog.save_document(&deleted).await?;
            inner.docs.write().await.insert(deleted.id.clone(), deleted);
            prior
        };
        info!(document.id = %id, prior = %prior, "document deleted");

        inner.delete_records(id).await;
        if prior == DocumentState::Ingested {
            inner.release_chunks(id).await;
        }
        if let Err(err) = inner.catalog.delete_chunks(id).await {
            warn!(document.id = %id, error = %err, "failed to delete chunk rows");
        }
        if let Err(err) = inner.uploads.remove(id).await {
            warn!(document.id = %id, error = %err, "failed to remove upload bytes");
        }
        Ok(())
    }

    /// Queue a failed document for another ingestion attempt, reusing the
    /// stored upload bytes.
    pub async fn reingest(&self, id: &str) -> Result<UploadReceipt> {
        let inner = &self.inner;
        let state = self.state(id).await?;
        if state != DocumentState::Failed {
            return Err(Error::InvalidInput(format!(
                "document {id} is {state}; only failed documents can be re-ingested"
            )));
        }

        // Leftovers of the failed attempt must go before new records land.
        inner.index.delete_document(id).await?;
        inner.orphans.lock().unwrap().remove(id);

        let slot = inner.pool.try_reserve()?;
        {
            let _transition = inner.transitions.lock().await;
            let mut pending = self.get(id).await?;
            if pending.state != DocumentState::Failed {
                return Err(Error::InvalidInput(format!(
                    "document {id} is {}; only failed documents can be re-ingested",
                    pending.state
                )));
            }
            pending.state = DocumentState::Pending;
            pending.failure = None;
            pending.embedding_model = inner.pipeline.model_name().to_string();
            inner.catalog.save_document(&pending).await?;
            inner.docs.write().await.insert(pending.id.clone(), pending);
        }
        info!(document.id = %id, "re-ingestion queued");
        self.launch(slot, id);
        Ok(UploadReceipt {
            document_id: id.to_string(),
            state: DocumentState::Pending,
        })
    }

    /// Retry index deletes that failed earlier. Returns how many documents
    /// were cleaned up.
    pub async fn purge_orphans(&self) -> usize {
        let inner = &self.inner;
        let orphans: Vec<String> = inner.orphans.lock().unwrap().iter().cloned().collect();
        let mut purged = 0;
        for id in orphans {
            let state = inner.docs.read().await.get(&id).map(|d| d.state);
            if matches!(state, Some(DocumentState::Pending | DocumentState::Ingested)) {
                // Live again after a re-ingest; its records are current.
                inner.orphans.lock().unwrap().remove(&id);
                continue;
            }
            match inner.index.delete_document(&id).await {
                Ok(removed) => {
                    inner.orphans.lock().unwrap().remove(&id);
                    debug!(document.id = %id, removed, "orphaned records purged");
                    purged += 1;
                }
                Err(err) => warn!(document.id = %id, error = %err, "orphan purge failed"),
            }
        }
        purged
    }

    /// Load the catalog after a restart.
    ///
    /// Documents left `pending` by a dead process are rolled back and marked
    /// `failed` (transient). Cleanup interrupted after a delete or supersede
    /// is finished. Cache references of ingested documents are restored
    /// from the index when their vectors came from the current model.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let inner = &self.inner;
        let documents = inner.catalog.load_documents().await?;
        let mut report = RecoveryReport {
            documents: documents.len(),
            ..Default::default()
        };

        let mut loaded = HashMap::with_capacity(documents.len());
        for mut doc in documents {
            match doc.state {
                DocumentState::Pending => {
                    inner.delete_records(&doc.id).await;
                    inner.catalog.delete_chunks(&doc.id).await?;
                    doc.state = DocumentState::Failed;
                    doc.chunk_count = 0;
                    doc.failure = Some(Failure {
                        kind: FailureKind::Transient,
                        message: "ingestion interrupted before completion".to_string(),
                    });
                    inner.catalog.save_document(&doc).await?;
                    warn!(document.id = %doc.id, "interrupted ingestion rolled back");
                    report.interrupted += 1;
                }
                DocumentState::Ingested => {
                    report.warmed += inner.warm_cache(&doc).await;
                }
                DocumentState::Superseded | DocumentState::Deleted => {
                    if !inner.catalog.chunk_refs(&doc.id).await?.is_empty() {
                        inner.delete_records(&doc.id).await;
                        inner.catalog.delete_chunks(&doc.id).await?;
                        if let Err(err) = inner.uploads.remove(&doc.id).await {
                            warn!(document.id = %doc.id, error = %err, "failed to remove upload bytes");
                        }
                    }
                }
                DocumentState::Failed => {}
            }
            inner.bump_timestamp(doc.uploaded_at);
            loaded.insert(doc.id.clone(), doc);
        }
        *inner.docs.write().await = loaded;

        info!(
            documents = report.documents,
            interrupted = report.interrupted,
            warmed = report.warmed,
            "catalog recovered"
        );
        Ok(report)
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        self.inner
            .docs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("document {id}")))
    }

    pub async fn state(&self, id: &str) -> Result<DocumentState> {
        self.get(id).await.map(|d| d.state)
    }

    /// Documents, newest upload first, optionally restricted to one state.
    pub async fn list(&self, state: Option<DocumentState>) -> Vec<Document> {
        let docs = self.inner.docs.read().await;
        let mut out: Vec<Document> = docs
            .values()
            .filter(|d| state.map_or(true, |s| d.state == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.uploaded_at
                .cmp(&a.uploaded_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// The documents queries may see right now.
    pub async fn visibility(&self) -> Visibility {
        let docs = self.inner.docs.read().await;
        Visibility {
            ingested: docs
                .values()
                .filter(|d| d.state.is_searchable())
                .map(|d| (d.id.clone(), d.key()))
                .collect(),
        }
    }

    pub async fn health(&self) -> Health {
        let inner = &self.inner;
        let index_reachable = match inner.index.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "vector index unreachable");
                false
            }
        };
        let failed_backlog = inner
            .docs
            .read()
            .await
            .values()
            .filter(|d| {
                d.state == DocumentState::Failed
                    && d.failure.as_ref().map(|f| f.kind) == Some(FailureKind::Transient)
            })
            .count();
        let orphaned_documents = inner.orphans.lock().unwrap().len();
        Health {
            index_reachable,
            failed_backlog,
            orphaned_documents,
            healthy: index_reachable && failed_backlog <= inner.settings.failed_backlog_limit,
        }
    }

    pub async fn stats(&self) -> Result<Stats> {
        let inner = &self.inner;
        let index_records = inner.index.count().await?;
        let docs = inner.docs.read().await;
        let mut by_state = BTreeMap::new();
        let mut by_mime = BTreeMap::new();
        let mut by_category = BTreeMap::new();
        let mut chunks = 0;
        for doc in docs.values() {
            *by_state.entry(doc.state.to_string()).or_insert(0) += 1;
            if doc.state == DocumentState::Ingested {
                *by_mime.entry(doc.mime.clone()).or_insert(0) += 1;
                *by_category.entry(doc.category.to_string()).or_insert(0) += 1;
                chunks += doc.chunk_count;
            }
        }
        Ok(Stats {
            documents: docs.len(),
            by_state,
            by_mime,
            by_category,
            chunks,
            index_records,
            cache: inner.pipeline.cache().stats(),
            jobs: inner.pool.stats(),
            embedding_calls: inner.pipeline.provider_calls(),
            orphaned_documents: inner.orphans.lock().unwrap().len(),
        })
    }

    /// Ids with index deletes still outstanding.
    pub fn orphans(&self) -> Vec<String> {
        self.inner.orphans.lock().unwrap().iter().cloned().collect()
    }
}

impl Inner {
    /// Upload timestamps are strictly increasing within the process, so
    /// the later of two uploads always wins the switch.
    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_upload
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn bump_timestamp(&self, seen: i64) {
        self.last_upload.fetch_max(seen, Ordering::SeqCst);
    }

    fn identity_lock(&self, key: &LogicalKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut identities = self.identities.lock().unwrap();
        // Drop locks nobody holds or waits on.
        identities.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(identities.entry(key.clone()).or_default())
    }

    async fn run_job(&self, id: String, cancel: CancelToken) -> DocumentState {
        let Some(doc) = self.docs.read().await.get(&id).cloned() else {
            return DocumentState::Failed;
        };
        let lock = self.identity_lock(&doc.key());
        let _guard = tokio::select! {
            guard = lock.lock_owned() => guard,
            _ = cancel.cancelled() => {
                let err = Error::Cancelled("ingestion cancelled".to_string());
                return self.fail(&doc, err, Progress::default()).await;
            }
        };

        let mut progress = Progress::default();
        match self.ingest(&doc, &cancel, &mut progress).await {
            Ok(state) => state,
            Err(Error::VersionConflict(reason)) => self.discard_stale(&doc, &reason, progress).await,
            Err(err) => self.fail(&doc, err, progress).await,
        }
    }

    async fn ingest(
        &self,
        doc: &Document,
        cancel: &CancelToken,
        progress: &mut Progress,
    ) -> Result<DocumentState> {
        cancel.check()?;
        let bytes = self.uploads.get(&doc.id).await?;

        let extractor = Arc::clone(&self.extractor);
        let mime = doc.mime.clone();
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&bytes, &mime))
            .await
            .map_err(|e| Error::Extraction(format!("extractor crashed: {e}")))??;
        let extracted = if self.settings.clean_text {
            clean_document(&extracted)
        } else {
            extracted
        };

        let chunks = chunk_document(
            &doc.id,
            &extracted.text,
            &extracted.structure,
            &self.settings.chunking,
        );
        if chunks.is_empty() {
            return Err(Error::Extraction("document contains no text".to_string()));
        }
        debug!(document.id = %doc.id, chunk_count = chunks.len(), "document chunked");

        cancel.check()?;
        let vectors = self.pipeline.embed_pinned(&chunks, cancel).await?;
        progress.pinned = chunks.iter().map(|c| c.fingerprint.clone()).collect();

        let records: Vec<IndexRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexRecord::new(doc, chunk, vector))
            .collect();
        for batch in records.chunks(self.settings.upsert_batch) {
            cancel.check()?;
            progress.wrote_index = true;
            self.index.upsert(batch).await?;
        }
        self.catalog.save_chunks(&doc.id, &chunks).await?;

        let superseded = self.switch(&doc.id, chunks.len(), cancel).await?;
        info!(
            document.id = %doc.id,
            chunk_count = chunks.len(),
            superseded = superseded.as_ref().map(|d| d.id.as_str()).unwrap_or("-"),
            "document ingested"
        );
        if let Some(old) = superseded {
            self.retire(&old).await;
        }
        Ok(DocumentState::Ingested)
    }

    /// Make `id` the visible version of its logical document.
    ///
    /// Returns the version it replaced.
    async fn switch(
        &self,
        id: &str,
        chunk_count: usize,
        cancel: &CancelToken,
    ) -> Result<Option<Document>> {
        let _transition = self.transitions.lock().await;
        cancel.check()?;
        let (new, old) = {
            let docs = self.docs.read().await;
            let current = docs
                .get(id)
                .ok_or_else(|| Error::Cancelled(format!("document {id} disappeared")))?;
            if current.state != DocumentState::Pending {
                return Err(Error::Cancelled(format!(
                    "document {id} became {} during ingestion",
                    current.state
                )));
            }

            let key = current.key();
            let live = docs
                .values()
                .find(|d| d.id != id && d.state == DocumentState::Ingested && d.key() == key);
            if let Some(live) = live {
                if live.uploaded_at > current.uploaded_at {
                    return Err(Error::VersionConflict(format!(
                        "newer version {} of {key} is already ingested",
                        live.id
                    )));
                }
            }
            let old = live.cloned().map(|mut d| {
                d.state = DocumentState::Superseded;
                d
            });
            let mut new = current.clone();
            new.state = DocumentState::Ingested;
            new.chunk_count = chunk_count;
            new.failure = None;
            (new, old)
        };

        self.catalog.commit_switch(&new, old.as_ref()).await?;

        let mut docs = self.docs.write().await;
        if let Some(old) = &old {
            docs.insert(old.id.clone(), old.clone());
        }
        docs.insert(new.id.clone(), new);
        Ok(old)
    }

    /// Clean up a version that stopped being visible.
    async fn retire(&self, old: &Document) {
        self.delete_records(&old.id).await;
        self.release_chunks(&old.id).await;
        if let Err(err) = self.catalog.delete_chunks(&old.id).await {
            warn!(document.id = %old.id, error = %err, "failed to delete chunk rows");
        }
        if let Err(err) = self.uploads.remove(&old.id).await {
            warn!(document.id = %old.id, error = %err, "failed to remove upload bytes");
        }
        debug!(document.id = %old.id, "superseded version retired");
    }

    /// Delete the index records of `id`, remembering it as an orphan when
    /// the index stays unavailable.
    async fn delete_records(&self, id: &str) {
        if let Err(err) = self.index.delete_document(id).await {
            warn!(document.id = %id, error = %err, "index delete failed; recorded as orphan");
            self.orphans.lock().unwrap().insert(id.to_string());
        }
    }

    /// Give back the cache references held by the chunks of `id`.
    async fn release_chunks(&self, id: &str) {
        match self.catalog.chunk_refs(id).await {
            Ok(refs) => {
                let evicted = self
                    .pipeline
                    .cache()
                    .release_all(refs.iter().map(|r| r.fingerprint.as_str()));
                debug!(document.id = %id, released = refs.len(), evicted, "cache references released");
            }
            Err(err) => warn!(document.id = %id, error = %err, "failed to read chunk rows"),
        }
    }

    async fn rollback(&self, id: &str, progress: Progress) {
        if progress.wrote_index {
            self.delete_records(id).await;
        }
        for fp in &progress.pinned {
            self.pipeline.cache().unpin(fp);
        }
        if let Err(err) = self.catalog.delete_chunks(id).await {
            warn!(document.id = %id, error = %err, "failed to delete chunk rows");
        }
    }

    async fn fail(&self, doc: &Document, err: Error, progress: Progress) -> DocumentState {
        self.rollback(&doc.id, progress).await;
        let failure = Failure::from_error(&err);

        let _transition = self.transitions.lock().await;
        let Some(mut failed) = self.docs.read().await.get(&doc.id).cloned() else {
            return DocumentState::Failed;
        };
        if failed.state != DocumentState::Pending {
            // Deleted while the job ran; the delete owns the outcome.
            return failed.state;
        }
        failed.state = DocumentState::Failed;
        failed.chunk_count = 0;
        failed.failure = Some(failure.clone());
        if let Err(save_err) = self.catalog.save_document(&failed).await {
            error!(document.id = %doc.id, error = %save_err, "failed to record failure");
        }
        self.docs.write().await.insert(failed.id.clone(), failed);
        warn!(
            document.id = %doc.id,
            kind = failure.kind.as_str(),
            error = %err,
            "ingestion failed"
        );
        DocumentState::Failed
    }

    /// A newer version won the switch while this job ran.
    async fn discard_stale(&self, doc: &Document, reason: &str, progress: Progress) -> DocumentState {
        self.rollback(&doc.id, progress).await;
        {
            let _transition = self.transitions.lock().await;
            let Some(mut stale) = self.docs.read().await.get(&doc.id).cloned() else {
                return DocumentState::Superseded;
            };
            if stale.state != DocumentState::Pending {
                return stale.state;
            }
            stale.state = DocumentState::Superseded;
            if let Err(err) = self.catalog.save_document(&stale).await {
                error!(document.id = %doc.id, error = %err, "failed to record superseded state");
            }
            self.docs.write().await.insert(stale.id.clone(), stale);
        }
        if let Err(err) = self.uploads.remove(&doc.id).await {
            warn!(document.id = %doc.id, error = %err, "failed to remove upload bytes");
        }
        info!(document.id = %doc.id, reason, "stale version discarded");
        DocumentState::Superseded
    }

    /// Re-pin the chunks of an ingested document, restoring vectors from
    /// the index. Returns the number of references restored.
    async fn warm_cache(&self, doc: &Document) -> usize {
        let model = self.pipeline.model_name();
        if doc.embedding_model != model {
            debug!(document.id = %doc.id, model = %doc.embedding_model, "not warming: model changed");
            return 0;
        }
        let refs = match self.catalog.chunk_refs(&doc.id).await {
            Ok(refs) => refs,
            Err(err) => {
                warn!(document.id = %doc.id, error = %err, "failed to read chunk rows");
                return 0;
            }
        };
        let records = match self.index.document_records(&doc.id).await {
            Ok(records) => records,
            Err(err) => {
                warn!(document.id = %doc.id, error = %err, "failed to read index records");
                return 0;
            }
        };
        let vectors: HashMap<String, Vec<f32>> = records
            .into_iter()
            .filter(|r| !r.vector.is_empty())
            .map(|r| (r.chunk_id, r.vector))
            .collect();

        let cache = self.pipeline.cache();
        let mut warmed = 0;
        for chunk in refs {
            if let Some(vector) = vectors.get(&chunk.chunk_id) {
                cache.insert(&chunk.fingerprint, model, vector.clone(), true);
                warmed += 1;
            }
        }
        warmed
    }
}
