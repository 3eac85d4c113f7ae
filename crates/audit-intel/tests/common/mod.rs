#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use audit_intel::catalog::{Catalog, ChunkRef, MemoryCatalog};
use audit_intel::config::{parse_config, Config};
use audit_intel::embedding::HashEmbedder;
use audit_intel::engine::Engine;
use audit_intel::lifecycle::UploadRequest;
use audit_intel_core::embedding::EmbeddingProvider;
use audit_intel_core::index::memory::InMemoryIndex;
use audit_intel_core::index::{Candidate, SearchFilters, VectorIndex};
use audit_intel_core::models::{Chunk, Document, IndexRecord};
use audit_intel_core::{Error, Result};

pub const MODEL: &str = "hash-test";
pub const DIMS: usize = 256;

/// Texts containing this word block in the embedder until the gate opens.
pub const GATED: &str = "GATEDWORD";
/// Texts containing this word are refused by the embedder.
pub const POISON: &str = "POISONWORD";

pub fn config(extra: &str) -> Config {
    let toml = format!(
        r#"
[embedding]
provider = "hash"
model = "{MODEL}"
dims = {DIMS}
batch_size = 4
concurrency = 2
max_retries = 1
timeout_secs = 5
retry_base_ms = 1

[retrieval]
top_k = 5
dedup_distance = 0

{extra}
"#
    );
    parse_config(&toml).unwrap()
}

/// Hash embedder that counts calls and can be gated, rejected or taken
/// offline from the test.
pub struct TestEmbedder {
    inner: HashEmbedder,
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
    pub offline: AtomicBool,
    gate: Semaphore,
}

impl TestEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbedder::new(MODEL, DIMS),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(10_000);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for TestEmbedder {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains(GATED)) {
            let _permit = self.gate.acquire().await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::EmbeddingUnavailable("connection refused".into()));
        }
        if texts.iter().any(|t| t.contains(POISON)) {
            return Err(Error::EmbeddingRejected("input refused".into()));
        }
        self.inner.embed_batch(texts).await
    }
}

/// Lets a test act while a search holds its results.
#[derive(Default)]
pub struct SearchGate {
    /// Notified once the search has collected its candidates.
    pub paused: Notify,
    /// Notify to let the search return.
    pub resume: Notify,
}

/// In-memory index whose writes can be made to fail and whose next search
/// can be paused.
#[derive(Default)]
pub struct FlakyIndex {
    inner: InMemoryIndex,
    pub fail_deletes: AtomicBool,
    pub fail_upserts: AtomicBool,
    gate: Mutex<Option<Arc<SearchGate>>>,
}

impl FlakyIndex {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pause_next_search(&self) -> Arc<SearchGate> {
        let gate = Arc::new(SearchGate::default());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Error::IndexUnavailable("upsert timed out".into()));
        }
        self.inner.upsert(records).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::IndexUnavailable("delete timed out".into()));
        }
        self.inner.delete_document(document_id).await
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        let hits = self.inner.search(vector, top_k, filters).await?;
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.paused.notify_one();
            gate.resume.notified().await;
        }
        Ok(hits)
    }

    async fn document_records(&self, document_id: &str) -> Result<Vec<IndexRecord>> {
        self.inner.document_records(document_id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::IndexUnavailable("unreachable".into()));
        }
        Ok(())
    }
}

/// Memory catalog whose switch commits can be held open.
#[derive(Default)]
pub struct HeldCatalog {
    inner: MemoryCatalog,
    hold: AtomicBool,
    /// Notified when a held switch commit has started.
    pub switch_entered: Notify,
    release: Notify,
}

impl HeldCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hold_switches(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_switches(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }
}

#[async_trait]
impl Catalog for HeldCatalog {
    async fn save_document(&self, doc: &Document) -> Result<()> {
        self.inner.save_document(doc).await
    }

    async fn load_documents(&self) -> Result<Vec<Document>> {
        self.inner.load_documents().await
    }

    async fn commit_switch(&self, new: &Document, old: Option<&Document>) -> Result<()> {
        if self.hold.load(Ordering::SeqCst) {
            self.switch_entered.notify_one();
            self.release.notified().await;
        }
        self.inner.commit_switch(new, old).await
    }

    async fn save_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.inner.save_chunks(document_id, chunks).await
    }

    async fn chunk_refs(&self, document_id: &str) -> Result<Vec<ChunkRef>> {
        self.inner.chunk_refs(document_id).await
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        self.inner.delete_chunks(document_id).await
    }
}

pub struct Harness {
    pub engine: Engine,
    pub embedder: Arc<TestEmbedder>,
    pub index: Arc<FlakyIndex>,
}

pub async fn harness(config: Config) -> Harness {
    harness_with_catalog(config, Arc::new(MemoryCatalog::new())).await
}

pub async fn harness_with_catalog(config: Config, catalog: Arc<dyn Catalog>) -> Harness {
    let embedder = TestEmbedder::new();
    let index = FlakyIndex::new();
    let engine = Engine::builder(config)
        .provider(embedder.clone())
        .index(index.clone())
        .catalog(catalog)
        .build()
        .await
        .unwrap();
    Harness {
        engine,
        embedder,
        index,
    }
}

pub fn text_upload(filename: &str, owner: &str, text: &str) -> UploadRequest {
    UploadRequest::new(filename, owner, text.as_bytes().to_vec())
}

/// A few paragraphs of audit prose, varied by `topic`.
pub fn report(topic: &str) -> String {
    let mut text = String::new();
    for i in 0..6 {
        text.push_str(&format!(
            "Finding {i} on {topic}. The audit team reviewed {topic} controls for \
             quarter {i} and noted exceptions in approval workflows, segregation of \
             duties and reconciliation timeliness.\n\n"
        ));
    }
    text
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
