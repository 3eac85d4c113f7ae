//! Wiring: build every component from a [`Config`] and recover state.
//!
//! [`Engine::open`] is what the CLI uses. [`EngineBuilder`] lets callers
//! (tests, embedding hosts) swap any component for their own, falling back
//! to the configured one for the rest.
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use audit_intel::config::Config;
//! use audit_intel::engine::Engine;
//! use audit_intel::lifecycle::UploadRequest;
//! use audit_intel::retrieve::Query;
//!
//! let engine = Engine::open(&Config::default()).await?;
//! let receipt = engine
//!     .upload(UploadRequest::new("fy24.txt", "alice", b"Revenue findings".to_vec()))
//!     .await?;
//! engine.wait(&receipt.document_id).await?;
//! let hits = engine.retrieve(&Query::new("revenue")).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use audit_intel_core::cache::EmbeddingCache;
use audit_intel_core::embedding::EmbeddingProvider;
use audit_intel_core::index::VectorIndex;
use audit_intel_core::models::{Document, DocumentState};

use crate::catalog::{Catalog, MemoryCatalog, SqliteCatalog};
use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::extract::{DefaultExtractor, Extractor};
use crate::index::open_index;
use crate::lifecycle::{
    DocumentManager, Health, ManagerSettings, RecoveryReport, Stats, UploadReceipt, UploadRequest,
};
use crate::pipeline::EmbeddingPipeline;
use crate::retrieve::{Query, RetrievedChunk, Retriever};
use crate::uploads::UploadStore;

/// A running ingestion and retrieval core.
pub struct Engine {
    manager: DocumentManager,
    retriever: Retriever,
    pipeline: Arc<EmbeddingPipeline>,
    recovery: RecoveryReport,
}

impl Engine {
    /// Open every component named by `config` and recover the catalog.
    pub async fn open(config: &Config) -> Result<Self> {
        EngineBuilder::new(config.clone()).build().await
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn manager(&self) -> &DocumentManager {
        &self.manager
    }

    pub fn pipeline(&self) -> &Arc<EmbeddingPipeline> {
        &self.pipeline
    }

    /// What startup recovery found.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub async fn upload(&self, request: UploadRequest) -> audit_intel_core::Result<UploadReceipt> {
        self.manager.upload(request).await
    }

    pub async fn wait(&self, id: &str) -> audit_intel_core::Result<DocumentState> {
        self.manager.wait(id).await
    }

    pub async fn cancel(&self, id: &str) -> audit_intel_core::Result<DocumentState> {
        self.manager.cancel(id).await
    }

    pub async fn delete(&self, id: &str) -> audit_intel_core::Result<()> {
        self.manager.delete(id).await
    }

    pub async fn reingest(&self, id: &str) -> audit_intel_core::Result<UploadReceipt> {
        self.manager.reingest(id).await
    }

    pub async fn get(&self, id: &str) -> audit_intel_core::Result<Document> {
        self.manager.get(id).await
    }

    pub async fn list(&self, state: Option<DocumentState>) -> Vec<Document> {
        self.manager.list(state).await
    }

    pub async fn retrieve(&self, query: &Query) -> audit_intel_core::Result<Vec<RetrievedChunk>> {
        self.retriever.retrieve(query).await
    }

    pub async fn purge_orphans(&self) -> usize {
        self.manager.purge_orphans().await
    }

    pub async fn health(&self) -> Health {
        self.manager.health().await
    }

    pub async fn stats(&self) -> audit_intel_core::Result<Stats> {
        self.manager.stats().await
    }
}

/// Assembles an [`Engine`], using configured components for anything not
/// set explicitly.
pub struct EngineBuilder {
    config: Config,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    index: Option<Arc<dyn VectorIndex>>,
    catalog: Option<Arc<dyn Catalog>>,
    extractor: Option<Arc<dyn Extractor>>,
    uploads: Option<Arc<UploadStore>>,
    cache: Option<Arc<EmbeddingCache>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            provider: None,
            index: None,
            catalog: None,
            extractor: None,
            uploads: None,
            cache: None,
        }
    }

    pub fn provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn uploads(mut self, uploads: Arc<UploadStore>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    pub fn cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = self.config;

        let catalog: Arc<dyn Catalog> = match (self.catalog, &config.db.path) {
            (Some(catalog), _) => catalog,
            (None, Some(path)) => {
                let pool = db::connect(path)
                    .await
                    .with_context(|| format!("Failed to open catalog at {}", path.display()))?;
                Arc::new(SqliteCatalog::new(pool))
            }
            (None, None) => Arc::new(MemoryCatalog::new()),
        };
        let uploads = match (self.uploads, &config.uploads.dir) {
            (Some(uploads), _) => uploads,
            (None, Some(dir)) => Arc::new(UploadStore::disk(dir)),
            (None, None) => Arc::new(UploadStore::memory()),
        };
        let index = match self.index {
            Some(index) => index,
            None => open_index(&config.index).await?,
        };
        let provider = match self.provider {
            Some(provider) => provider,
            None => create_provider(&config.embedding)?,
        };
        let cache = self.cache.unwrap_or_default();
        let extractor = self
            .extractor
            .unwrap_or_else(|| Arc::new(DefaultExtractor));

        let pipeline = Arc::new(EmbeddingPipeline::new(provider, cache, &config.embedding));
        let manager = DocumentManager::new(
            catalog,
            Arc::clone(&index),
            Arc::clone(&pipeline),
            extractor,
            uploads,
            ManagerSettings::from_config(&config),
        );
        let recovery = manager
            .recover()
            .await
            .context("Failed to recover document catalog")?;
        let retriever = Retriever::new(
            manager.clone(),
            index,
            Arc::clone(&pipeline),
            config.retrieval.clone(),
        );

        info!(
            index = %config.index.backend,
            provider = %config.embedding.provider,
            model = %pipeline.model_name(),
            documents = recovery.documents,
            "engine ready"
        );
        Ok(Engine {
            manager,
            retriever,
            pipeline,
            recovery,
        })
    }
}
