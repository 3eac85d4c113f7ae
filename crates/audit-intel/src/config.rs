//! Configuration parsing and validation.
//!
//! Audit Intel is configured via a TOML file (default: `config/audit-intel.toml`).
//! Every section is optional; omitted sections take the defaults below,
//! which describe a purely in-memory deployment.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/audit-intel.sqlite"
//!
//! [uploads]
//! dir = "./data/uploads"
//! max_upload_mb = 100
//!
//! [chunking]
//! max_tokens = 500
//! overlap_tokens = 50
//!
//! [embedding]
//! provider = "openai"          # disabled | openai | ollama | local | hash
//! model = "text-embedding-3-small"
//! dims = 1536
//! batch_size = 64
//! concurrency = 4
//! max_retries = 5
//! timeout_secs = 30
//!
//! [index]
//! backend = "sqlite"           # memory | sqlite | qdrant
//! path = "./data/index.sqlite"
//!
//! [retrieval]
//! top_k = 20
//! candidate_multiplier = 3
//! similarity_threshold = 0.25
//! dedup_distance = 1
//!
//! [ingest]
//! workers = 4
//! queue_capacity = 64
//! failed_backlog_limit = 10
//!
//! [log]
//! level = "info"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use audit_intel_core::chunk::ChunkParams;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub db: DbConfig,
    pub uploads: UploadsConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub ingest: IngestConfig,
    pub log: LogConfig,
}

/// Document catalog location. Without a path the catalog lives in memory.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DbConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Raw upload storage, kept so failed documents can be re-ingested.
#[derive(Debug, Deserialize, Clone)]
pub struct UploadsConfig {
    /// Directory for upload bytes. Without it uploads are held in memory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

impl UploadsConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

fn default_max_upload_mb() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_overlap() -> usize {
    50
}

/// Embedding provider and pipeline settings.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"openai"`, `"ollama"`, `"local"`, or `"hash"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for `ollama` (default `http://localhost:11434`) or an
    /// OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Provider batches in flight at once for one call.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embed_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retry_base_ms: default_embed_retry_base_ms(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_embed_retry_base_ms() -> u64 {
    1000
}

/// Vector index backend settings.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `"memory"`, `"sqlite"`, or `"qdrant"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite file for the `sqlite` backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Qdrant gRPC URL, e.g. `http://localhost:6334`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Records per upsert call during ingestion.
    #[serde(default = "default_upsert_batch")]
    pub upsert_batch: usize,
    #[serde(default = "default_index_retries")]
    pub max_retries: u32,
    #[serde(default = "default_index_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_index_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            url: None,
            collection: default_collection(),
            upsert_batch: default_upsert_batch(),
            max_retries: default_index_retries(),
            timeout_secs: default_index_timeout_secs(),
            retry_base_ms: default_index_retry_base_ms(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}
fn default_collection() -> String {
    "audit_reports".to_string()
}
fn default_upsert_batch() -> usize {
    128
}
fn default_index_retries() -> u32 {
    3
}
fn default_index_timeout_secs() -> u64 {
    10
}
fn default_index_retry_base_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    /// The index is asked for `top_k × candidate_multiplier` candidates so
    /// post-filtering can still fill `top_k`.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default)]
    pub similarity_threshold: f32,
    #[serde(default = "default_dedup_distance")]
    pub dedup_distance: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            candidate_multiplier: default_candidate_multiplier(),
            similarity_threshold: 0.0,
            dedup_distance: default_dedup_distance(),
        }
    }
}

fn default_top_k() -> usize {
    20
}
fn default_max_top_k() -> usize {
    100
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_dedup_distance() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Ingestion jobs running at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs admitted (running + queued) before uploads are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Transient failures tolerated before health reports unhealthy.
    #[serde(default = "default_failed_backlog_limit")]
    pub failed_backlog_limit: usize,
    /// Strip page numbers, repeated headers and normalize whitespace.
    #[serde(default = "default_clean_text")]
    pub clean_text: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            failed_backlog_limit: default_failed_backlog_limit(),
            clean_text: default_clean_text(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    64
}
fn default_failed_backlog_limit() -> usize {
    10
}
fn default_clean_text() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load, parse, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Reject invalid combinations before anything is opened.
pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Validate retrieval
    let r = &config.retrieval;
    if r.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if r.top_k > r.max_top_k {
        bail!("retrieval.top_k must be <= retrieval.max_top_k");
    }
    if r.candidate_multiplier < 1 {
        bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if !(-1.0..=1.0).contains(&r.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }

    // Validate embedding
    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" | "hash" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hash.",
            other
        ),
    }
    if e.is_enabled() {
        if e.dims.is_none() || e.dims == Some(0) {
            bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
        }
        if e.model.is_none() {
            bail!("embedding.model must be specified when provider is '{}'", e.provider);
        }
    }
    if e.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if e.concurrency == 0 {
        bail!("embedding.concurrency must be > 0");
    }

    // Validate index
    let i = &config.index;
    match i.backend.as_str() {
        "memory" => {}
        "sqlite" => {
            if i.path.is_none() {
                bail!("index.path must be set when index.backend is 'sqlite'");
            }
        }
        "qdrant" => {
            if i.url.is_none() {
                bail!("index.url must be set when index.backend is 'qdrant'");
            }
            if !cfg!(feature = "qdrant") {
                bail!("index.backend 'qdrant' requires building with the `qdrant` feature");
            }
        }
        other => bail!(
            "Unknown index backend: '{}'. Must be memory, sqlite, or qdrant.",
            other
        ),
    }
    if i.upsert_batch == 0 {
        bail!("index.upsert_batch must be > 0");
    }

    // Validate ingest
    if config.ingest.workers == 0 {
        bail!("ingest.workers must be > 0");
    }
    if config.ingest.queue_capacity == 0 {
        bail!("ingest.queue_capacity must be > 0");
    }

    Ok(())
}
