//! Core data models used throughout Audit Intel.
//!
//! These types describe the documents, chunks and index records that flow
//! through ingestion and retrieval. A [`Document`] is owned by the lifecycle
//! manager; [`Chunk`]s and [`IndexRecord`]s are derived from it and carry
//! its id as lineage.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Lifecycle state of a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Pending,
    Ingested,
    Failed,
    Superseded,
    Deleted,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Pending => "pending",
            DocumentState::Ingested => "ingested",
            DocumentState::Failed => "failed",
            DocumentState::Superseded => "superseded",
            DocumentState::Deleted => "deleted",
        }
    }

    /// True once no ingestion job is running for the document.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentState::Pending)
    }

    /// Only ingested documents are visible to queries.
    pub fn is_searchable(&self) -> bool {
        matches!(self, DocumentState::Ingested)
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentState::Pending),
            "ingested" => Ok(DocumentState::Ingested),
            "failed" => Ok(DocumentState::Failed),
            "superseded" => Ok(DocumentState::Superseded),
            "deleted" => Ok(DocumentState::Deleted),
            other => Err(Error::InvalidInput(format!("unknown document state '{other}'"))),
        }
    }
}

/// Why an ingestion ended in [`DocumentState::Failed`].
///
/// Lets a caller decide whether re-submitting can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The document itself is unusable. Retrying will fail again.
    BadDocument,
    /// An embedding backend or the vector store was unavailable.
    Transient,
    /// The job was cancelled and its partial writes rolled back.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::BadDocument => "bad_document",
            FailureKind::Transient => "transient",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Classify an ingestion error.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Cancelled(_) => FailureKind::Cancelled,
            Error::Extraction(_) | Error::EmbeddingRejected(_) | Error::InvalidInput(_) => {
                FailureKind::BadDocument
            }
            _ => FailureKind::Transient,
        }
    }
}

impl FromStr for FailureKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bad_document" => Ok(FailureKind::BadDocument),
            "transient" => Ok(FailureKind::Transient),
            "cancelled" => Ok(FailureKind::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown failure kind '{other}'"))),
        }
    }
}

/// Failure details recorded on a failed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn from_error(err: &Error) -> Self {
        Self {
            kind: FailureKind::from_error(err),
            message: err.to_string(),
        }
    }
}

/// Document category, used for routing and query filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Audit,
    Policy,
    Financial,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Audit => "audit",
            Category::Policy => "policy",
            Category::Financial => "financial",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audit" => Ok(Category::Audit),
            "policy" => Ok(Category::Policy),
            "financial" => Ok(Category::Financial),
            other => Err(Error::InvalidInput(format!(
                "unknown category '{other}'. Use audit, policy, or financial."
            ))),
        }
    }
}

/// Access group assigned to documents that do not name one.
pub const DEFAULT_ACCESS_GROUP: &str = "GLOBAL_AUDIT";

/// Logical identity of a document: the same file name uploaded by the same
/// owner is the same logical document, whatever its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalKey {
    pub owner: String,
    pub filename: String,
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.filename)
    }
}

/// One uploaded version of a logical document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub owner: String,
    pub mime: String,
    pub category: Category,
    pub access_group: String,
    /// Upload time in Unix milliseconds.
    pub uploaded_at: i64,
    /// SHA-256 of the raw uploaded bytes.
    pub fingerprint: String,
    pub size_bytes: u64,
    pub state: DocumentState,
    pub chunk_count: usize,
    /// Embedding model the document's vectors were produced with.
    #[serde(default)]
    pub embedding_model: String,
    pub failure: Option<Failure>,
}

impl Document {
    pub fn key(&self) -> LogicalKey {
        LogicalKey {
            owner: self.owner.clone(),
            filename: self.filename.clone(),
        }
    }
}

/// A structural unit of extracted text (paragraph, heading block, page …).
///
/// `start`/`end` are byte offsets into the extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub start: usize,
    pub end: usize,
    /// Human-readable location for citations, e.g. `page 3`.
    pub location: Option<String>,
}

/// Structural boundaries reported by the extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub sections: Vec<Section>,
}

impl Structure {
    /// A structure treating the whole text as one section.
    pub fn whole(text: &str) -> Self {
        Self {
            sections: vec![Section {
                start: 0,
                end: text.len(),
                location: None,
            }],
        }
    }
}

/// A bounded, citable segment of one document.
///
/// `[start, end)` is the canonical span used for citation; canonical spans
/// of consecutive chunks tile the extracted text. `context` is the text that
/// was embedded: the canonical text prefixed with the overlap taken from the
/// previous chunk, starting at `overlap_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub overlap_start: usize,
    pub text: String,
    pub context: String,
    pub token_count: usize,
    /// SHA-256 of `context`; the embedding cache key.
    pub fingerprint: String,
    pub location: Option<String>,
}

/// The unit stored in a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub document_fingerprint: String,
    pub sequence: usize,
    pub uploaded_at: i64,
    pub filename: String,
    pub category: Category,
    pub access_group: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub location: Option<String>,
    pub vector: Vec<f32>,
}

impl IndexRecord {
    /// Build the index record for `chunk` of `doc` with its embedding.
    pub fn new(doc: &Document, chunk: &Chunk, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: doc.id.clone(),
            document_fingerprint: doc.fingerprint.clone(),
            sequence: chunk.index,
            uploaded_at: doc.uploaded_at,
            filename: doc.filename.clone(),
            category: doc.category,
            access_group: doc.access_group.clone(),
            start: chunk.start,
            end: chunk.end,
            text: chunk.text.clone(),
            location: chunk.location.clone(),
            vector,
        }
    }
}

/// SHA-256 hex digest of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id: UUID v5 over `document_id:index`.
///
/// Stable ids make re-upserting a chunk replace it in place, and UUIDs are
/// accepted as point ids by external vector stores.
pub fn chunk_id(document_id: &str, index: usize) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{document_id}:{index}").as_bytes(),
    )
    .to_string()
}
