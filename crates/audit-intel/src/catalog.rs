//! Durable record of documents and their chunks.
//!
//! The lifecycle manager keeps its working set of [`Document`]s in memory
//! and writes every state change through a [`Catalog`], so a restarted
//! process can recover it. Chunk rows record which embedding-cache entries
//! a document references.
//!
//! Two implementations: [`MemoryCatalog`] (nothing survives the process)
//! and [`SqliteCatalog`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use audit_intel_core::models::{Chunk, Document, Failure, FailureKind};
use audit_intel_core::{Error, Result};

/// The cache key of one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub fingerprint: String,
}

impl From<&Chunk> for ChunkRef {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            fingerprint: chunk.fingerprint.clone(),
        }
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Insert or replace a document row.
    async fn save_document(&self, doc: &Document) -> Result<()>;

    /// Every document, oldest upload first.
    async fn load_documents(&self) -> Result<Vec<Document>>;

    /// Persist `new` and, when given, `old` in one transaction.
    ///
    /// Used for the supersede switch, where the new version becoming
    /// `ingested` and the old one becoming `superseded` must not be
    /// observable separately.
    async fn commit_switch(&self, new: &Document, old: Option<&Document>) -> Result<()>;

    /// Replace the chunk rows of `document_id`.
    async fn save_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunk references of `document_id` in sequence order.
    async fn chunk_refs(&self, document_id: &str) -> Result<Vec<ChunkRef>>;

    async fn delete_chunks(&self, document_id: &str) -> Result<()>;
}

/// Catalog held in process memory.
#[derive(Default)]
pub struct MemoryCatalog {
    documents: Mutex<BTreeMap<String, Document>>,
    chunks: Mutex<HashMap<String, Vec<ChunkRef>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn save_document(&self, doc: &Document) -> Result<()> {
        self.documents
            .lock()
            .unwrap()
            .insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn load_documents(&self) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self.documents.lock().unwrap().values().cloned().collect();
        docs.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn commit_switch(&self, new: &Document, old: Option<&Document>) -> Result<()> {
        let mut docs = self.documents.lock().unwrap();
        docs.insert(new.id.clone(), new.clone());
        if let Some(old) = old {
            docs.insert(old.id.clone(), old.clone());
        }
        Ok(())
    }

    async fn save_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.chunks.lock().unwrap().insert(
            document_id.to_string(),
            chunks.iter().map(ChunkRef::from).collect(),
        );
        Ok(())
    }

    async fn chunk_refs(&self, document_id: &str) -> Result<Vec<ChunkRef>> {
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        self.chunks.lock().unwrap().remove(document_id);
        Ok(())
    }
}

fn storage(err: sqlx::Error) -> Error {
    Error::Storage(err.to_string())
}

/// Catalog stored in the `documents` and `chunks` tables.
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const UPSERT_DOCUMENT: &str = r#"
    INSERT INTO documents (id, filename, owner, mime, category, access_group,
                           uploaded_at, fingerprint, size_bytes, state, chunk_count,
                           embedding_model, failure_kind, failure_message)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        state = excluded.state,
        chunk_count = excluded.chunk_count,
        embedding_model = excluded.embedding_model,
        failure_kind = excluded.failure_kind,
        failure_message = excluded.failure_message
"#;

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn upsert_document(doc: &Document) -> SqliteQuery<'_> {
    sqlx::query(UPSERT_DOCUMENT)
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.owner)
        .bind(&doc.mime)
        .bind(doc.category.as_str())
        .bind(&doc.access_group)
        .bind(doc.uploaded_at)
        .bind(&doc.fingerprint)
        .bind(doc.size_bytes as i64)
        .bind(doc.state.as_str())
        .bind(doc.chunk_count as i64)
        .bind(&doc.embedding_model)
        .bind(doc.failure.as_ref().map(|f| f.kind.as_str()))
        .bind(doc.failure.as_ref().map(|f| f.message.clone()))
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let failure = match row.get::<Option<String>, _>("failure_kind") {
        Some(kind) => Some(Failure {
            kind: kind.parse::<FailureKind>()?,
            message: row
                .get::<Option<String>, _>("failure_message")
                .unwrap_or_default(),
        }),
        None => None,
    };
    Ok(Document {
        id: row.get("id"),
        filename: row.get("filename"),
        owner: row.get("owner"),
        mime: row.get("mime"),
        category: row.get::<String, _>("category").parse()?,
        access_group: row.get("access_group"),
        uploaded_at: row.get("uploaded_at"),
        fingerprint: row.get("fingerprint"),
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        state: row.get::<String, _>("state").parse()?,
        chunk_count: row.get::<i64, _>("chunk_count") as usize,
        embedding_model: row.get("embedding_model"),
        failure,
    })
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn save_document(&self, doc: &Document) -> Result<()> {
        upsert_document(doc)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn load_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY uploaded_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(document_from_row).collect()
    }

    async fn commit_switch(&self, new: &Document, old: Option<&Document>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        upsert_document(new)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        if let Some(old) = old {
            upsert_document(old)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn save_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, start_offset, end_offset,
                                    overlap_start, token_count, fingerprint, location)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.index as i64)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(chunk.overlap_start as i64)
            .bind(chunk.token_count as i64)
            .bind(&chunk.fingerprint)
            .bind(&chunk.location)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn chunk_refs(&self, document_id: &str) -> Result<Vec<ChunkRef>> {
        let rows = sqlx::query(
            "SELECT id, fingerprint FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows
            .iter()
            .map(|row| ChunkRef {
                chunk_id: row.get("id"),
                fingerprint: row.get("fingerprint"),
            })
            .collect())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}
