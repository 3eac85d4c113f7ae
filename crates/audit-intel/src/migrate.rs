//! Idempotent schema setup.
//!
//! Tables:
//!
//! - `documents`: one row per uploaded version, with lifecycle state.
//! - `chunks`: chunk metadata of each document (the text lives in the index).
//! - `index_records`: vectors and payload for the SQLite vector index.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        owner TEXT NOT NULL,
        mime TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT 'audit',
        access_group TEXT NOT NULL DEFAULT 'GLOBAL_AUDIT',
        uploaded_at INTEGER NOT NULL,
        fingerprint TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        state TEXT NOT NULL,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        embedding_model TEXT NOT NULL DEFAULT '',
        failure_kind TEXT,
        failure_message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_identity ON documents(owner, filename)",
    "CREATE INDEX IF NOT EXISTS idx_documents_state ON documents(state)",
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        overlap_start INTEGER NOT NULL,
        token_count INTEGER NOT NULL,
        fingerprint TEXT NOT NULL,
        location TEXT,
        UNIQUE(document_id, chunk_index),
        FOREIGN KEY (document_id) REFERENCES documents(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)",
    r#"
    CREATE TABLE IF NOT EXISTS index_records (
        chunk_id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        document_fingerprint TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        uploaded_at INTEGER NOT NULL,
        filename TEXT NOT NULL,
        category TEXT NOT NULL,
        access_group TEXT NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        text TEXT NOT NULL,
        location TEXT,
        dims INTEGER NOT NULL,
        embedding BLOB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_index_records_document ON index_records(document_id)",
];

/// Create every table and index that does not exist yet.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to run schema migration")?;
    }
    Ok(())
}
