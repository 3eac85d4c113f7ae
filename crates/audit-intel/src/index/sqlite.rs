//! SQLite-backed [`VectorIndex`].
//!
//! Records live in the `index_records` table with the vector stored as a
//! little-endian f32 BLOB. Metadata filters are applied in SQL; similarity
//! is computed in process over the filtered rows (brute force), then
//! ordered with [`compare_candidates`].
//!
//! Upserts and document deletes each run in one transaction, so readers
//! see all of a call's writes or none of them.

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use audit_intel_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use audit_intel_core::index::{Candidate, SearchFilters, VectorIndex};
use audit_intel_core::models::IndexRecord;
use audit_intel_core::search::compare_candidates;
use audit_intel_core::{Error, Result};

const COLUMNS: &str = "chunk_id, document_id, document_fingerprint, sequence, uploaded_at, \
                       filename, category, access_group, start_offset, end_offset, text, \
                       location, embedding";

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn unavailable(err: sqlx::Error) -> Error {
    Error::IndexUnavailable(err.to_string())
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<IndexRecord> {
    let blob: Vec<u8> = row.get("embedding");
    Ok(IndexRecord {
        chunk_id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        document_fingerprint: row.get("document_fingerprint"),
        sequence: row.get::<i64, _>("sequence") as usize,
        uploaded_at: row.get("uploaded_at"),
        filename: row.get("filename"),
        category: row.get::<String, _>("category").parse()?,
        access_group: row.get("access_group"),
        start: row.get::<i64, _>("start_offset") as usize,
        end: row.get::<i64, _>("end_offset") as usize,
        text: row.get("text"),
        location: row.get("location"),
        vector: blob_to_vec(&blob),
    })
}

/// Append a ` AND column IN (...)` clause.
fn push_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[String]) {
    qb.push(format!(" AND {column} IN ("));
    let mut list = qb.separated(", ");
    for value in values {
        list.push_bind(value.clone());
    }
    list.push_unseparated(")");
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO index_records (chunk_id, document_id, document_fingerprint, sequence,
                                           uploaded_at, filename, category, access_group,
                                           start_offset, end_offset, text, location, dims, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    document_fingerprint = excluded.document_fingerprint,
                    sequence = excluded.sequence,
                    uploaded_at = excluded.uploaded_at,
                    filename = excluded.filename,
                    category = excluded.category,
                    access_group = excluded.access_group,
                    start_offset = excluded.start_offset,
                    end_offset = excluded.end_offset,
                    text = excluded.text,
                    location = excluded.location,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&record.chunk_id)
            .bind(&record.document_id)
            .bind(&record.document_fingerprint)
            .bind(record.sequence as i64)
            .bind(record.uploaded_at)
            .bind(&record.filename)
            .bind(record.category.as_str())
            .bind(&record.access_group)
            .bind(record.start as i64)
            .bind(record.end as i64)
            .bind(&record.text)
            .bind(&record.location)
            .bind(record.vector.len() as i64)
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }
        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM index_records WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() as usize)
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
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM index_records WHERE 1 = 1"));
        if let Some(ids) = &filters.document_ids {
            push_in(&mut qb, "document_id", ids);
        }
        if let Some(groups) = &filters.access_groups {
            push_in(&mut qb, "access_group", groups);
        }
        if let Some(after) = filters.uploaded_after {
            qb.push(" AND uploaded_at >= ").push_bind(after);
        }
        if let Some(category) = filters.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = record_from_row(row)?;
            candidates.push(Candidate {
                score: cosine_similarity(vector, &record.vector),
                record,
            });
        }
        candidates.sort_by(compare_candidates);
        candidates.truncate(top_k);
        Ok(candidates)
    }

    async fn document_records(&self, document_id: &str) -> Result<Vec<IndexRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM index_records WHERE document_id = ? ORDER BY sequence ASC"
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn document_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT chunk_id FROM index_records WHERE document_id = ? ORDER BY chunk_id ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_records")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(n as usize)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audit_intel_core::models::Category;

    async fn index() -> (tempfile::TempDir, SqliteIndex) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();
        (tmp, SqliteIndex::new(pool))
    }

    fn record(doc: &str, seq: usize, vector: Vec<f32>) -> IndexRecord {
        IndexRecord {
            chunk_id: format!("{doc}-{seq}"),
            document_id: doc.to_string(),
            document_fingerprint: format!("fp-{doc}"),
            sequence: seq,
            uploaded_at: 1_000,
            filename: format!("{doc}.pdf"),
            category: Category::Audit,
            access_group: "GLOBAL_AUDIT".to_string(),
            start: seq * 100,
            end: seq * 100 + 100,
            text: format!("chunk {seq} of {doc}"),
            location: Some("page 1".to_string()),
            vector,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_by_chunk_id() {
        let (_tmp, index) = index().await;
        index.upsert(&[record("d1", 0, vec![1.0, 0.0])]).await.unwrap();
        index.upsert(&[record("d1", 0, vec![0.0, 1.0])]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let records = index.document_records("d1").await.unwrap();
        assert_eq!(records, vec![record("d1", 0, vec![0.0, 1.0])]);
    }

    #[tokio::test]
    async fn delete_document_removes_all_its_records() {
        let (_tmp, index) = index().await;
        index
            .upsert(&[
                record("d1", 0, vec![1.0, 0.0]),
                record("d1", 1, vec![1.0, 0.5]),
                record("d2", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(index.delete_document("d1").await.unwrap(), 2);
        assert!(index.document_chunk_ids("d1").await.unwrap().is_empty());
        assert_eq!(index.document_chunk_ids("d2").await.unwrap(), vec!["d2-0"]);
    }

    #[tokio::test]
    async fn search_filters_in_sql_and_orders_totally() {
        let (_tmp, index) = index().await;
        let mut policy = record("d2", 0, vec![1.0, 0.0]);
        policy.category = Category::Policy;
        policy.access_group = "HR".to_string();
        policy.uploaded_at = 5_000;
        index
            .upsert(&[
                record("d1", 1, vec![1.0, 0.0]),
                record("d1", 0, vec![1.0, 0.0]),
                policy,
                record("d3", 0, vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let all = index
            .search(&[1.0, 0.0], 3, &SearchFilters::default())
            .await
            .unwrap();
        let ids: Vec<_> = all.iter().map(|c| c.record.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["d2-0", "d1-0", "d1-1"]);

        let filters = SearchFilters {
            access_groups: Some(vec!["GLOBAL_AUDIT".to_string()]),
            category: Some(Category::Audit),
            ..Default::default()
        };
        let hits = index.search(&[1.0, 0.0], 10, &filters).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|c| c.record.document_id != "d2"));

        let recent = SearchFilters {
            uploaded_after: Some(2_000),
            ..Default::default()
        };
        let hits = index.search(&[1.0, 0.0], 10, &recent).await.unwrap();
        assert_eq!(hits.len(), 1);

        let none = SearchFilters {
            document_ids: Some(vec![]),
            ..Default::default()
        };
        assert!(index.search(&[1.0, 0.0], 10, &none).await.unwrap().is_empty());
        index.ping().await.unwrap();
    }
}
