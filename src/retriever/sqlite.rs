//! SQLite-backed vector store.
//!
//! Vectors are stored as little-endian f32 BLOBs and scored in process with
//! a brute-force scan over the tenant's rows. WAL mode gives every search a
//! consistent read snapshot while ingestion commits alongside it.
//!
//! Each row records its vector length. A search only scans rows whose length
//! matches the query, so a file indexed under a different embedder is ignored
//! rather than scored as zero, and re-ingesting the same text under the new
//! embedder replaces the old row.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use super::{rank, VectorStore};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::migrate;
use crate::models::{IndexOutcome, IndexedChunk, ScoredChunk};

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Connect to `path` and make sure the schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, chunks: Vec<IndexedChunk>) -> Result<Vec<IndexOutcome>> {
        let now = chrono::Utc::now().timestamp();
        let mut outcomes = Vec::with_capacity(chunks.len());
        let mut tx = self.pool.begin().await?;

        for chunk in &chunks {
            let existing: Option<(String, i64)> = sqlx::query_as(
                "SELECT content_hash, dims FROM chunk_vectors
                 WHERE tenant_id = ? AND document_id = ? AND chunk_id = ?",
            )
            .bind(&chunk.tenant_id)
            .bind(&chunk.document_id)
            .bind(&chunk.chunk_id)
            .fetch_optional(&mut *tx)
            .await?;

            let outcome = match existing {
                Some((hash, dims)) if hash == chunk.content_hash && dims == chunk.vector.len() as i64 => {
                    outcomes.push(IndexOutcome::Unchanged);
                    continue;
                }
                Some(_) => {
                    sqlx::query(
                        "DELETE FROM chunk_vectors
                         WHERE tenant_id = ? AND document_id = ? AND chunk_id = ?",
                    )
                    .bind(&chunk.tenant_id)
                    .bind(&chunk.document_id)
                    .bind(&chunk.chunk_id)
                    .execute(&mut *tx)
                    .await?;
                    IndexOutcome::Superseded
                }
                None => IndexOutcome::Inserted,
            };

            sqlx::query(
                "INSERT INTO chunk_vectors
                 (tenant_id, document_id, chunk_id, text, content_hash, dims, embedding, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.tenant_id)
            .bind(&chunk.document_id)
            .bind(&chunk.chunk_id)
            .bind(&chunk.text)
            .bind(&chunk.content_hash)
            .bind(chunk.vector.len() as i64)
            .bind(vec_to_blob(&chunk.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
            outcomes.push(outcome);
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn search(&self, tenant_id: &str, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            "SELECT seq, document_id, chunk_id, text, embedding FROM chunk_vectors
             WHERE tenant_id = ? AND dims = ? ORDER BY seq",
        )
        .bind(tenant_id)
        .bind(query.len() as i64)
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let seq: i64 = row.get("seq");
                ScoredChunk {
                    document_id: row.get("document_id"),
                    chunk_id: row.get("chunk_id"),
                    text: row.get("text"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)),
                    seq: seq as u64,
                }
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn count(&self, tenant_id: Option<&str>) -> Result<usize> {
        let n: i64 = match tenant_id {
            Some(t) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE tenant_id = ?")
                    .bind(t)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::content_hash;
    use tempfile::TempDir;

    fn indexed(tenant: &str, id: &str, text: &str, vector: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            tenant_id: tenant.to_string(),
            document_id: "doc".to_string(),
            chunk_id: id.to_string(),
            text: text.to_string(),
            content_hash: content_hash(text),
            vector,
        }
    }

    #[tokio::test]
    async fn test_sqlite_upsert_search_and_supersede() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(&tmp.path().join("vectors.sqlite"))
            .await
            .unwrap();

        let outcomes = store
            .upsert(vec![
                indexed("t1", "a", "alpha", vec![1.0, 0.0]),
                indexed("t1", "b", "beta", vec![0.0, 1.0]),
                indexed("t2", "a", "other tenant", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![IndexOutcome::Inserted; 3]);

        let again = store
            .upsert(vec![indexed("t1", "a", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(again, vec![IndexOutcome::Unchanged]);

        let hits = store.search("t1", &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "a");
        assert_eq!(hits[0].text, "alpha");

        let edit = store
            .upsert(vec![indexed("t1", "a", "alpha v2", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(edit, vec![IndexOutcome::Superseded]);
        assert_eq!(store.count(Some("t1")).await.unwrap(), 2);
        assert_eq!(store.count(None).await.unwrap(), 3);

        let hits = store.search("t1", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].text, "alpha v2");
    }

    #[tokio::test]
    async fn test_rows_from_another_embedder_are_skipped_then_replaced() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(&tmp.path().join("vectors.sqlite"))
            .await
            .unwrap();
        store
            .upsert(vec![indexed("t1", "a", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert!(store.search("t1", &[1.0, 0.0, 0.0], 5).await.unwrap().is_empty());

        let reindexed = store
            .upsert(vec![indexed("t1", "a", "alpha", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(reindexed, vec![IndexOutcome::Superseded]);
        assert_eq!(store.count(Some("t1")).await.unwrap(), 1);

        let hits = store.search("t1", &[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }
}
