//! Vector index adapter over the `passages` table.
//!
//! Passages are stored with their embedding as a little-endian f32 BLOB and
//! a `document_id`/`source` pair as metadata. Search embeds the query and
//! computes squared-L2 distance in Rust over a full scan, returning the k
//! nearest passages in ascending distance order — that ordering is the
//! canonical mapping from citation markers to passages for the turn.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::embedding::{blob_to_vec, embed_one, l2_distance_sq, vec_to_blob, Embedder};
use crate::error::PipelineResult;
use crate::models::Passage;

pub struct VectorIndex {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    /// Embed and store the chunks of one document, replacing any passages
    /// previously indexed for the same document id.
    pub async fn upsert_chunks(
        &self,
        document_id: &str,
        source: &str,
        chunks: &[String],
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let embeddings = self
            .embedder
            .embed(chunks)
            .await
            .map_err(|e| anyhow::anyhow!("failed to embed document chunks: {}", e))?;

        if embeddings.len() != chunks.len() {
            anyhow::bail!(
                "embedding count mismatch: {} chunks, {} vectors",
                chunks.len(),
                embeddings.len()
            );
        }

        sqlx::query("DELETE FROM passages WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        let now = Utc::now().timestamp();
        for (text, embedding) in chunks.iter().zip(embeddings.iter()) {
            sqlx::query(
                r#"
                INSERT INTO passages (id, document_id, source, text, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(document_id)
            .bind(source)
            .bind(text)
            .bind(vec_to_blob(embedding))
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        Ok(chunks.len())
    }

    /// Delete all passages belonging to a document. Returns rows removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM passages WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// k-nearest-neighbor search: embed the query, scan all stored passages,
    /// and return the k closest in ascending distance order.
    pub async fn search(&self, query: &str, k: usize) -> PipelineResult<Vec<Passage>> {
        let query_vec = embed_one(self.embedder.as_ref(), query).await?;

        let rows = sqlx::query("SELECT text, source, embedding FROM passages")
            .fetch_all(&self.pool)
            .await?;

        let mut passages: Vec<Passage> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                Passage {
                    text: row.get("text"),
                    source: row.get("source"),
                    distance: l2_distance_sq(&query_vec, &vec),
                }
            })
            .collect();

        passages.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        passages.truncate(k);

        Ok(passages)
    }

    pub async fn passage_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
