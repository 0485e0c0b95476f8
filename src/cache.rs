//! Semantic response cache.
//!
//! Maps a query's embedding to a previously generated answer within a
//! distance threshold and TTL. Entries are keyed by a SHA-256 hash of the
//! raw query text, so re-storing the exact same query overwrites in place,
//! while lookup is by embedding proximity — two differently worded queries
//! that land near one stored entry both resolve to the same cached answer.
//!
//! Expired entries are evicted lazily: a lookup that finds its nearest
//! entry past TTL deletes it and reports a miss. There is no background
//! sweeper; durability is delegated to SQLite.
//!
//! One instance per process, constructed at startup and shared via `Arc`.
//! The orchestrator treats every error from this module as a miss — the
//! cache must never block or fail the chat path.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::embedding::{blob_to_vec, embed_one, l2_distance_sq, vec_to_blob, Embedder};
use crate::error::PipelineResult;

/// A successful cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub answer: String,
    pub distance: f64,
}

/// Snapshot of the cache surface, exposed on the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: i64,
    pub similarity_threshold: f64,
    pub ttl_seconds: u64,
}

pub struct SemanticCache {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    config: CacheConfig,
}

impl SemanticCache {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, config: &CacheConfig) -> Self {
        Self {
            pool,
            embedder,
            config: config.clone(),
        }
    }

    /// Deterministic entry id for a query text.
    fn cache_id(query: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a semantically similar query.
    ///
    /// A hit requires a nearest entry within the distance threshold whose
    /// age is under TTL. An expired nearest entry is deleted as a side
    /// effect and the lookup still reports a miss.
    pub async fn lookup(&self, query: &str) -> PipelineResult<Option<CacheHit>> {
        let query_vec = embed_one(self.embedder.as_ref(), query).await?;

        let rows = sqlx::query("SELECT id, query, answer, embedding, created_at FROM cache_entries")
            .fetch_all(&self.pool)
            .await?;

        // 1-nearest-neighbor over the cache collection
        let mut nearest: Option<(String, String, String, i64, f64)> = None;
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let distance = l2_distance_sq(&query_vec, &blob_to_vec(&blob));
            if nearest.as_ref().map_or(true, |(_, _, _, _, d)| distance < *d) {
                nearest = Some((
                    row.get("id"),
                    row.get("query"),
                    row.get("answer"),
                    row.get("created_at"),
                    distance,
                ));
            }
        }

        let Some((id, original_query, answer, created_at, distance)) = nearest else {
            return Ok(None);
        };

        if distance > self.config.similarity_threshold {
            tracing::debug!(
                distance,
                threshold = self.config.similarity_threshold,
                "cache miss"
            );
            return Ok(None);
        }

        let age = Utc::now().timestamp() - created_at;
        if age >= self.config.ttl_secs as i64 {
            tracing::info!(entry = %id, age, "cache miss, evicting expired entry");
            sqlx::query("DELETE FROM cache_entries WHERE id = ?")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }

        tracing::info!(distance, original = %truncate(&original_query, 50), "cache hit");
        Ok(Some(CacheHit { answer, distance }))
    }

    /// Store a query/answer pair, overwriting any entry for the exact same
    /// query text.
    pub async fn store(&self, query: &str, answer: &str) -> PipelineResult<()> {
        let embedding = embed_one(self.embedder.as_ref(), query).await?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (id, query, answer, embedding, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                query = excluded.query,
                answer = excluded.answer,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(Self::cache_id(query))
        .bind(query)
        .bind(answer)
        .bind(vec_to_blob(&embedding))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        tracing::debug!(query = %truncate(query, 50), "cached response");
        Ok(())
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        cache_stats(&self.pool, &self.config).await
    }

    /// Remove every entry. Returns the number removed.
    pub async fn clear(&self) -> Result<u64> {
        clear_cache(&self.pool).await
    }
}

/// Cache counters straight off the pool. Used by the CLI, which has no
/// reason to construct an embedder just to count rows.
pub async fn cache_stats(pool: &SqlitePool, config: &CacheConfig) -> Result<CacheStats> {
    let total_entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
        .fetch_one(pool)
        .await?;
    Ok(CacheStats {
        total_entries,
        similarity_threshold: config.similarity_threshold,
        ttl_seconds: config.ttl_secs,
    })
}

pub async fn clear_cache(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM cache_entries")
        .execute(pool)
        .await?;
    tracing::info!(removed = result.rows_affected(), "cache cleared");
    Ok(result.rows_affected())
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_id_deterministic() {
        assert_eq!(
            SemanticCache::cache_id("reimburse Angga"),
            SemanticCache::cache_id("reimburse Angga")
        );
        assert_ne!(
            SemanticCache::cache_id("reimburse Angga"),
            SemanticCache::cache_id("reimburse angga")
        );
    }

    #[test]
    fn test_cache_id_is_hex_sha256() {
        let id = SemanticCache::cache_id("halo");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_truncate_multibyte_safe() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("ok", 50), "ok");
    }
}
