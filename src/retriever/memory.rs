//! In-memory vector store.
//!
//! Each tenant owns a shard holding an immutable snapshot of its chunks.
//! Writers build the next snapshot under the shard's writer lock and publish
//! it with one pointer swap; readers load the current snapshot without
//! locking and score it at leisure. A search that started before a write
//! finishes on the snapshot it loaded, so it can never observe a partial
//! insert.

use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{rank, VectorStore};
use crate::embedding::cosine_similarity;
use crate::models::{IndexOutcome, IndexedChunk, ScoredChunk};

struct StoredChunk {
    chunk: IndexedChunk,
    seq: u64,
}

#[derive(Default)]
struct WriterState {
    next_seq: u64,
    /// `(document_id, chunk_id)` → content hash of the live record.
    live: HashMap<(String, String), String>,
}

struct TenantShard {
    snapshot: ArcSwap<Vec<Arc<StoredChunk>>>,
    writer: Mutex<WriterState>,
}

impl TenantShard {
    fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(WriterState::default()),
        }
    }

    fn apply(&self, batch: Vec<(usize, IndexedChunk)>, outcomes: &mut [IndexOutcome]) {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut next: Vec<Arc<StoredChunk>> = self.snapshot.load_full().as_ref().clone();
        for (pos, chunk) in batch {
            let key = (chunk.document_id.clone(), chunk.chunk_id.clone());
            let outcome = match writer.live.get(&key) {
                Some(hash) if *hash == chunk.content_hash => IndexOutcome::Unchanged,
                Some(_) => {
                    next.retain(|s| {
                        s.chunk.document_id != chunk.document_id || s.chunk.chunk_id != chunk.chunk_id
                    });
                    IndexOutcome::Superseded
                }
                None => IndexOutcome::Inserted,
            };

            if outcome != IndexOutcome::Unchanged {
                let seq = writer.next_seq;
                writer.next_seq += 1;
                writer.live.insert(key, chunk.content_hash.clone());
                next.push(Arc::new(StoredChunk { chunk, seq }));
            }
            outcomes[pos] = outcome;
        }

        self.snapshot.store(Arc::new(next));
    }
}

/// Append-only, snapshot-published vector store.
pub struct MemoryVectorStore {
    tenants: DashMap<String, Arc<TenantShard>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
        }
    }

    fn shard(&self, tenant_id: &str) -> Option<Arc<TenantShard>> {
        self.tenants.get(tenant_id).map(|s| Arc::clone(s.value()))
    }

    fn shard_or_create(&self, tenant_id: &str) -> Arc<TenantShard> {
        if let Some(shard) = self.shard(tenant_id) {
            return shard;
        }
        Arc::clone(
            self.tenants
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(TenantShard::new()))
                .value(),
        )
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, chunks: Vec<IndexedChunk>) -> Result<Vec<IndexOutcome>> {
        let mut outcomes = vec![IndexOutcome::Unchanged; chunks.len()];

        let mut groups: Vec<(String, Vec<(usize, IndexedChunk)>)> = Vec::new();
        for (pos, chunk) in chunks.into_iter().enumerate() {
            match groups.iter_mut().find(|(t, _)| *t == chunk.tenant_id) {
                Some((_, batch)) => batch.push((pos, chunk)),
                None => groups.push((chunk.tenant_id.clone(), vec![(pos, chunk)])),
            }
        }

        for (tenant_id, batch) in groups {
            self.shard_or_create(&tenant_id).apply(batch, &mut outcomes);
        }
        Ok(outcomes)
    }

    async fn search(&self, tenant_id: &str, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let Some(shard) = self.shard(tenant_id) else {
            return Ok(Vec::new());
        };
        let snapshot = shard.snapshot.load_full();

        let hits = snapshot
            .iter()
            .map(|s| ScoredChunk {
                document_id: s.chunk.document_id.clone(),
                chunk_id: s.chunk.chunk_id.clone(),
                text: s.chunk.text.clone(),
                score: cosine_similarity(query, &s.chunk.vector),
                seq: s.seq,
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn count(&self, tenant_id: Option<&str>) -> Result<usize> {
        Ok(match tenant_id {
            Some(t) => self.shard(t).map(|s| s.snapshot.load().len()).unwrap_or(0),
            None => self
                .tenants
                .iter()
                .map(|s| s.value().snapshot.load().len())
                .sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::content_hash;

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
    async fn test_tenant_isolation() {
        let store = MemoryVectorStore::new();
        store
            .upsert(vec![
                indexed("tenant-a", "secret", "a's secret", vec![1.0, 0.0]),
                indexed("tenant-b", "public", "b's doc", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let b_hits = store.search("tenant-b", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(b_hits.len(), 1);
        assert_eq!(b_hits[0].chunk_id, "public");
        assert_eq!(store.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_superseded_chunk_moves_to_end_of_insertion_order() {
        let store = MemoryVectorStore::new();
        store
            .upsert(vec![
                indexed("t", "a", "one", vec![1.0, 0.0]),
                indexed("t", "b", "two", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();
        let outcomes = store
            .upsert(vec![indexed("t", "a", "one, revised", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![IndexOutcome::Superseded]);

        let hits = store.search("t", &[1.0, 0.0], 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(hits[1].text, "one, revised");
    }

    #[tokio::test]
    async fn test_old_snapshot_survives_concurrent_write() {
        let store = MemoryVectorStore::new();
        store
            .upsert(vec![indexed("t", "a", "one", vec![1.0, 0.0])])
            .await
            .unwrap();

        let shard = store.shard("t").unwrap();
        let before = shard.snapshot.load_full();
        store
            .upsert(vec![indexed("t", "b", "two", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(shard.snapshot.load().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_index_and_search() {
        let store = Arc::new(MemoryVectorStore::new());
        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let id = format!("c{}", i);
                    store
                        .upsert(vec![indexed("t", &id, &id, vec![1.0, i as f32])])
                        .await
                        .unwrap();
                }
            })
        };

        let mut last = 0;
        for _ in 0..50 {
            let n = store.search("t", &[1.0, 0.0], 500).await.unwrap().len();
            assert!(n >= last, "snapshots only grow: {} then {}", last, n);
            last = n;
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(store.count(Some("t")).await.unwrap(), 200);
    }
}
