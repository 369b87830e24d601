//! Tenant-scoped response cache.
//!
//! Answers are keyed by a [`Fingerprint`]: the SHA-256 of the tenant id and
//! the normalized query text. Normalization is defined once, in
//! [`normalize_query`], and the fingerprint always hashes its output, so
//! `fingerprint(q) == fingerprint(normalize_query(q))` for every `q`.
//!
//! Entries are stored as `Arc`s and replaced whole, so a reader racing a
//! writer sees either the old answer or the new one. Expired entries are
//! dropped when read and by a periodic sweep; they are never returned.
//!
//! Each tenant has its own inner map. Purging a tenant detaches that map in
//! one operation and leaves every other tenant's reads untouched.
//!
//! Every purge also bumps the tenant's generation. An answer computed while
//! a purge happened carries the old generation, and its `put` is dropped,
//! so content from before a document change cannot land after the purge.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::CacheUnavailable;
use crate::models::CacheEntry;

/// Query normalization applied before fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeRules {
    /// Lowercase the query.
    pub case_fold: bool,
    /// Collapse runs of whitespace to a single space. Leading and trailing
    /// whitespace is always removed.
    pub collapse_whitespace: bool,
}

impl Default for NormalizeRules {
    fn default() -> Self {
        Self {
            case_fold: true,
            collapse_whitespace: true,
        }
    }
}

impl From<&CacheConfig> for NormalizeRules {
    fn from(config: &CacheConfig) -> Self {
        Self {
            case_fold: config.case_fold,
            collapse_whitespace: config.collapse_whitespace,
        }
    }
}

pub fn normalize_query(query: &str, rules: &NormalizeRules) -> String {
    let spaced = if rules.collapse_whitespace {
        query.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        query.trim().to_string()
    };
    if rules.case_fold {
        spaced.to_lowercase()
    } else {
        spaced
    }
}

/// Cache key for a `(tenant, query)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(tenant_id: &str, query: &str, rules: &NormalizeRules) -> Self {
        let normalized = normalize_query(query, rules);
        let mut hasher = Sha256::new();
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update((tenant_id.len() as u64).to_le_bytes());
        hasher.update(tenant_id.as_bytes());
        hasher.update(normalized.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Read-only counters for the admin surface.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub entries: usize,
    pub tenants: usize,
}

/// Backend contract for the response cache.
///
/// Backends may be remote, so every call can fail with [`CacheUnavailable`];
/// callers treat that as a miss.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(
        &self,
        tenant_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Arc<CacheEntry>>, CacheUnavailable>;

    /// The tenant's purge generation. Read it before computing an answer and
    /// hand it back to [`put`](Self::put).
    async fn generation(&self, tenant_id: &str) -> Result<u64, CacheUnavailable>;

    /// Insert or overwrite, unless the tenant was purged after `generation`
    /// was read. Returns whether the entry was stored.
    async fn put(
        &self,
        tenant_id: &str,
        fingerprint: Fingerprint,
        entry: CacheEntry,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, CacheUnavailable>;

    /// Drop every entry for a tenant and bump its generation, returning how
    /// many entries were removed.
    async fn purge(&self, tenant_id: &str) -> Result<usize, CacheUnavailable>;

    fn stats(&self) -> CacheStats;
}

struct Slot {
    entry: Arc<CacheEntry>,
    stored_at: Instant,
    expires_at: Instant,
}

type TenantEntries = DashMap<Fingerprint, Arc<Slot>>;

/// In-process [`ResponseCache`].
pub struct MemoryCache {
    tenants: DashMap<String, Arc<TenantEntries>>,
    generations: DashMap<String, u64>,
    max_entries_per_tenant: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_entries_per_tenant: usize) -> Self {
        Self {
            tenants: DashMap::new(),
            generations: DashMap::new(),
            max_entries_per_tenant: max_entries_per_tenant.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn tenant(&self, tenant_id: &str) -> Option<Arc<TenantEntries>> {
        self.tenants.get(tenant_id).map(|t| Arc::clone(t.value()))
    }

    fn tenant_or_create(&self, tenant_id: &str) -> Arc<TenantEntries> {
        if let Some(t) = self.tenant(tenant_id) {
            return t;
        }
        Arc::clone(
            self.tenants
                .entry(tenant_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Remove expired entries across all tenants.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for tenant in self.tenants.iter() {
            // Writers keep inserting during retain; only count what it drops.
            tenant.retain(|_, slot| {
                let live = slot.expires_at > now;
                if !live {
                    removed += 1;
                }
                live
            });
        }
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `every` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        })
    }

    fn evict_oldest(&self, entries: &TenantEntries) {
        let oldest = entries
            .iter()
            .min_by_key(|e| e.value().stored_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(
        &self,
        tenant_id: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Arc<CacheEntry>>, CacheUnavailable> {
        let Some(entries) = self.tenant(tenant_id) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let slot = entries.get(fingerprint).map(|s| Arc::clone(s.value()));
        let Some(slot) = slot else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if slot.expires_at <= Instant::now() {
            // Only drop the slot we looked at; a fresh put may have replaced it.
            entries.remove_if(fingerprint, |_, current| Arc::ptr_eq(current, &slot));
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Arc::clone(&slot.entry)))
    }

    async fn put(
        &self,
        tenant_id: &str,
        fingerprint: Fingerprint,
        entry: CacheEntry,
        ttl: Duration,
        generation: u64,
    ) -> Result<bool, CacheUnavailable> {
        // The generation shard stays locked until the insert is done, so a
        // purge lands either wholly before this put or wholly after it.
        let current = self.generations.entry(tenant_id.to_string()).or_insert(0);
        if *current != generation {
            debug!(tenant = tenant_id, "tenant purged while answering; not caching");
            return Ok(false);
        }

        let entries = self.tenant_or_create(tenant_id);
        if !entries.contains_key(&fingerprint) && entries.len() >= self.max_entries_per_tenant {
            self.evict_oldest(&entries);
        }

        let now = Instant::now();
        entries.insert(
            fingerprint,
            Arc::new(Slot {
                entry: Arc::new(entry),
                stored_at: now,
                expires_at: now + ttl,
            }),
        );
        drop(current);
        Ok(true)
    }

    async fn generation(&self, tenant_id: &str) -> Result<u64, CacheUnavailable> {
        Ok(self.generations.get(tenant_id).map(|g| *g).unwrap_or(0))
    }

    async fn purge(&self, tenant_id: &str) -> Result<usize, CacheUnavailable> {
        let mut generation = self.generations.entry(tenant_id.to_string()).or_insert(0);
        *generation += 1;
        let removed = self
            .tenants
            .remove(tenant_id)
            .map(|(_, entries)| entries.len())
            .unwrap_or(0);
        drop(generation);
        Ok(removed)
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.tenants.iter().map(|t| t.len()).sum(),
            tenants: self.tenants.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(text: &str) -> CacheEntry {
        CacheEntry {
            answer_text: text.to_string(),
            sources: Vec::new(),
            tokens_in: 10,
            tokens_out: 5,
            provider: "mock".to_string(),
            created_at: Utc::now(),
        }
    }

    fn fp(tenant: &str, q: &str) -> Fingerprint {
        Fingerprint::compute(tenant, q, &NormalizeRules::default())
    }

    #[test]
    fn test_normalization_is_idempotent_under_fingerprint() {
        let rules = NormalizeRules::default();
        for q in ["  What is the   Refund policy?\n", "refund", "MiXeD\tCase  text "] {
            let normalized = normalize_query(q, &rules);
            assert_eq!(normalize_query(&normalized, &rules), normalized);
            assert_eq!(
                Fingerprint::compute("t", q, &rules),
                Fingerprint::compute("t", &normalized, &rules)
            );
        }
        assert_eq!(
            normalize_query("  What is the   Refund policy? ", &rules),
            "what is the refund policy?"
        );
    }

    #[test]
    fn test_rules_can_be_relaxed() {
        let strict = NormalizeRules {
            case_fold: false,
            collapse_whitespace: false,
        };
        assert_ne!(
            Fingerprint::compute("t", "Refund", &strict),
            Fingerprint::compute("t", "refund", &strict)
        );
        assert_eq!(normalize_query("  a  b ", &strict), "a  b");
    }

    #[test]
    fn test_fingerprint_depends_on_tenant() {
        assert_ne!(fp("tenant-a", "refund"), fp("tenant-b", "refund"));
        assert_ne!(fp("ab", "c"), fp("a", "bc"));
        assert_eq!(fp("t", "x").as_str().len(), 64);
    }

    #[tokio::test]
    async fn test_put_get_and_tenant_isolation() {
        let cache = MemoryCache::new(100);
        let key = fp("tenant-a", "refund");
        cache
            .put("tenant-a", key.clone(), entry("14 days"), Duration::from_secs(60), 0)
            .await
            .unwrap();

        let hit = cache.get("tenant-a", &key).await.unwrap().unwrap();
        assert_eq!(hit.answer_text, "14 days");

        // Same text under another tenant hashes differently and lives in another map.
        assert!(cache.get("tenant-b", &fp("tenant-b", "refund")).await.unwrap().is_none());
        assert!(cache.get("tenant-b", &key).await.unwrap().is_none());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 2));
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let cache = MemoryCache::new(100);
        let key = fp("t", "q");
        cache.put("t", key.clone(), entry("old"), Duration::from_secs(60), 0).await.unwrap();
        let before = cache.get("t", &key).await.unwrap().unwrap();
        cache.put("t", key.clone(), entry("new"), Duration::from_secs(60), 0).await.unwrap();

        assert_eq!(before.answer_text, "old");
        assert_eq!(cache.get("t", &key).await.unwrap().unwrap().answer_text, "new");
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_never_served() {
        let cache = MemoryCache::new(100);
        let key = fp("t", "q");
        cache.put("t", key.clone(), entry("a"), Duration::from_secs(30), 0).await.unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("t", &key).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("t", &key).await.unwrap().is_none());
        assert_eq!(cache.stats().expired, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let cache = MemoryCache::new(100);
        cache.put("t", fp("t", "short"), entry("a"), Duration::from_secs(5), 0).await.unwrap();
        cache.put("t", fp("t", "long"), entry("b"), Duration::from_secs(500), 0).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn test_purge_is_tenant_scoped() {
        let cache = MemoryCache::new(100);
        for q in ["a", "b", "c"] {
            cache.put("t1", fp("t1", q), entry(q), Duration::from_secs(60), 0).await.unwrap();
        }
        cache.put("t2", fp("t2", "a"), entry("a"), Duration::from_secs(60), 0).await.unwrap();

        assert_eq!(cache.purge("t1").await.unwrap(), 3);
        assert!(cache.get("t1", &fp("t1", "a")).await.unwrap().is_none());
        assert!(cache.get("t2", &fp("t2", "a")).await.unwrap().is_some());
        assert_eq!(cache.purge("t1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = MemoryCache::new(2);
        cache.put("t", fp("t", "1"), entry("1"), Duration::from_secs(60), 0).await.unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put("t", fp("t", "2"), entry("2"), Duration::from_secs(60), 0).await.unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put("t", fp("t", "3"), entry("3"), Duration::from_secs(60), 0).await.unwrap();

        assert!(cache.get("t", &fp("t", "1")).await.unwrap().is_none());
        assert!(cache.get("t", &fp("t", "3")).await.unwrap().is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_entries() {
        let cache = Arc::new(MemoryCache::new(100));
        let key = fp("t", "q");
        cache.put("t", key.clone(), entry("v0"), Duration::from_secs(60), 0).await.unwrap();

        let writer = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                for i in 1..100 {
                    let text = format!("v{}", i);
                    cache.put("t", key.clone(), entry(&text), Duration::from_secs(60), 0).await.unwrap();
                }
            })
        };
        for _ in 0..100 {
            let seen = cache.get("t", &key).await.unwrap().unwrap();
            assert!(seen.answer_text.starts_with('v'));
            assert_eq!(seen.tokens_in, 10);
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_put_from_before_purge_is_dropped() {
        let cache = MemoryCache::new(100);
        let key = fp("t1", "refund policy?");
        let seen = cache.generation("t1").await.unwrap();

        // Documents change while the answer is being computed.
        cache.purge("t1").await.unwrap();
        let stored = cache
            .put("t1", key.clone(), entry("stale"), Duration::from_secs(60), seen)
            .await
            .unwrap();
        assert!(!stored);
        assert!(cache.get("t1", &key).await.unwrap().is_none());

        // Other tenants keep their own generation.
        assert_eq!(cache.generation("t2").await.unwrap(), 0);

        let fresh = cache.generation("t1").await.unwrap();
        assert_eq!(fresh, seen + 1);
        assert!(cache
            .put("t1", key.clone(), entry("fresh"), Duration::from_secs(60), fresh)
            .await
            .unwrap());
        assert_eq!(cache.get("t1", &key).await.unwrap().unwrap().answer_text, "fresh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweep_while_writers_insert() {
        let cache = Arc::new(MemoryCache::new(100_000));
        let writers: Vec<_> = (0..3)
            .map(|w| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for i in 0..20_000 {
                        let key = fp("t", &format!("{}-{}", w, i));
                        cache.put("t", key, entry("x"), Duration::ZERO, 0).await.unwrap();
                    }
                })
            })
            .collect();
        let sweeper = {
            let cache = cache.clone();
            tokio::task::spawn_blocking(move || (0..500).map(|_| cache.sweep()).sum::<usize>())
        };

        for w in writers {
            w.await.unwrap();
        }
        let removed = sweeper.await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.expired as usize, removed);
        assert_eq!(stats.entries + removed, 60_000);
    }
}
