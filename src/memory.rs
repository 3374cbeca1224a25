//! In-memory tier
//!
//! A bounded LRU map of fully buffered artifacts. The tier is insert-only
//! with respect to replacement: when a store arrives for a key that is
//! already resident, the existing entry wins and the incoming payload is
//! dropped. Eviction is strictly by recency and only to satisfy the entry
//! and byte budgets.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::MemoryCacheConfig;
use crate::error::CacheOpResult;
use crate::key::CacheKey;
use crate::provider::{CacheProvider, LatencyZone, ProviderCapabilities, StoreReason};
use crate::result::{EntryMetadata, FetchPayload};

struct MemoryEntry {
    bytes: Bytes,
    metadata: EntryMetadata,
}

struct MemoryState {
    entries: HashMap<CacheKey, MemoryEntry>,
    recency: VecDeque<CacheKey>,
    total_bytes: u64,
}

impl MemoryState {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(*key);
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        if let Some(entry) = self.entries.remove(key) {
            self.total_bytes -= entry.bytes.len() as u64;
            if let Some(pos) = self.recency.iter().position(|k| k == key) {
                self.recency.remove(pos);
            }
            true
        } else {
            false
        }
    }

    fn evict_to_fit(&mut self, incoming: u64, config: &MemoryCacheConfig) {
        while !self.recency.is_empty()
            && (self.entries.len() >= config.max_entries
                || self.total_bytes + incoming > config.max_bytes)
        {
            if let Some(victim) = self.recency.pop_front() {
                if let Some(entry) = self.entries.remove(&victim) {
                    self.total_bytes -= entry.bytes.len() as u64;
                }
            }
        }
    }
}

/// Process-local cache tier holding buffered artifacts
pub struct MemoryCache {
    name: String,
    config: MemoryCacheConfig,
    state: RwLock<MemoryState>,
}

impl MemoryCache {
    /// Memory tier with the given name and budgets.
    pub fn new(name: impl Into<String>, config: MemoryCacheConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(MemoryState {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                total_bytes: 0,
            }),
        }
    }

    /// Resident entry count.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Whether the tier holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    /// Total buffered bytes.
    pub async fn total_bytes(&self) -> u64 {
        self.state.read().await.total_bytes
    }
}

#[async_trait]
impl CacheProvider for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            requires_inline_execution: true,
            latency_zone: LatencyZone::Memory,
            is_local: true,
        }
    }

    async fn fetch(
        &self,
        key: &CacheKey,
        _ct: &CancellationToken,
    ) -> CacheOpResult<Option<FetchPayload>> {
        let mut state = self.state.write().await;
        let found = state
            .entries
            .get(key)
            .map(|entry| (entry.bytes.clone(), entry.metadata.clone()));
        match found {
            Some((bytes, metadata)) => {
                state.touch(key);
                Ok(Some(FetchPayload::from_bytes(bytes, metadata)))
            }
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        metadata: &EntryMetadata,
        _ct: &CancellationToken,
    ) -> CacheOpResult<()> {
        let size = bytes.len() as u64;
        if size > self.config.max_entry_bytes {
            debug!(key = %key, size, "entry exceeds memory tier size filter");
            return Ok(());
        }

        let mut state = self.state.write().await;
        // Insert-only: an existing entry wins, the incoming copy is
        // released.
        if state.entries.contains_key(key) {
            return Ok(());
        }
        state.evict_to_fit(size, &self.config);
        state.entries.insert(
            *key,
            MemoryEntry {
                bytes,
                metadata: metadata.clone(),
            },
        );
        state.total_bytes += size;
        state.recency.push_back(*key);
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey, _ct: &CancellationToken) -> CacheOpResult<bool> {
        Ok(self.state.write().await.remove(key))
    }

    async fn purge_source(
        &self,
        source_prefix: &str,
        _ct: &CancellationToken,
    ) -> CacheOpResult<u64> {
        let mut state = self.state.write().await;
        let victims: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.source_prefix() == source_prefix)
            .copied()
            .collect();
        let mut removed = 0;
        for key in victims {
            if state.remove(&key) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn wants_store(&self, _key: &CacheKey, size_bytes: u64, reason: StoreReason) -> bool {
        if size_bytes > self.config.max_entry_bytes {
            return false;
        }
        match reason {
            StoreReason::FreshlyCreated | StoreReason::Missed => true,
            StoreReason::NotQueried => false,
        }
    }

    fn probably_contains(&self, _key: &CacheKey) -> bool {
        true
    }

    async fn health_check(&self, _ct: &CancellationToken) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, max_bytes: u64) -> MemoryCache {
        MemoryCache::new(
            "memory",
            MemoryCacheConfig {
                max_entries,
                max_bytes,
                max_entry_bytes: 1024,
            },
        )
    }

    fn key(n: u8) -> CacheKey {
        CacheKey::from_raw([n; 32])
    }

    #[tokio::test]
    async fn test_store_and_fetch() {
        let cache = cache(10, 4096);
        let ct = CancellationToken::new();
        cache
            .store(
                &key(1),
                Bytes::from_static(b"body"),
                &EntryMetadata::with_content_type("image/webp"),
                &ct,
            )
            .await
            .unwrap();

        let payload = cache.fetch(&key(1), &ct).await.unwrap().unwrap();
        assert_eq!(payload.bytes().unwrap().as_ref(), b"body");
        assert_eq!(payload.metadata.content_type.as_deref(), Some("image/webp"));
        assert!(cache.fetch(&key(2), &ct).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_existing_entry_wins() {
        let cache = cache(10, 4096);
        let ct = CancellationToken::new();
        cache
            .store(&key(1), Bytes::from_static(b"original"), &EntryMetadata::default(), &ct)
            .await
            .unwrap();
        cache
            .store(&key(1), Bytes::from_static(b"replacement"), &EntryMetadata::default(), &ct)
            .await
            .unwrap();

        let payload = cache.fetch(&key(1), &ct).await.unwrap().unwrap();
        assert_eq!(payload.bytes().unwrap().as_ref(), b"original");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_by_entry_count() {
        let cache = cache(2, 4096);
        let ct = CancellationToken::new();
        for n in 1..=3 {
            cache
                .store(&key(n), Bytes::from_static(b"x"), &EntryMetadata::default(), &ct)
                .await
                .unwrap();
        }
        assert!(cache.fetch(&key(1), &ct).await.unwrap().is_none());
        assert!(cache.fetch(&key(2), &ct).await.unwrap().is_some());
        assert!(cache.fetch(&key(3), &ct).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fetch_refreshes_recency() {
        let cache = cache(2, 4096);
        let ct = CancellationToken::new();
        cache
            .store(&key(1), Bytes::from_static(b"a"), &EntryMetadata::default(), &ct)
            .await
            .unwrap();
        cache
            .store(&key(2), Bytes::from_static(b"b"), &EntryMetadata::default(), &ct)
            .await
            .unwrap();

        // Touch key 1 so key 2 becomes the LRU victim.
        cache.fetch(&key(1), &ct).await.unwrap();
        cache
            .store(&key(3), Bytes::from_static(b"c"), &EntryMetadata::default(), &ct)
            .await
            .unwrap();

        assert!(cache.fetch(&key(1), &ct).await.unwrap().is_some());
        assert!(cache.fetch(&key(2), &ct).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_byte_budget_eviction() {
        let cache = cache(100, 10);
        let ct = CancellationToken::new();
        cache
            .store(&key(1), Bytes::from(vec![0u8; 6]), &EntryMetadata::default(), &ct)
            .await
            .unwrap();
        cache
            .store(&key(2), Bytes::from(vec![0u8; 6]), &EntryMetadata::default(), &ct)
            .await
            .unwrap();

        assert!(cache.fetch(&key(1), &ct).await.unwrap().is_none());
        assert!(cache.total_bytes().await <= 10);
    }

    #[tokio::test]
    async fn test_oversized_entry_not_admitted() {
        let cache = cache(10, 1_000_000);
        let ct = CancellationToken::new();
        cache
            .store(&key(1), Bytes::from(vec![0u8; 2048]), &EntryMetadata::default(), &ct)
            .await
            .unwrap();
        assert!(cache.is_empty().await);
        assert!(!cache.wants_store(&key(1), 2048, StoreReason::FreshlyCreated));
    }

    #[tokio::test]
    async fn test_purge_by_source() {
        let cache = cache(10, 4096);
        let ct = CancellationToken::new();
        let a = CacheKey::from_strings("shared-source", "v1");
        let b = CacheKey::from_strings("shared-source", "v2");
        let c = CacheKey::from_strings("other-source", "v1");
        for k in [&a, &b, &c] {
            cache
                .store(k, Bytes::from_static(b"x"), &EntryMetadata::default(), &ct)
                .await
                .unwrap();
        }

        let removed = cache.purge_source(&a.source_prefix(), &ct).await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.fetch(&a, &ct).await.unwrap().is_none());
        assert!(cache.fetch(&b, &ct).await.unwrap().is_none());
        assert!(cache.fetch(&c, &ct).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_reasons() {
        let cache = cache(10, 4096);
        assert!(cache.wants_store(&key(1), 10, StoreReason::FreshlyCreated));
        assert!(cache.wants_store(&key(1), 10, StoreReason::Missed));
        assert!(!cache.wants_store(&key(1), 10, StoreReason::NotQueried));
    }
}
