//! Cascade of cache tiers behind one get-or-create entry point
//!
//! Tiers are consulted in registration order. Remote tiers are only
//! consulted when the bloom filter says the artifact was stored there;
//! a negative answer is treated as a positively known miss. On a hit,
//! tiers that opted in receive a replica — inline when their capabilities
//! demand it, through the upload queue otherwise. On a total miss the
//! factory runs inside the per-key coalescer, so concurrent demand for
//! the same artifact produces one expensive computation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bloom::RotatingBloomFilter;
use crate::coalesce::{CoalesceOutcome, RequestCoalescer};
use crate::config::{BloomConfig, CascadeConfig, UploadQueueConfig};
use crate::error::{CacheError, CacheOpResult};
use crate::key::CacheKey;
use crate::provider::{CacheProvider, LatencyZone, StoreReason};
use crate::result::{
    CacheEvent, CacheEventKind, CascadeOutcome, CascadeStatus, EntryMetadata, EventSink,
    FetchBody, FetchPayload,
};
use crate::upload::{EnqueueOutcome, UploadQueue};

/// Reserved name of the bloom checkpoint blob (under `__meta/`)
pub const BLOOM_CHECKPOINT_NAME: &str = "bloom/v1";

fn bloom_key(hex: &str, provider: &str) -> String {
    format!("{hex}:{provider}")
}

fn status_for_zone(zone: LatencyZone) -> CascadeStatus {
    match zone {
        LatencyZone::Memory => CascadeStatus::MemoryHit,
        LatencyZone::Disk => CascadeStatus::DiskHit,
        LatencyZone::Cloud => CascadeStatus::CloudHit,
    }
}

enum CoalescedResult {
    Created(Bytes, EntryMetadata),
    QueueHit(Bytes, EntryMetadata),
    TierHit(String, LatencyZone, FetchPayload),
    FactoryEmpty,
}

/// Builder for a [`Cascade`]
pub struct CascadeBuilder {
    config: CascadeConfig,
    bloom_config: BloomConfig,
    upload_config: UploadQueueConfig,
    providers: Vec<Arc<dyn CacheProvider>>,
    events: Option<EventSink>,
}

impl CascadeBuilder {
    /// Builder with default component configs.
    pub fn new() -> Self {
        Self {
            config: CascadeConfig::default(),
            bloom_config: BloomConfig::default(),
            upload_config: UploadQueueConfig::default(),
            providers: Vec::new(),
            events: None,
        }
    }

    /// Override the cascade config.
    pub fn config(mut self, config: CascadeConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the bloom filter shape.
    pub fn bloom(mut self, config: BloomConfig) -> Self {
        self.bloom_config = config;
        self
    }

    /// Override the upload queue budget.
    pub fn upload_queue(mut self, config: UploadQueueConfig) -> Self {
        self.upload_config = config;
        self
    }

    /// Receive hit/miss/store/error events.
    pub fn events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// Append a tier. Tier order is consultation order; a duplicate name
    /// is refused loudly.
    pub fn register(mut self, provider: Arc<dyn CacheProvider>) -> CacheOpResult<Self> {
        if self.providers.iter().any(|p| p.name() == provider.name()) {
            return Err(CacheError::ProviderNameTaken(provider.name().to_string()));
        }
        self.providers.push(provider);
        Ok(self)
    }

    /// Build the cascade.
    pub fn build(self) -> CacheOpResult<Cascade> {
        Ok(Cascade {
            bloom: RotatingBloomFilter::new(&self.bloom_config)?,
            upload: UploadQueue::new(self.upload_config),
            coalescer: RequestCoalescer::new(),
            providers: self.providers,
            events: self.events,
            config: self.config,
        })
    }
}

impl Default for CascadeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered composition of cache tiers
pub struct Cascade {
    providers: Vec<Arc<dyn CacheProvider>>,
    bloom: RotatingBloomFilter,
    upload: UploadQueue,
    coalescer: RequestCoalescer,
    events: Option<EventSink>,
    config: CascadeConfig,
}

impl Cascade {
    /// Start building a cascade.
    pub fn builder() -> CascadeBuilder {
        CascadeBuilder::new()
    }

    /// Registered tier names, in consultation order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// The upload queue, for diagnostics and draining in hosts.
    pub fn upload_queue(&self) -> &UploadQueue {
        &self.upload
    }

    /// The gating bloom filter.
    pub fn bloom(&self) -> &RotatingBloomFilter {
        &self.bloom
    }

    /// Advance the bloom filter's aging window. Cadence is owner-driven.
    pub fn rotate_bloom(&self) {
        self.bloom.rotate();
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }

    fn emit_kind(
        &self,
        kind: CacheEventKind,
        provider: Option<&str>,
        hex: &str,
        latency: Option<Duration>,
        size_bytes: Option<u64>,
    ) {
        self.emit(CacheEvent {
            kind,
            provider: provider.map(String::from),
            key: hex.to_string(),
            latency,
            size_bytes,
        });
    }

    /// Serve the key from the fastest tier that has it, or compute it
    /// exactly once under concurrent demand and replicate it to the tiers
    /// that want it.
    ///
    /// The factory returns the artifact bytes and metadata, or `None` when
    /// the artifact cannot be produced (mapped to an `Error` outcome).
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &CacheKey,
        factory: F,
        ct: &CancellationToken,
    ) -> CacheOpResult<CascadeOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CacheOpResult<Option<(Bytes, EntryMetadata)>>>,
    {
        let hex = key.hex_key();
        let started = Instant::now();

        // Scan tiers in order. `known_missing[i]` means tier i's absence
        // is established, by a miss or by the bloom filter.
        let mut known_missing = vec![false; self.providers.len()];
        let mut hit: Option<(usize, FetchPayload)> = None;
        for (i, provider) in self.providers.iter().enumerate() {
            if ct.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let caps = provider.capabilities();
            if !caps.is_local && !self.bloom.probably_contains(&bloom_key(&hex, provider.name())) {
                known_missing[i] = true;
                continue;
            }
            match provider.fetch(key, ct).await {
                Ok(Some(payload)) => {
                    hit = Some((i, payload));
                    break;
                }
                Ok(None) => known_missing[i] = true,
                Err(err) => {
                    warn!(provider = provider.name(), key = %hex, %err, "tier fetch failed");
                    known_missing[i] = true;
                }
            }
        }

        if let Some((hit_idx, payload)) = hit {
            return self
                .serve_hit(key, &hex, hit_idx, payload, &known_missing, started, ct)
                .await;
        }

        self.emit_kind(
            CacheEventKind::Miss,
            None,
            &hex,
            Some(started.elapsed()),
            None,
        );
        self.create_coalesced(key, &hex, factory, started, ct).await
    }

    async fn serve_hit(
        &self,
        key: &CacheKey,
        hex: &str,
        hit_idx: usize,
        payload: FetchPayload,
        known_missing: &[bool],
        started: Instant,
        ct: &CancellationToken,
    ) -> CacheOpResult<CascadeOutcome> {
        let provider = &self.providers[hit_idx];
        let status = status_for_zone(provider.capabilities().latency_zone);
        let size_hint = payload
            .bytes()
            .map(|b| b.len() as u64)
            .or(payload.metadata.content_length);

        let mut subscribers = Vec::new();
        for (j, candidate) in self.providers.iter().enumerate() {
            if j == hit_idx {
                continue;
            }
            let reason = if known_missing[j] {
                StoreReason::Missed
            } else {
                StoreReason::NotQueried
            };
            if candidate.wants_store(key, size_hint.unwrap_or(0), reason) {
                subscribers.push(j);
            }
        }

        // A stream-shaped hit is buffered only when someone wants a
        // replica; otherwise it passes through untouched.
        let (body, metadata) = if subscribers.is_empty() {
            (payload.body, payload.metadata)
        } else {
            let (bytes, metadata) = payload.into_bytes().await?;
            self.replicate(key, hex, &subscribers, bytes.clone(), &metadata, ct)
                .await;
            (FetchBody::Bytes(bytes), metadata)
        };

        let latency = started.elapsed();
        self.emit_kind(
            CacheEventKind::Hit,
            Some(self.providers[hit_idx].name()),
            hex,
            Some(latency),
            size_hint,
        );

        Ok(CascadeOutcome {
            status,
            provider: Some(self.providers[hit_idx].name().to_string()),
            content_type: metadata.content_type.clone(),
            latency: Some(latency),
            body: Some(body),
            error_detail: None,
        })
    }

    /// Issue a store to one tier, inline or through the upload queue.
    async fn store_to(
        &self,
        idx: usize,
        key: &CacheKey,
        hex: &str,
        bytes: Bytes,
        metadata: &EntryMetadata,
        reason_is_fresh: bool,
        ct: &CancellationToken,
    ) {
        let provider = &self.providers[idx];
        let caps = provider.capabilities();
        let size = bytes.len() as u64;

        if caps.requires_inline_execution {
            if let Err(err) = provider.store(key, bytes, metadata, ct).await {
                warn!(provider = provider.name(), key = %hex, %err, "inline store failed");
                return;
            }
        } else {
            let target = provider.clone();
            let outcome = self.upload.try_enqueue(
                *key,
                bytes,
                metadata.clone(),
                move |key, bytes, metadata, ct| {
                    let target = target.clone();
                    async move { target.store(&key, bytes, &metadata, &ct).await }
                },
            );
            match outcome {
                EnqueueOutcome::Enqueued => {}
                EnqueueOutcome::AlreadyPresent => return,
                EnqueueOutcome::QueueFull | EnqueueOutcome::Stopped => {
                    debug!(
                        provider = provider.name(),
                        key = %hex,
                        ?outcome,
                        "replication dropped"
                    );
                    return;
                }
            }
        }

        // Remote tiers become eligible for future scans once a fresh
        // artifact heads their way.
        if reason_is_fresh && !caps.is_local {
            self.bloom.insert(&bloom_key(hex, provider.name()));
        }
        self.emit_kind(
            CacheEventKind::Store,
            Some(provider.name()),
            hex,
            None,
            Some(size),
        );
    }

    async fn replicate(
        &self,
        key: &CacheKey,
        hex: &str,
        subscribers: &[usize],
        bytes: Bytes,
        metadata: &EntryMetadata,
        ct: &CancellationToken,
    ) {
        for &idx in subscribers {
            self.store_to(idx, key, hex, bytes.clone(), metadata, false, ct)
                .await;
        }
    }

    async fn create_coalesced<F, Fut>(
        &self,
        key: &CacheKey,
        hex: &str,
        factory: F,
        started: Instant,
        ct: &CancellationToken,
    ) -> CacheOpResult<CascadeOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CacheOpResult<Option<(Bytes, EntryMetadata)>>>,
    {
        let timeout = Duration::from_millis(self.config.coalescing_timeout_ms);
        let coalesced = self
            .coalescer
            .try_execute(hex, timeout, ct, || async {
                // A store for this key may already be buffered: a waiter
                // whose artifact was just created by the previous holder
                // reads it straight out of the queue.
                if let Some((bytes, metadata)) = self.upload.get(key) {
                    return Ok(CoalescedResult::QueueHit(bytes, metadata));
                }
                // Fast-path recheck: the previous holder usually stored
                // into the first tier inline.
                if let Some(first) = self.providers.first() {
                    if first.capabilities().is_local {
                        if let Ok(Some(payload)) = first.fetch(key, ct).await {
                            return Ok(CoalescedResult::TierHit(
                                first.name().to_string(),
                                first.capabilities().latency_zone,
                                payload,
                            ));
                        }
                    }
                }

                match factory().await {
                    Ok(Some((bytes, metadata))) => {
                        self.store_created(key, hex, bytes.clone(), &metadata, ct)
                            .await;
                        Ok(CoalescedResult::Created(bytes, metadata))
                    }
                    Ok(None) => Ok(CoalescedResult::FactoryEmpty),
                    Err(err) => Err(err),
                }
            })
            .await;

        let latency = started.elapsed();
        match coalesced {
            Ok(CoalesceOutcome::Completed(CoalescedResult::Created(bytes, metadata))) => {
                Ok(CascadeOutcome {
                    status: CascadeStatus::Created,
                    provider: None,
                    content_type: metadata.content_type.clone(),
                    latency: Some(latency),
                    body: Some(FetchBody::Bytes(bytes)),
                    error_detail: None,
                })
            }
            Ok(CoalesceOutcome::Completed(CoalescedResult::QueueHit(bytes, metadata))) => {
                self.emit_kind(
                    CacheEventKind::Hit,
                    Some("upload-queue"),
                    hex,
                    Some(latency),
                    Some(bytes.len() as u64),
                );
                Ok(CascadeOutcome {
                    status: CascadeStatus::MemoryHit,
                    provider: Some("upload-queue".to_string()),
                    content_type: metadata.content_type.clone(),
                    latency: Some(latency),
                    body: Some(FetchBody::Bytes(bytes)),
                    error_detail: None,
                })
            }
            Ok(CoalesceOutcome::Completed(CoalescedResult::TierHit(name, zone, payload))) => {
                self.emit_kind(
                    CacheEventKind::Hit,
                    Some(name.as_str()),
                    hex,
                    Some(latency),
                    payload.bytes().map(|b| b.len() as u64),
                );
                Ok(CascadeOutcome {
                    status: status_for_zone(zone),
                    provider: Some(name),
                    content_type: payload.metadata.content_type.clone(),
                    latency: Some(latency),
                    body: Some(payload.body),
                    error_detail: None,
                })
            }
            Ok(CoalesceOutcome::Completed(CoalescedResult::FactoryEmpty)) => {
                self.emit_kind(CacheEventKind::Error, None, hex, Some(latency), None);
                Ok(CascadeOutcome::failed(
                    CascadeStatus::Error,
                    "factory produced no artifact",
                ))
            }
            Ok(CoalesceOutcome::TimedOut) => Ok(CascadeOutcome::failed(
                CascadeStatus::Timeout,
                "coalescing timeout",
            )),
            Ok(CoalesceOutcome::Cancelled) => Err(CacheError::Cancelled),
            Err(err) => {
                self.emit_kind(CacheEventKind::Error, None, hex, Some(latency), None);
                Err(err)
            }
        }
    }

    async fn store_created(
        &self,
        key: &CacheKey,
        hex: &str,
        bytes: Bytes,
        metadata: &EntryMetadata,
        ct: &CancellationToken,
    ) {
        let size = bytes.len() as u64;
        for idx in 0..self.providers.len() {
            if self.providers[idx].wants_store(key, size, StoreReason::FreshlyCreated) {
                self.store_to(idx, key, hex, bytes.clone(), metadata, true, ct)
                    .await;
            }
        }
    }

    /// Invalidate the key on every tier concurrently. No tier is
    /// authoritative; returns whether any tier held it.
    pub async fn invalidate(&self, key: &CacheKey, ct: &CancellationToken) -> CacheOpResult<bool> {
        let results = futures::future::join_all(
            self.providers
                .iter()
                .map(|p| async move { p.invalidate(key, ct).await }),
        )
        .await;

        let mut any = false;
        for (provider, result) in self.providers.iter().zip(results) {
            match result {
                Ok(removed) => any |= removed,
                Err(err) => {
                    warn!(provider = provider.name(), key = %key, %err, "invalidate failed")
                }
            }
        }
        Ok(any)
    }

    /// Purge every variant of a source across all tiers; returns the
    /// total number of entries removed.
    pub async fn purge_source(
        &self,
        source_prefix: &str,
        ct: &CancellationToken,
    ) -> CacheOpResult<u64> {
        let results = futures::future::join_all(
            self.providers
                .iter()
                .map(|p| async move { p.purge_source(source_prefix, ct).await }),
        )
        .await;

        let mut total = 0;
        for (provider, result) in self.providers.iter().zip(results) {
            match result {
                Ok(count) => total += count,
                Err(err) => {
                    warn!(provider = provider.name(), source = source_prefix, %err, "purge failed")
                }
            }
        }
        Ok(total)
    }

    /// Per-tier health, in consultation order.
    pub async fn health_report(&self, ct: &CancellationToken) -> Vec<(String, bool)> {
        let checks = futures::future::join_all(
            self.providers
                .iter()
                .map(|p| async move { (p.name().to_string(), p.health_check(ct).await) }),
        )
        .await;
        checks
    }

    /// Aggregate health: every tier must pass.
    pub async fn health_check(&self, ct: &CancellationToken) -> bool {
        self.health_report(ct).await.iter().all(|(_, ok)| *ok)
    }

    fn meta_blob_provider(&self) -> CacheOpResult<&Arc<dyn CacheProvider>> {
        self.providers
            .iter()
            .rev()
            .find(|p| p.capabilities().is_local && p.supports_meta_blobs())
            .ok_or_else(|| {
                CacheError::Other("no local tier can hold the bloom checkpoint".into())
            })
    }

    /// Persist the bloom filter under its reserved meta key.
    pub async fn checkpoint_bloom(&self, ct: &CancellationToken) -> CacheOpResult<()> {
        let provider = self.meta_blob_provider()?;
        let snapshot = Bytes::from(self.bloom.to_bytes());
        provider
            .write_meta_blob(BLOOM_CHECKPOINT_NAME, snapshot, ct)
            .await
    }

    /// Restore the bloom filter from its checkpoint. A missing or corrupt
    /// checkpoint leaves the filter empty; only the warm-up is lost.
    pub async fn load_bloom(&self, ct: &CancellationToken) -> CacheOpResult<()> {
        let provider = self.meta_blob_provider()?;
        let Some(snapshot) = provider.read_meta_blob(BLOOM_CHECKPOINT_NAME, ct).await? else {
            return Ok(());
        };
        match self.bloom.load_from_bytes(&snapshot) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%err, "bloom checkpoint rejected; starting empty");
                self.bloom.clear();
                Ok(())
            }
        }
    }

    /// OR a peer's bloom snapshot into the local filter.
    pub fn merge_bloom_from_peer(&self, snapshot: &[u8]) -> CacheOpResult<()> {
        self.bloom.merge_from_peer(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryCacheConfig;
    use crate::memory::MemoryCache;

    fn memory(name: &str) -> Arc<dyn CacheProvider> {
        Arc::new(MemoryCache::new(name, MemoryCacheConfig::default()))
    }

    #[test]
    fn test_duplicate_provider_name_is_refused() {
        let result = Cascade::builder()
            .register(memory("t1"))
            .unwrap()
            .register(memory("t1"));
        assert!(matches!(result, Err(CacheError::ProviderNameTaken(_))));
    }

    #[tokio::test]
    async fn test_created_then_hit() {
        let cascade = Cascade::builder()
            .register(memory("mem"))
            .unwrap()
            .build()
            .unwrap();
        let ct = CancellationToken::new();
        let key = CacheKey::from_strings("img", "w=10");

        let outcome = cascade
            .get_or_create(
                &key,
                || async {
                    Ok(Some((
                        Bytes::from_static(b"pixels"),
                        EntryMetadata::with_content_type("image/jpeg"),
                    )))
                },
                &ct,
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, CascadeStatus::Created);

        let outcome = cascade
            .get_or_create(
                &key,
                || async { Err(CacheError::Other("factory must not run".into())) },
                &ct,
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, CascadeStatus::MemoryHit);
        assert_eq!(outcome.provider.as_deref(), Some("mem"));
        match outcome.body {
            Some(FetchBody::Bytes(b)) => assert_eq!(&b[..], b"pixels"),
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_factory_returning_none_is_an_error_outcome() {
        let cascade = Cascade::builder()
            .register(memory("mem"))
            .unwrap()
            .build()
            .unwrap();
        let ct = CancellationToken::new();
        let key = CacheKey::from_strings("img", "w=20");

        let outcome = cascade
            .get_or_create(&key, || async { Ok(None) }, &ct)
            .await
            .unwrap();
        assert_eq!(outcome.status, CascadeStatus::Error);
        assert!(outcome.error_detail.is_some());
    }

    #[tokio::test]
    async fn test_factory_error_propagates() {
        let cascade = Cascade::builder()
            .register(memory("mem"))
            .unwrap()
            .build()
            .unwrap();
        let ct = CancellationToken::new();
        let key = CacheKey::from_strings("img", "w=30");

        let result = cascade
            .get_or_create(
                &key,
                || async { Err(CacheError::FactoryFailed("decode".into())) },
                &ct,
            )
            .await;
        assert!(matches!(result, Err(CacheError::FactoryFailed(_))));
    }

    #[tokio::test]
    async fn test_events_fire_for_miss_and_hit() {
        use parking_lot::Mutex;
        let seen: Arc<Mutex<Vec<CacheEventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let cascade = Cascade::builder()
            .register(memory("mem"))
            .unwrap()
            .events(Arc::new(move |event: CacheEvent| {
                sink.lock().push(event.kind);
            }))
            .build()
            .unwrap();
        let ct = CancellationToken::new();
        let key = CacheKey::from_strings("img", "w=40");

        cascade
            .get_or_create(
                &key,
                || async { Ok(Some((Bytes::from_static(b"x"), EntryMetadata::default()))) },
                &ct,
            )
            .await
            .unwrap();
        cascade
            .get_or_create(&key, || async { Ok(None) }, &ct)
            .await
            .unwrap();

        let kinds = seen.lock().clone();
        assert!(kinds.contains(&CacheEventKind::Miss));
        assert!(kinds.contains(&CacheEventKind::Store));
        assert!(kinds.contains(&CacheEventKind::Hit));
    }

    #[tokio::test]
    async fn test_checkpoint_requires_a_meta_capable_tier() {
        let cascade = Cascade::builder()
            .register(memory("mem"))
            .unwrap()
            .build()
            .unwrap();
        let ct = CancellationToken::new();
        assert!(cascade.checkpoint_bloom(&ct).await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_hits_every_tier() {
        let cascade = Cascade::builder()
            .register(memory("m1"))
            .unwrap()
            .register(memory("m2"))
            .unwrap()
            .build()
            .unwrap();
        let ct = CancellationToken::new();
        let key = CacheKey::from_strings("img", "w=50");

        cascade
            .get_or_create(
                &key,
                || async { Ok(Some((Bytes::from_static(b"x"), EntryMetadata::default()))) },
                &ct,
            )
            .await
            .unwrap();

        assert!(cascade.invalidate(&key, &ct).await.unwrap());
        assert!(!cascade.invalidate(&key, &ct).await.unwrap());
    }
}
