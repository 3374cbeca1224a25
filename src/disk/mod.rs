//! Tiered disk cache engine
//!
//! Content-addressed files under a hashed directory layout, with per-shard
//! metadata logs as ground truth, byte-budget reservation with LFU
//! eviction, and a background maintenance pass that trims to the soft
//! watermark and runs self-tests. Fetches stream straight off the file;
//! nothing on the read path holds a lock across file I/O.

pub mod counter;
pub mod entry;
pub mod eviction;
pub mod keylock;
pub mod layout;
pub mod shard;
pub mod wal;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DiskCacheConfig, RunnerConfig};
use crate::error::{CacheError, CacheOpResult};
use crate::key::CacheKey;
use crate::provider::{CacheProvider, LatencyZone, ProviderCapabilities, StoreReason};
use crate::result::{EntryMetadata, FetchPayload};
use crate::runner::NonOverlappingRunner;

use counter::BucketCounter;
use entry::{now_millis, DiskEntry};
use eviction::{EvictionPolicy, SpaceGovernor};
use keylock::KeyLockMap;
use layout::PathLayout;
use shard::{shard_of, MetaShard};
use writer::{write_file, WriteFileOutcome};

/// Name of the root-directory health probe under `__meta`
const HEALTH_PROBE: &str = "health/probe";

/// Disk-backed cache tier
pub struct DiskCache {
    // Debug is implemented manually below since `NonOverlappingRunner`
    // holds a non-Debug task factory.

    name: String,
    config: DiskCacheConfig,
    layout: PathLayout,
    shards: Arc<Vec<MetaShard>>,
    counter: Arc<BucketCounter>,
    locks: Arc<KeyLockMap>,
    governor: Arc<SpaceGovernor>,
    health: Arc<NonOverlappingRunner<bool>>,
    maintenance: Arc<NonOverlappingRunner<()>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache").field("name", &self.name).finish()
    }
}

impl DiskCache {
    /// Mount the engine: lock and replay every shard, then start the
    /// periodic maintenance pass. Fails fast when another process holds
    /// the directory.
    pub fn mount(name: impl Into<String>, config: DiskCacheConfig) -> CacheOpResult<Self> {
        config.validate()?;
        let name = name.into();
        std::fs::create_dir_all(&config.root)?;

        let layout = PathLayout::new(
            config.root.clone(),
            config.subfolders,
            config.file_extension.clone(),
        );
        let meta_dir = config.meta_dir();
        let mut shards = Vec::with_capacity(config.shards as usize);
        for id in 0..config.shards {
            shards.push(MetaShard::mount(id, &meta_dir)?);
        }
        let shards = Arc::new(shards);
        let counter = Arc::new(BucketCounter::new(config.access_counter_slots));
        let locks = Arc::new(KeyLockMap::new());

        let governor = Arc::new(SpaceGovernor::new(
            shards.clone(),
            counter.clone(),
            locks.clone(),
            layout.clone(),
            config.max_cache_bytes,
            EvictionPolicy {
                min_age: Duration::from_secs(config.min_age_to_delete_secs),
                retry_deletion_after: Duration::from_secs(config.retry_deletion_after_secs),
                min_cleanup_bytes: config.min_cleanup_bytes,
                lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            },
        ));

        let health = Arc::new(Self::health_runner(&name, layout.clone(), shards.clone()));
        let maintenance = Arc::new(Self::maintenance_runner(
            &name,
            governor.clone(),
            config.soft_watermark(),
            config.min_cleanup_bytes,
        ));
        let shutdown = CancellationToken::new();

        Self::spawn_periodic(
            maintenance.clone(),
            health.clone(),
            Duration::from_secs(config.cleanup_interval_secs),
            shutdown.clone(),
        );

        Ok(Self {
            name,
            config,
            layout,
            shards,
            counter,
            locks,
            governor,
            health,
            maintenance,
            shutdown,
        })
    }

    fn health_runner(
        name: &str,
        layout: PathLayout,
        shards: Arc<Vec<MetaShard>>,
    ) -> NonOverlappingRunner<bool> {
        NonOverlappingRunner::new(
            format!("{name}-health"),
            RunnerConfig {
                task_timeout_ms: 10_000,
                reuse_result_within_ms: 30_000,
            },
            move |_ct| {
                let layout = layout.clone();
                let shards = shards.clone();
                async move {
                    let root_ok = test_root_directory(&layout).await;
                    let meta_ok = test_meta_store(&shards).await;
                    if !root_ok || !meta_ok {
                        warn!(root_ok, meta_ok, "disk cache self-test failed");
                    }
                    Ok(root_ok && meta_ok)
                }
            },
        )
    }

    fn maintenance_runner(
        name: &str,
        governor: Arc<SpaceGovernor>,
        soft_watermark: u64,
        min_cleanup_bytes: u64,
    ) -> NonOverlappingRunner<()> {
        NonOverlappingRunner::new(
            format!("{name}-maintenance"),
            RunnerConfig {
                task_timeout_ms: 120_000,
                reuse_result_within_ms: 0,
            },
            move |ct| {
                let governor = governor.clone();
                async move {
                    let total = governor.total_bytes();
                    if total > soft_watermark {
                        let target = soft_watermark.saturating_sub(min_cleanup_bytes);
                        let freed = governor.evict_to(target, &ct).await?;
                        debug!(total, freed, "background cleanup pass");
                    }
                    Ok(())
                }
            },
        )
    }

    fn spawn_periodic(
        maintenance: Arc<NonOverlappingRunner<()>>,
        health: Arc<NonOverlappingRunner<bool>>,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        maintenance.fire_and_forget(None);
                        health.fire_and_forget(None);
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    fn shard_for(&self, key: &CacheKey) -> &MetaShard {
        &self.shards[shard_of(key, self.shards.len() as u32) as usize]
    }

    /// Bytes accounted across all shards.
    pub fn total_bytes(&self) -> u64 {
        self.governor.total_bytes()
    }

    /// Record an access for eviction ranking without fetching.
    pub fn notify_used(&self, key: &CacheKey) {
        self.counter.record(entry::access_count_key(key));
    }

    /// Stop the periodic pass and in-flight maintenance.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let ct = CancellationToken::new();
        let _ = self.maintenance.stop(&ct).await;
        let _ = self.health.stop(&ct).await;
    }

    async fn commit_record(&self, mut entry: DiskEntry) -> CacheOpResult<()> {
        entry.created_at = now_millis();
        self.shard_for(&entry.key).upsert(entry).await
    }

    fn schedule_orphan_delete(&self, key: &CacheKey) {
        let path = self.layout.physical_path(key);
        let hex = key.hex_key();
        tokio::spawn(async move {
            match fs::remove_file(&path).await {
                Ok(()) => debug!(key = %hex, "removed orphaned cache file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => debug!(key = %hex, %err, "orphaned file delete failed"),
            }
        });
    }
}

/// Write, read back and delete a probe file under the reserved meta
/// directory.
async fn test_root_directory(layout: &PathLayout) -> bool {
    let path = layout.meta_path(HEALTH_PROBE);
    let ct = CancellationToken::new();
    let outcome = write_file(&path, b"ok", false, &ct).await;
    if outcome != WriteFileOutcome::FileCreated {
        return false;
    }
    let readable = matches!(fs::read(&path).await.as_deref(), Ok(b"ok"));
    let _ = fs::remove_file(&path).await;
    readable
}

/// Round-trip a probe record through shard zero.
async fn test_meta_store(shards: &[MetaShard]) -> bool {
    let Some(shard) = shards.first() else {
        return false;
    };
    let key = CacheKey::from_strings("__meta/health", "meta-store-probe");
    let mut probe = DiskEntry::reserve(key, "__meta/health/meta-store-probe".into(), 0);
    probe.created_at = now_millis();

    if shard.upsert(probe).await.is_err() {
        return false;
    }
    let present = shard.get(&key).await.is_some();
    let removed = shard.remove(&key).await.is_ok();
    present && removed
}

#[async_trait]
impl CacheProvider for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            requires_inline_execution: false,
            latency_zone: LatencyZone::Disk,
            is_local: true,
        }
    }

    async fn fetch(
        &self,
        key: &CacheKey,
        _ct: &CancellationToken,
    ) -> CacheOpResult<Option<FetchPayload>> {
        let Some(record) = self.shard_for(key).get(key).await else {
            // A bare file without a record does not exist as far as the
            // engine is concerned; shed it so the layout stays clean.
            if fs::try_exists(self.layout.physical_path(key))
                .await
                .unwrap_or(false)
            {
                self.schedule_orphan_delete(key);
            }
            return Ok(None);
        };
        if !record.is_committed() {
            return Ok(None);
        }

        self.counter.record(record.access_count_key);

        let path = self.layout.resolve(&record.relative_path);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // The record outlived its file; drop it and miss.
                let _ = self.shard_for(key).remove(key).await;
                return Ok(None);
            }
            Err(err) => {
                debug!(key = %key, %err, "fetch treated I/O failure as miss");
                return Ok(None);
            }
        };

        let metadata = EntryMetadata {
            content_type: record.content_type.clone(),
            content_length: Some(record.est_disk_size),
        };
        Ok(Some(FetchPayload::from_stream(Box::new(file), metadata)))
    }

    async fn store(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        metadata: &EntryMetadata,
        ct: &CancellationToken,
    ) -> CacheOpResult<()> {
        let size = bytes.len() as u64;
        if let Some(limit) = self.config.max_entry_bytes {
            if size > limit {
                debug!(key = %key, size, limit, "entry exceeds disk size filter");
                return Ok(());
            }
        }

        let mut entry = DiskEntry::reserve(*key, self.layout.relative_path(key), size);
        entry.content_type = metadata.content_type.clone();

        if !self.governor.try_reserve(entry.clone(), true, ct).await? {
            // It's a cache: an unplaceable store is dropped, not an error.
            debug!(key = %key, size, "store dropped, no space");
            return Ok(());
        }

        let lock_timeout = Duration::from_millis(self.config.lock_timeout_ms);
        let Some(_guard) = self.locks.acquire(*key, lock_timeout, ct).await else {
            let _ = self.shard_for(key).remove(key).await;
            return Err(CacheError::LockTimeout(key.hex_key()));
        };

        let path = self.layout.resolve(&entry.relative_path);
        match write_file(&path, &bytes, true, ct).await {
            WriteFileOutcome::FileCreated | WriteFileOutcome::FileAlreadyExists => {
                self.commit_record(entry).await
            }
            WriteFileOutcome::FileWriteError | WriteFileOutcome::LockTimeout => {
                let _ = self.shard_for(key).remove(key).await;
                Err(CacheError::Other(format!(
                    "file write failed for {}",
                    key.hex_key()
                )))
            }
        }
    }

    async fn invalidate(&self, key: &CacheKey, ct: &CancellationToken) -> CacheOpResult<bool> {
        let lock_timeout = Duration::from_millis(self.config.lock_timeout_ms);
        let Some(_guard) = self.locks.acquire(*key, lock_timeout, ct).await else {
            return Err(CacheError::LockTimeout(key.hex_key()));
        };

        let shard = self.shard_for(key);
        let Some(record) = shard.get(key).await else {
            return Ok(false);
        };

        let path = self.layout.resolve(&record.relative_path);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                shard.mark_deletion_attempt(key).await;
                return Err(err.into());
            }
        }
        Ok(shard.remove(key).await?.is_some())
    }

    async fn purge_source(
        &self,
        source_prefix: &str,
        ct: &CancellationToken,
    ) -> CacheOpResult<u64> {
        let mut removed = 0;
        for shard in self.shards.iter() {
            for key in shard.keys_with_source(source_prefix).await {
                if ct.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                match self.invalidate(&key, ct).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(err) => warn!(key = %key, %err, "purge skipped entry"),
                }
            }
        }
        Ok(removed)
    }

    fn wants_store(&self, _key: &CacheKey, size_bytes: u64, reason: StoreReason) -> bool {
        if let Some(limit) = self.config.max_entry_bytes {
            if size_bytes > limit {
                return false;
            }
        }
        match reason {
            StoreReason::FreshlyCreated | StoreReason::Missed => true,
            // A tier that missed faster than us was scanned first; if the
            // scan never reached this tier the artifact is likely already
            // here.
            StoreReason::NotQueried => false,
        }
    }

    fn probably_contains(&self, _key: &CacheKey) -> bool {
        true
    }

    async fn health_check(&self, ct: &CancellationToken) -> bool {
        self.health
            .run(Duration::from_secs(5), ct)
            .await
            .unwrap_or(false)
    }

    fn supports_meta_blobs(&self) -> bool {
        true
    }

    async fn write_meta_blob(
        &self,
        name: &str,
        bytes: Bytes,
        ct: &CancellationToken,
    ) -> CacheOpResult<()> {
        let path = self.layout.meta_path(name);
        match write_file(&path, &bytes, false, ct).await {
            WriteFileOutcome::FileCreated => Ok(()),
            outcome => Err(CacheError::Other(format!(
                "meta blob write failed: {outcome:?}"
            ))),
        }
    }

    async fn read_meta_blob(
        &self,
        name: &str,
        _ct: &CancellationToken,
    ) -> CacheOpResult<Option<Bytes>> {
        match fs::read(self.layout.meta_path(name)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
