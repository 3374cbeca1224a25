//! Uniform contract every cache tier implements
//!
//! The cascade only ever talks to tiers through this trait. Capabilities
//! are static per provider: a tier that is unhealthy stays registered with
//! the same capabilities and simply misses.

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::CacheOpResult;
use crate::key::CacheKey;
use crate::result::{EntryMetadata, FetchPayload};

/// Rough latency class of a tier, used to tag cascade outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyZone {
    /// Sub-microsecond, process-local
    Memory,
    /// Local filesystem
    Disk,
    /// Remote object storage
    Cloud,
}

/// Static capability set of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// The cascade must complete this tier's store before returning a
    /// freshly created artifact to the caller
    pub requires_inline_execution: bool,
    /// Latency class, mapped onto hit statuses
    pub latency_zone: LatencyZone,
    /// Local tiers are always consulted; remote tiers are gated through
    /// the bloom filter
    pub is_local: bool,
}

/// Why the cascade is offering a store to a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreReason {
    /// The artifact was just produced by the factory
    FreshlyCreated,
    /// The tier was consulted (or positively known absent) and missed
    Missed,
    /// The tier sits after the hit tier and was never consulted
    NotQueried,
}

/// One named cache tier
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Unique tier name; duplicate registrations are rejected.
    fn name(&self) -> &str;

    /// Static capability set.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Look the key up; `None` is a miss.
    async fn fetch(
        &self,
        key: &CacheKey,
        ct: &CancellationToken,
    ) -> CacheOpResult<Option<FetchPayload>>;

    /// Persist the artifact under the key.
    async fn store(
        &self,
        key: &CacheKey,
        bytes: Bytes,
        metadata: &EntryMetadata,
        ct: &CancellationToken,
    ) -> CacheOpResult<()>;

    /// Remove the key; `true` when an entry existed.
    async fn invalidate(&self, key: &CacheKey, ct: &CancellationToken) -> CacheOpResult<bool>;

    /// Remove every entry sharing the 32-hex source prefix; returns the
    /// count removed.
    async fn purge_source(
        &self,
        source_prefix: &str,
        ct: &CancellationToken,
    ) -> CacheOpResult<u64>;

    /// Whether this tier wants a replica of the artifact.
    fn wants_store(&self, key: &CacheKey, size_bytes: u64, reason: StoreReason) -> bool;

    /// Cheap membership hint. Local tiers usually answer `true`; remote
    /// tiers are answered by the cascade's bloom filter instead.
    fn probably_contains(&self, key: &CacheKey) -> bool;

    /// Whether the tier's backing store is currently reachable.
    async fn health_check(&self, ct: &CancellationToken) -> bool;

    /// Whether this tier can hold arbitrary blobs under reserved meta
    /// names (outside the content-addressed namespace).
    fn supports_meta_blobs(&self) -> bool {
        false
    }

    /// Persist a blob under a reserved meta name, e.g. `bloom/v1`.
    async fn write_meta_blob(
        &self,
        name: &str,
        bytes: Bytes,
        ct: &CancellationToken,
    ) -> CacheOpResult<()> {
        let _ = (name, bytes, ct);
        Err(crate::error::CacheError::Other(format!(
            "provider {} does not hold meta blobs",
            self.name()
        )))
    }

    /// Read a blob previously written under a reserved meta name.
    async fn read_meta_blob(
        &self,
        name: &str,
        ct: &CancellationToken,
    ) -> CacheOpResult<Option<Bytes>> {
        let _ = (name, ct);
        Ok(None)
    }
}
