//! # Blobcascade - Multi-Tier Blob Cache
//!
//! A content-addressed caching core for image-serving pipelines: given a
//! request fingerprint, serve the artifact from the fastest tier that has
//! it, or compute it exactly once under concurrent demand and replicate
//! it to interested tiers asynchronously.
//!
//! ## Architecture
//!
//! - `key`: 32-byte content-addressed cache keys
//! - `bloom`: rotating bloom filter gating remote-tier lookups
//! - `upload`: bounded dedup queue of pending async stores
//! - `coalesce`: per-key serialization of factory invocations
//! - `provider`: the uniform tier contract
//! - `memory`: process-local LRU tier
//! - `disk`: tiered disk engine with sharded metadata and LFU eviction
//! - `cascade`: the ordered composition behind `get_or_create`
//! - `runner`: deduplicated background task execution

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core value types
pub mod config;
pub mod error;
pub mod key;
pub mod result;

// Building blocks
pub mod bloom;
pub mod coalesce;
pub mod runner;
pub mod upload;

// Tiers
pub mod disk;
pub mod memory;
pub mod provider;

// Orchestration
pub mod cascade;

// Re-export the types a host wires together
pub use cascade::{Cascade, CascadeBuilder};
pub use config::{
    BloomConfig, CascadeConfig, DiskCacheConfig, MemoryCacheConfig, RunnerConfig,
    UploadQueueConfig,
};
pub use error::{CacheError, CacheOpResult};
pub use key::CacheKey;
pub use provider::{CacheProvider, LatencyZone, ProviderCapabilities, StoreReason};
pub use result::{
    CacheEvent, CacheEventKind, CascadeOutcome, CascadeStatus, EntryMetadata, FetchBody,
    FetchPayload,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
