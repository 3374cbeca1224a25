//! Bounded dedup queue of pending asynchronous stores
//!
//! Each admitted entry buffers the artifact bytes, spawns a background
//! store, and is removed (bytes reclaimed) when the store completes or
//! terminally fails. While an entry is in flight its bytes remain readable,
//! so a just-created artifact that is requested again can be served from
//! the queue instead of missing every tier.
//!
//! Admission is rejected for a key already present and for entries that
//! would push the buffered total past the byte budget. There is no global
//! ordering across keys; per key there is at most one in-flight store.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::UploadQueueConfig;
use crate::error::CacheOpResult;
use crate::key::CacheKey;
use crate::result::EntryMetadata;

/// Bounded store retries for transient failures
const MAX_STORE_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Outcome of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Admitted; a background store was spawned
    Enqueued,
    /// The key already has an in-flight store
    AlreadyPresent,
    /// Admitting the entry would exceed the byte budget
    QueueFull,
    /// The queue has been shut down
    Stopped,
}

#[derive(Clone)]
struct QueuedEntry {
    bytes: Bytes,
    metadata: EntryMetadata,
}

struct QueueShared {
    entries: DashMap<CacheKey, QueuedEntry>,
    queued_bytes: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl QueueShared {
    fn finish_entry(&self, key: &CacheKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.queued_bytes
                .fetch_sub(entry.bytes.len() as u64, Ordering::SeqCst);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

/// Dedup queue of pending async stores with read-through
pub struct UploadQueue {
    shared: Arc<QueueShared>,
    config: UploadQueueConfig,
    shutdown: CancellationToken,
}

impl UploadQueue {
    /// Queue with the given byte budget.
    pub fn new(config: UploadQueueConfig) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                entries: DashMap::new(),
                queued_bytes: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    /// Whether no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Bytes currently buffered across pending entries.
    pub fn queued_bytes(&self) -> u64 {
        self.shared.queued_bytes.load(Ordering::SeqCst)
    }

    /// Read-through: the buffered artifact for an in-flight key.
    pub fn get(&self, key: &CacheKey) -> Option<(Bytes, EntryMetadata)> {
        self.shared
            .entries
            .get(key)
            .map(|entry| (entry.bytes.clone(), entry.metadata.clone()))
    }

    /// Admit an entry and spawn its background store.
    ///
    /// `store_fn` is invoked with the buffered bytes; transient failures
    /// are retried a bounded number of times, then the entry is dropped
    /// with a warning. Either way the entry is removed and its bytes
    /// reclaimed.
    pub fn try_enqueue<F, Fut>(
        &self,
        key: CacheKey,
        bytes: Bytes,
        metadata: EntryMetadata,
        store_fn: F,
    ) -> EnqueueOutcome
    where
        F: Fn(CacheKey, Bytes, EntryMetadata, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheOpResult<()>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return EnqueueOutcome::Stopped;
        }

        let size = bytes.len() as u64;
        let admitted = match self.shared.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => return EnqueueOutcome::AlreadyPresent,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                if !self.try_reserve_bytes(size) {
                    return EnqueueOutcome::QueueFull;
                }
                vacant.insert(QueuedEntry {
                    bytes: bytes.clone(),
                    metadata: metadata.clone(),
                });
                true
            }
        };
        debug_assert!(admitted);

        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let shared = self.shared.clone();
        let ct = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut attempt = 1;
            loop {
                match store_fn(key, bytes.clone(), metadata.clone(), ct.clone()).await {
                    Ok(()) => {
                        debug!(key = %key, attempt, "queued store completed");
                        break;
                    }
                    Err(err) if attempt < MAX_STORE_ATTEMPTS && !ct.is_cancelled() => {
                        debug!(key = %key, attempt, %err, "queued store failed, retrying");
                        attempt += 1;
                        tokio::select! {
                            _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                            _ = ct.cancelled() => {
                                warn!(key = %key, "queued store cancelled during backoff");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(key = %key, attempt, %err, "queued store dropped");
                        break;
                    }
                }
            }
            shared.finish_entry(&key);
        });

        EnqueueOutcome::Enqueued
    }

    fn try_reserve_bytes(&self, size: u64) -> bool {
        let mut current = self.shared.queued_bytes.load(Ordering::SeqCst);
        loop {
            if current + size > self.config.max_bytes {
                return false;
            }
            match self.shared.queued_bytes.compare_exchange(
                current,
                current + size,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Wait until every pending store has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancel in-flight stores best-effort and wait briefly for them to
    /// settle.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if tokio::time::timeout(grace, self.drain()).await.is_err() {
            warn!(
                pending = self.len(),
                "upload queue shutdown grace elapsed with stores in flight"
            );
        }
    }
}
