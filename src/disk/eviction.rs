//! Space reservation and least-frequently-used eviction
//!
//! A reservation either fits under the byte budget or triggers the
//! eviction loop. Victims are picked least-used first (ties broken oldest
//! first) from entries past the grace period; each batch frees at least
//! the configured minimum so a stream of small reservations does not
//! thrash the candidate scan. Candidate order matters: evicting hot
//! entries first destroys the cache's value under skewed traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::disk::counter::BucketCounter;
use crate::disk::entry::{now_millis, DiskEntry};
use crate::disk::keylock::KeyLockMap;
use crate::disk::layout::PathLayout;
use crate::disk::shard::{shard_of, MetaShard};
use crate::error::{CacheError, CacheOpResult};

/// Tunables for the eviction loop
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Entries younger than this are never victims
    pub min_age: Duration,
    /// Backoff before retrying a failed file delete
    pub retry_deletion_after: Duration,
    /// Minimum bytes each eviction batch frees
    pub min_cleanup_bytes: u64,
    /// Per-key lock budget while deleting a victim
    pub lock_timeout: Duration,
}

/// Owns the byte budget across shards and frees space on demand
pub struct SpaceGovernor {
    shards: Arc<Vec<MetaShard>>,
    counter: Arc<BucketCounter>,
    locks: Arc<KeyLockMap>,
    layout: PathLayout,
    max_bytes: u64,
    policy: EvictionPolicy,
}

impl SpaceGovernor {
    /// Governor over the given shards and budget.
    pub fn new(
        shards: Arc<Vec<MetaShard>>,
        counter: Arc<BucketCounter>,
        locks: Arc<KeyLockMap>,
        layout: PathLayout,
        max_bytes: u64,
        policy: EvictionPolicy,
    ) -> Self {
        Self {
            shards,
            counter,
            locks,
            layout,
            max_bytes,
            policy,
        }
    }

    /// Bytes accounted across every shard.
    pub fn total_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.current_bytes()).sum()
    }

    /// Configured byte budget.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn shard_for(&self, entry: &DiskEntry) -> &MetaShard {
        &self.shards[shard_of(&entry.key, self.shards.len() as u32) as usize]
    }

    /// Reserve space for an entry, evicting if allowed and necessary.
    ///
    /// On success the entry's record is upserted with its reservation
    /// sentinel; `mark_file_created` commits it later. Returns `false`
    /// when the space could not be found (the store is simply dropped —
    /// it is a cache).
    pub async fn try_reserve(
        &self,
        entry: DiskEntry,
        allow_eviction: bool,
        ct: &CancellationToken,
    ) -> CacheOpResult<bool> {
        let size = entry.est_disk_size;
        if size > self.max_bytes {
            return Ok(false);
        }

        loop {
            let total = self.total_bytes();
            if total + size <= self.max_bytes {
                self.shard_for(&entry).upsert(entry).await?;
                return Ok(true);
            }
            if !allow_eviction {
                return Ok(false);
            }

            let needed = total + size - self.max_bytes;
            let freed = self.evict_batch(needed, ct).await?;
            if freed == 0 {
                debug!(needed, "eviction could not free space, dropping store");
                return Ok(false);
            }
        }
    }

    /// Evict until the accounted total drops to `target_total`, for the
    /// background cleanup pass.
    pub async fn evict_to(&self, target_total: u64, ct: &CancellationToken) -> CacheOpResult<u64> {
        let mut freed_total = 0;
        while self.total_bytes() > target_total {
            let needed = self.total_bytes() - target_total;
            let freed = self.evict_batch(needed, ct).await?;
            if freed == 0 {
                break;
            }
            freed_total += freed;
        }
        Ok(freed_total)
    }

    /// One eviction batch: frees at least `max(needed, min_cleanup_bytes)`
    /// when candidates allow. Returns the bytes actually freed.
    async fn evict_batch(&self, needed: u64, ct: &CancellationToken) -> CacheOpResult<u64> {
        let goal = needed.max(self.policy.min_cleanup_bytes);
        let mut candidates = self.collect_candidates().await;
        sort_candidates(&mut candidates);

        let mut freed = 0u64;
        for (entry, _count) in candidates {
            if ct.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            if freed >= goal {
                break;
            }
            if self.evict_one(&entry, ct).await {
                freed += entry.est_disk_size;
            }
        }
        Ok(freed)
    }

    async fn collect_candidates(&self) -> Vec<(DiskEntry, u16)> {
        let now = now_millis();
        let min_age_millis = self.policy.min_age.as_millis() as u64;
        let mut candidates = Vec::new();
        for shard in self.shards.iter() {
            for entry in shard.snapshot().await {
                // A reservation sentinel sits in the future: never a victim.
                if !entry.is_committed() {
                    continue;
                }
                if now.saturating_sub(entry.created_at) < min_age_millis {
                    continue;
                }
                if !entry.deletion_retry_due(self.policy.retry_deletion_after) {
                    continue;
                }
                let count = self.counter.get(entry.access_count_key);
                candidates.push((entry, count));
            }
        }
        candidates
    }

    async fn evict_one(&self, entry: &DiskEntry, ct: &CancellationToken) -> bool {
        let Some(_guard) = self
            .locks
            .acquire(entry.key, self.policy.lock_timeout, ct)
            .await
        else {
            return false;
        };

        let shard = self.shard_for(entry);
        // The candidate snapshot may be stale; confirm the record.
        if shard.get(&entry.key).await.is_none() {
            return false;
        }

        let path = self.layout.resolve(&entry.relative_path);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(key = %entry.key, %err, "victim file delete failed");
                shard.mark_deletion_attempt(&entry.key).await;
                return false;
            }
        }

        match shard.remove(&entry.key).await {
            Ok(removed) => removed.is_some(),
            Err(err) => {
                warn!(key = %entry.key, %err, "victim record removal failed");
                false
            }
        }
    }
}

/// Ascending access count, ties broken by ascending creation time: the
/// least-used, oldest entries leave first.
pub fn sort_candidates(candidates: &mut [(DiskEntry, u16)]) {
    candidates.sort_by(|(a, count_a), (b, count_b)| {
        count_a.cmp(count_b).then(a.created_at.cmp(&b.created_at))
    });
}
