//! Per-key write locks
//!
//! Disk writes and evictions for the same key exclude each other through a
//! leased lock map: a slot exists only while someone holds or waits for
//! it, and the last lease out removes it. Acquisition is bounded by a
//! timeout and a cancellation token; the caller decides what a refused
//! lock means.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::key::CacheKey;

struct LockSlot {
    gate: Arc<Semaphore>,
    leases: AtomicUsize,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
            leases: AtomicUsize::new(0),
        }
    }
}

/// Map of per-key exclusive locks with leased lifetimes
pub struct KeyLockMap {
    slots: DashMap<CacheKey, Arc<LockSlot>>,
}

/// Held lock; releases the key on drop
pub struct KeyLockGuard<'a> {
    map: &'a KeyLockMap,
    key: CacheKey,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        // Free the gate before retiring the lease so a waiter can take
        // over the same slot.
        self.permit.take();
        self.map.release(&self.key);
    }
}

impl KeyLockMap {
    /// Empty lock map.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Keys currently locked or waited on. For tests and diagnostics.
    pub fn active_keys(&self) -> usize {
        self.slots.len()
    }

    fn lease(&self, key: CacheKey) -> Arc<LockSlot> {
        let entry = self.slots.entry(key).or_insert_with(|| Arc::new(LockSlot::new()));
        entry.leases.fetch_add(1, Ordering::SeqCst);
        entry.clone()
    }

    fn release(&self, key: &CacheKey) {
        self.slots
            .remove_if(key, |_, slot| slot.leases.fetch_sub(1, Ordering::SeqCst) == 1);
    }

    /// Acquire the key's exclusive lock, or give up on timeout or
    /// cancellation.
    pub async fn acquire(
        &self,
        key: CacheKey,
        timeout: Duration,
        ct: &CancellationToken,
    ) -> Option<KeyLockGuard<'_>> {
        let slot = self.lease(key);
        let mut guard = KeyLockGuard {
            map: self,
            key,
            permit: None,
        };

        let permit = tokio::select! {
            permit = slot.gate.clone().acquire_owned() => permit.ok()?,
            _ = tokio::time::sleep(timeout) => return None,
            _ = ct.cancelled() => return None,
        };
        guard.permit = Some(permit);
        Some(guard)
    }
}

impl Default for KeyLockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> CacheKey {
        CacheKey::from_raw([n; 32])
    }

    #[tokio::test]
    async fn test_lock_excludes_same_key() {
        let map = Arc::new(KeyLockMap::new());
        let ct = CancellationToken::new();

        let guard = map.acquire(key(1), Duration::from_secs(1), &ct).await;
        assert!(guard.is_some());

        let blocked = map.acquire(key(1), Duration::from_millis(30), &ct).await;
        assert!(blocked.is_none());

        drop(guard);
        let retry = map.acquire(key(1), Duration::from_secs(1), &ct).await;
        assert!(retry.is_some());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let map = KeyLockMap::new();
        let ct = CancellationToken::new();
        let _a = map.acquire(key(1), Duration::from_secs(1), &ct).await.unwrap();
        let b = map.acquire(key(2), Duration::from_millis(50), &ct).await;
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_slots_are_reclaimed() {
        let map = KeyLockMap::new();
        let ct = CancellationToken::new();
        {
            let _guard = map.acquire(key(1), Duration::from_secs(1), &ct).await.unwrap();
            assert_eq!(map.active_keys(), 1);
        }
        assert_eq!(map.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_refuses_lock() {
        let map = KeyLockMap::new();
        let ct = CancellationToken::new();
        let _held = map.acquire(key(1), Duration::from_secs(1), &ct).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let refused = map.acquire(key(1), Duration::from_secs(5), &cancelled).await;
        assert!(refused.is_none());
        assert_eq!(map.active_keys(), 1);
    }
}
