//! Per-key serialization of factory invocations
//!
//! The coalescer maps a string key to a mutual-exclusion primitive plus a
//! reference count. The first caller acquires the primitive and runs its
//! factory; concurrent callers wait on the same primitive up to their own
//! timeout. When a run finishes, one waiter acquires next and runs its own
//! factory — deduplication is of *concurrent* callers, not sequential ones,
//! so the caller's factory is expected to re-check faster sources before
//! doing expensive work.
//!
//! Slots are reference-counted: the entry is removed only when the last
//! leaseholder releases it, and both the lease and the release hold the map
//! shard lock, so a released slot can never be revived by a racing caller.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::CacheOpResult;

/// How a coalesced execution attempt ended
#[derive(Debug, PartialEq, Eq)]
pub enum CoalesceOutcome<T> {
    /// This caller acquired the key and ran its factory
    Completed(T),
    /// The caller's timeout elapsed while another run held the key
    TimedOut,
    /// The caller's token was cancelled while waiting
    Cancelled,
}

struct KeySlot {
    gate: Semaphore,
    leases: AtomicUsize,
}

impl KeySlot {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(1),
            leases: AtomicUsize::new(0),
        }
    }
}

struct LeaseGuard<'a> {
    slots: &'a DashMap<String, Arc<KeySlot>>,
    key: &'a str,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.slots
            .remove_if(self.key, |_, slot| {
                slot.leases.fetch_sub(1, Ordering::SeqCst) == 1
            });
    }
}

/// Deduplicates concurrent factory invocations per key
pub struct RequestCoalescer {
    slots: DashMap<String, Arc<KeySlot>>,
}

impl RequestCoalescer {
    /// Empty coalescer.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Number of keys currently leased. Exposed for tests and diagnostics.
    pub fn active_keys(&self) -> usize {
        self.slots.len()
    }

    fn lease(&self, key: &str) -> Arc<KeySlot> {
        let entry = self
            .slots
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(KeySlot::new()));
        // Incremented while the shard lock is held, so release cannot
        // observe a stale zero and drop the slot underneath us.
        entry.leases.fetch_add(1, Ordering::SeqCst);
        entry.clone()
    }

    /// Run `factory` while holding the key's exclusion primitive.
    ///
    /// Returns `TimedOut` or `Cancelled` without ever starting a duplicate
    /// run. A factory error propagates to this caller only; waiters simply
    /// acquire next and run their own factory.
    pub async fn try_execute<T, F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        ct: &CancellationToken,
        factory: F,
    ) -> CacheOpResult<CoalesceOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheOpResult<T>>,
    {
        let slot = self.lease(key);
        // Releases the lease even if this caller's future is dropped
        // mid-wait.
        let _guard = LeaseGuard {
            slots: &self.slots,
            key,
        };
        self.execute_on_slot(&slot, timeout, ct, factory).await
    }

    async fn execute_on_slot<T, F, Fut>(
        &self,
        slot: &KeySlot,
        timeout: Duration,
        ct: &CancellationToken,
        factory: F,
    ) -> CacheOpResult<CoalesceOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheOpResult<T>>,
    {
        let permit = tokio::select! {
            permit = slot.gate.acquire() => match permit {
                Ok(p) => p,
                // The semaphore is never closed while a lease exists.
                Err(_) => return Ok(CoalesceOutcome::TimedOut),
            },
            _ = tokio::time::sleep(timeout) => return Ok(CoalesceOutcome::TimedOut),
            _ = ct.cancelled() => return Ok(CoalesceOutcome::Cancelled),
        };

        let result = factory().await;
        drop(permit);
        result.map(CoalesceOutcome::Completed)
    }
}

impl Default for RequestCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use crate::error::CacheError;

    #[tokio::test]
    async fn test_single_caller_runs_factory() {
        let coalescer = RequestCoalescer::new();
        let ct = CancellationToken::new();
        let outcome = coalescer
            .try_execute("k", Duration::from_secs(1), &ct, || async { Ok(42u32) })
            .await
            .unwrap();
        assert_eq!(outcome, CoalesceOutcome::Completed(42));
        assert_eq!(coalescer.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let coalescer = Arc::new(RequestCoalescer::new());
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coalescer = coalescer.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let ct = CancellationToken::new();
                coalescer
                    .try_execute("same-key", Duration::from_secs(5), &ct, || async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), CoalesceOutcome::Completed(()));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1, "factories overlapped");
        assert_eq!(coalescer.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_waiter_times_out_without_duplicate_run() {
        let coalescer = Arc::new(RequestCoalescer::new());
        let runs = Arc::new(AtomicU32::new(0));

        let holder = {
            let coalescer = coalescer.clone();
            let runs = runs.clone();
            tokio::spawn(async move {
                let ct = CancellationToken::new();
                coalescer
                    .try_execute("slow", Duration::from_secs(5), &ct, || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    })
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let ct = CancellationToken::new();
        let outcome = coalescer
            .try_execute("slow", Duration::from_millis(30), &ct, || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, CoalesceOutcome::TimedOut);
        holder.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_affects_only_the_cancelled_caller() {
        let coalescer = Arc::new(RequestCoalescer::new());

        let holder = {
            let coalescer = coalescer.clone();
            tokio::spawn(async move {
                let ct = CancellationToken::new();
                coalescer
                    .try_execute("busy", Duration::from_secs(5), &ct, || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(7u32)
                    })
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let ct = CancellationToken::new();
        ct.cancel();
        let outcome = coalescer
            .try_execute("busy", Duration::from_secs(5), &ct, || async { Ok(0u32) })
            .await
            .unwrap();
        assert_eq!(outcome, CoalesceOutcome::Cancelled);

        // The in-flight run is unaffected by the cancelled waiter.
        assert_eq!(holder.await.unwrap(), CoalesceOutcome::Completed(7));
    }

    #[tokio::test]
    async fn test_factory_error_propagates_to_caller_only() {
        let coalescer = Arc::new(RequestCoalescer::new());
        let ct = CancellationToken::new();

        let err = coalescer
            .try_execute("k", Duration::from_secs(1), &ct, || async {
                Err::<(), _>(CacheError::Other("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Other(_)));

        // The slot is cleaned up; the next caller acquires immediately.
        let outcome = coalescer
            .try_execute("k", Duration::from_secs(1), &ct, || async { Ok(1u8) })
            .await
            .unwrap();
        assert_eq!(outcome, CoalesceOutcome::Completed(1));
        assert_eq!(coalescer.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_sequential_callers_each_run() {
        let coalescer = RequestCoalescer::new();
        let ct = CancellationToken::new();
        let runs = AtomicU32::new(0);

        for _ in 0..3 {
            coalescer
                .try_execute("seq", Duration::from_secs(1), &ct, || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
