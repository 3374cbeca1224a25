//! Compact in-memory access counting
//!
//! A power-of-two table of saturating 16-bit counters keyed by a hash of
//! the entry hash. Collisions merge counts, which only ever makes an
//! entry look hotter; for eviction ordering that is an acceptable error.
//! The table is not persisted — after a cold start every entry looks
//! equally cold, and the eviction grace period covers the warm-up.

use std::sync::atomic::{AtomicU16, Ordering};

/// Saturating per-slot access counter table
pub struct BucketCounter {
    slots: Vec<AtomicU16>,
    mask: u64,
}

impl BucketCounter {
    /// Table with at least `slots` entries, rounded up to a power of two.
    pub fn new(slots: u32) -> Self {
        let capacity = slots.max(2).next_power_of_two() as usize;
        Self {
            slots: (0..capacity).map(|_| AtomicU16::new(0)).collect(),
            mask: capacity as u64 - 1,
        }
    }

    /// Record one access for the slot handle.
    pub fn record(&self, access_count_key: u64) {
        let slot = &self.slots[(access_count_key & self.mask) as usize];
        let mut current = slot.load(Ordering::Relaxed);
        while current < u16::MAX {
            match slot.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current count for the slot handle.
    pub fn get(&self, access_count_key: u64) -> u16 {
        self.slots[(access_count_key & self.mask) as usize].load(Ordering::Relaxed)
    }

    /// Number of slots in the table.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
