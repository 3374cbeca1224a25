//! Rotating bloom filter gating remote-tier lookups
//!
//! The filter is `slot_count` independent bitsets. Insertion writes to the
//! current slot only; membership ORs every slot. Rotation advances the
//! current-slot pointer and zeroes the slot it lands on, so an inserted key
//! survives at least `slot_count - 1` rotations before it can age out.
//! Within that window the filter never produces a false negative.
//!
//! Bit writes are atomic per 64-bit word; rotation and snapshotting briefly
//! take a write lock so no insert can land in a slot mid-zero.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_128;

use crate::config::BloomConfig;
use crate::error::{CacheError, CacheOpResult};

const CHECKPOINT_MAGIC: &[u8; 4] = b"BLM1";
const CHECKPOINT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 2 + 4 + 2 + 2;

struct FilterState {
    current_slot: usize,
    slots: Vec<Vec<AtomicU64>>,
}

/// Probabilistic membership set with slot-based aging
pub struct RotatingBloomFilter {
    slot_count: u16,
    bits_per_slot: u32,
    hash_count: u16,
    state: RwLock<FilterState>,
}

impl RotatingBloomFilter {
    /// Build a filter sized from the expected item count and target false
    /// positive rate using the standard formulas.
    pub fn new(config: &BloomConfig) -> CacheOpResult<Self> {
        config.validate()?;

        let n = config.estimated_items as f64;
        let p = config.false_positive_rate;
        let ln2 = std::f64::consts::LN_2;

        let m = (-n * p.ln() / (ln2 * ln2)).ceil();
        // Round up to whole words so every bit index maps into allocated
        // storage.
        let words = ((m as u64).div_ceil(64)).max(1);
        let bits_per_slot = (words * 64).min(u32::MAX as u64) as u32;
        let hash_count = ((m / n) * ln2).round().max(1.0) as u16;

        let slots = (0..config.slot_count)
            .map(|_| Self::zeroed_slot(words as usize))
            .collect();

        Ok(Self {
            slot_count: config.slot_count,
            bits_per_slot,
            hash_count,
            state: RwLock::new(FilterState {
                current_slot: 0,
                slots,
            }),
        })
    }

    fn zeroed_slot(words: usize) -> Vec<AtomicU64> {
        (0..words).map(|_| AtomicU64::new(0)).collect()
    }

    fn words_per_slot(&self) -> usize {
        (self.bits_per_slot as usize).div_ceil(64)
    }

    /// Bit positions for a key, derived by double hashing a single 128-bit
    /// digest.
    fn bit_positions(&self, key: &str) -> impl Iterator<Item = u32> + '_ {
        let digest = xxh3_128(key.as_bytes());
        let h1 = digest as u64;
        let h2 = (digest >> 64) as u64 | 1;
        let bits = self.bits_per_slot as u64;
        (0..self.hash_count as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % bits) as u32)
    }

    /// Record a key in the current slot.
    pub fn insert(&self, key: &str) {
        let state = self.state.read();
        let slot = &state.slots[state.current_slot];
        for bit in self.bit_positions(key) {
            let word = &slot[(bit / 64) as usize];
            word.fetch_or(1u64 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// Whether the key may have been inserted within the aging window.
    /// Never false for a key inserted since the slot it landed in was last
    /// zeroed; may be spuriously true.
    pub fn probably_contains(&self, key: &str) -> bool {
        let positions: Vec<u32> = self.bit_positions(key).collect();
        let state = self.state.read();
        state.slots.iter().any(|slot| {
            positions.iter().all(|bit| {
                let word = slot[(*bit / 64) as usize].load(Ordering::Relaxed);
                word & (1u64 << (bit % 64)) != 0
            })
        })
    }

    /// Advance the current-slot pointer and zero the slot it lands on.
    pub fn rotate(&self) {
        let mut state = self.state.write();
        let next = (state.current_slot + 1) % self.slot_count as usize;
        state.current_slot = next;
        for word in &state.slots[next] {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Zero every slot and reset the pointer.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.current_slot = 0;
        for slot in &state.slots {
            for word in slot {
                word.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Serialize a versioned checkpoint of the filter.
    pub fn to_bytes(&self) -> Vec<u8> {
        let state = self.state.read();
        let words = self.words_per_slot();
        let mut out = Vec::with_capacity(HEADER_LEN + self.slot_count as usize * words * 8);
        out.extend_from_slice(CHECKPOINT_MAGIC);
        out.push(CHECKPOINT_VERSION);
        out.extend_from_slice(&self.slot_count.to_le_bytes());
        out.extend_from_slice(&self.bits_per_slot.to_le_bytes());
        out.extend_from_slice(&self.hash_count.to_le_bytes());
        out.extend_from_slice(&(state.current_slot as u16).to_le_bytes());
        for slot in &state.slots {
            for word in slot {
                out.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
            }
        }
        out
    }

    fn parse_header(&self, bytes: &[u8]) -> CacheOpResult<usize> {
        if bytes.len() < HEADER_LEN {
            return Err(CacheError::CorruptCheckpoint(format!(
                "payload too short: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != CHECKPOINT_MAGIC {
            return Err(CacheError::CorruptCheckpoint("bad magic".into()));
        }
        if bytes[4] != CHECKPOINT_VERSION {
            return Err(CacheError::CorruptCheckpoint(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }
        let slot_count = u16::from_le_bytes([bytes[5], bytes[6]]);
        let bits_per_slot = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        let hash_count = u16::from_le_bytes([bytes[11], bytes[12]]);
        let current_slot = u16::from_le_bytes([bytes[13], bytes[14]]);

        if slot_count != self.slot_count
            || bits_per_slot != self.bits_per_slot
            || hash_count != self.hash_count
        {
            return Err(CacheError::CorruptCheckpoint(format!(
                "shape mismatch: payload {}x{}x{}, filter {}x{}x{}",
                slot_count, bits_per_slot, hash_count, self.slot_count, self.bits_per_slot,
                self.hash_count
            )));
        }
        if current_slot >= slot_count {
            return Err(CacheError::CorruptCheckpoint(format!(
                "current slot {current_slot} out of range"
            )));
        }

        let expected = HEADER_LEN + slot_count as usize * self.words_per_slot() * 8;
        if bytes.len() != expected {
            return Err(CacheError::CorruptCheckpoint(format!(
                "payload length {} does not match shape ({expected})",
                bytes.len()
            )));
        }
        Ok(current_slot as usize)
    }

    /// Replace the filter contents with a previously serialized checkpoint.
    /// The payload's shape must match this filter's shape.
    pub fn load_from_bytes(&self, bytes: &[u8]) -> CacheOpResult<()> {
        let current_slot = self.parse_header(bytes)?;

        let mut state = self.state.write();
        state.current_slot = current_slot;
        let mut offset = HEADER_LEN;
        for slot in &state.slots {
            for word in slot {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[offset..offset + 8]);
                word.store(u64::from_le_bytes(raw), Ordering::Relaxed);
                offset += 8;
            }
        }
        Ok(())
    }

    /// OR a peer's checkpoint into this filter, slot by slot. The peer's
    /// slot pointer is ignored; only the bitmaps merge.
    pub fn merge_from_peer(&self, bytes: &[u8]) -> CacheOpResult<()> {
        self.parse_header(bytes)?;
        let state = self.state.read();
        let mut offset = HEADER_LEN;
        for slot in &state.slots {
            for word in slot {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[offset..offset + 8]);
                word.fetch_or(u64::from_le_bytes(raw), Ordering::Relaxed);
                offset += 8;
            }
        }
        Ok(())
    }

    /// Number of slots.
    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    /// Bits allocated per slot.
    pub fn bits_per_slot(&self) -> u32 {
        self.bits_per_slot
    }

    /// Hash functions applied per key.
    pub fn hash_count(&self) -> u16 {
        self.hash_count
    }
}
