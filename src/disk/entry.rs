//! Metadata record for one cached file
//!
//! The record is the ground truth for a disk entry: a file without a
//! committed record does not exist as far as the engine is concerned.
//! Reservation writes the record with a sentinel creation time one day in
//! the future; `mark_file_created` rewrites it once the bytes are in
//! place, so a crash between the two leaves an uncommitted record rather
//! than a phantom file.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use xxhash_rust::xxh3::xxh3_64;

use crate::key::CacheKey;

/// Entry flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u8);

impl EntryFlags {
    /// The artifact was produced by the factory rather than replicated
    /// from another tier.
    pub const GENERATED: EntryFlags = EntryFlags(0b0000_0001);

    /// No flags set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Raw bit pattern, as persisted.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Flags from a persisted bit pattern; unknown bits are preserved.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Whether every bit of `other` is set.
    pub fn contains(self, other: EntryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of the two flag sets.
    pub fn union(self, other: EntryFlags) -> Self {
        Self(self.0 | other.0)
    }
}

/// Milliseconds since the Unix epoch, the engine's persisted time unit
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current time in persisted units.
pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}

/// Sentinel creation time for a reserved-but-unwritten entry.
pub fn reservation_sentinel() -> u64 {
    unix_millis(SystemTime::now() + Duration::from_secs(24 * 60 * 60))
}

/// One disk entry's metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    /// Content-addressed identity
    pub key: CacheKey,
    /// Layout-relative path of the data file
    pub relative_path: String,
    /// Handle into the in-memory access counter
    pub access_count_key: u64,
    /// Creation time (unix millis); values in the future mark an
    /// uncommitted reservation
    pub created_at: u64,
    /// When a file delete last failed (unix millis); not persisted
    pub last_deletion_attempt: Option<u64>,
    /// Estimated on-disk size in bytes
    pub est_disk_size: u64,
    /// MIME type, when known
    pub content_type: Option<String>,
    /// Free-form labels; in-memory only
    pub tags: Vec<(String, String)>,
    /// Flag bits
    pub flags: EntryFlags,
}

impl DiskEntry {
    /// Record for a new reservation of `size` bytes at `relative_path`.
    pub fn reserve(key: CacheKey, relative_path: String, size: u64) -> Self {
        Self {
            key,
            relative_path,
            access_count_key: access_count_key(&key),
            created_at: reservation_sentinel(),
            last_deletion_attempt: None,
            est_disk_size: size,
            content_type: None,
            tags: Vec::new(),
            flags: EntryFlags::empty(),
        }
    }

    /// 64-char lowercase hex of the key.
    pub fn hex(&self) -> String {
        self.key.hex_key()
    }

    /// Whether the data file has been committed.
    pub fn is_committed(&self) -> bool {
        self.created_at <= now_millis()
    }

    /// Entry age, zero for uncommitted reservations.
    pub fn age(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.created_at))
    }

    /// Whether a previously failed delete may be retried.
    pub fn deletion_retry_due(&self, retry_after: Duration) -> bool {
        match self.last_deletion_attempt {
            Some(at) => now_millis().saturating_sub(at) >= retry_after.as_millis() as u64,
            None => true,
        }
    }
}

/// Slot handle for the access counter: a hash of the hash, so entries
/// spread evenly regardless of key structure.
pub fn access_count_key(key: &CacheKey) -> u64 {
    xxh3_64(key.as_bytes())
}
