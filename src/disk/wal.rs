//! Append-only metadata log framing
//!
//! Each shard persists its index as a flat sequence of framed records:
//! `{u32 length, u64 timestamp, u8 op, body, u32 crc32}`, little-endian
//! throughout. `length` counts everything after itself, so a reader can
//! skip records without decoding them. The CRC covers timestamp, op and
//! body. A truncated or corrupt trailing record is tolerated: replay stops
//! there and the shard continues from what it has.

use tracing::warn;

use crate::disk::entry::{DiskEntry, EntryFlags};
use crate::key::{CacheKey, KEY_LEN};

/// Log operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    /// Insert or replace the record for a key
    Upsert,
    /// Remove the record for a key
    Delete,
}

impl WalOp {
    fn to_byte(self) -> u8 {
        match self {
            Self::Upsert => 1,
            Self::Delete => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Upsert),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One decoded log record
#[derive(Debug, Clone)]
pub struct WalRecord {
    /// What the record does to the index
    pub op: WalOp,
    /// When it was appended (unix millis)
    pub timestamp: u64,
    /// The entry payload; for deletes only the key is meaningful
    pub entry: DiskEntry,
}

/// Marker for an absent content type in the framed body
const NO_CONTENT_TYPE: u16 = u16::MAX;

/// Encode one record, framed and checksummed.
pub fn encode_record(op: WalOp, timestamp: u64, entry: &DiskEntry) -> Vec<u8> {
    let mut body = Vec::with_capacity(KEY_LEN + 64 + entry.relative_path.len());
    body.extend_from_slice(entry.key.as_bytes());
    body.extend_from_slice(&(entry.relative_path.len() as u16).to_le_bytes());
    body.extend_from_slice(entry.relative_path.as_bytes());
    match &entry.content_type {
        Some(ct) => {
            body.extend_from_slice(&(ct.len() as u16).to_le_bytes());
            body.extend_from_slice(ct.as_bytes());
        }
        None => body.extend_from_slice(&NO_CONTENT_TYPE.to_le_bytes()),
    }
    body.push(entry.flags.bits());
    body.extend_from_slice(&entry.est_disk_size.to_le_bytes());
    body.extend_from_slice(&entry.created_at.to_le_bytes());
    body.extend_from_slice(&entry.access_count_key.to_le_bytes());

    let mut framed = Vec::with_capacity(4 + 8 + 1 + body.len() + 4);
    let length = (8 + 1 + body.len() + 4) as u32;
    framed.extend_from_slice(&length.to_le_bytes());
    framed.extend_from_slice(&timestamp.to_le_bytes());
    framed.push(op.to_byte());
    framed.extend_from_slice(&body);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&framed[4..]);
    framed.extend_from_slice(&hasher.finalize().to_le_bytes());
    framed
}

fn decode_body(body: &[u8]) -> Option<DiskEntry> {
    if body.len() < KEY_LEN + 2 {
        return None;
    }
    let mut raw_key = [0u8; KEY_LEN];
    raw_key.copy_from_slice(&body[..KEY_LEN]);
    let mut offset = KEY_LEN;

    let rel_len = u16::from_le_bytes([body[offset], body[offset + 1]]) as usize;
    offset += 2;
    if body.len() < offset + rel_len + 2 {
        return None;
    }
    let relative_path = String::from_utf8(body[offset..offset + rel_len].to_vec()).ok()?;
    offset += rel_len;

    let ct_len = u16::from_le_bytes([body[offset], body[offset + 1]]);
    offset += 2;
    let content_type = if ct_len == NO_CONTENT_TYPE {
        None
    } else {
        let ct_len = ct_len as usize;
        if body.len() < offset + ct_len {
            return None;
        }
        let text = String::from_utf8(body[offset..offset + ct_len].to_vec()).ok()?;
        offset += ct_len;
        Some(text)
    };

    if body.len() != offset + 1 + 8 + 8 + 8 {
        return None;
    }
    let flags = EntryFlags::from_bits(body[offset]);
    offset += 1;
    let est_disk_size = u64::from_le_bytes(body[offset..offset + 8].try_into().ok()?);
    offset += 8;
    let created_at = u64::from_le_bytes(body[offset..offset + 8].try_into().ok()?);
    offset += 8;
    let access_count_key = u64::from_le_bytes(body[offset..offset + 8].try_into().ok()?);

    Some(DiskEntry {
        key: CacheKey::from_raw(raw_key),
        relative_path,
        access_count_key,
        created_at,
        last_deletion_attempt: None,
        est_disk_size,
        content_type,
        tags: Vec::new(),
        flags,
    })
}

/// Decode a whole log. Returns the records read and whether replay
/// stopped early at a truncated or corrupt tail.
pub fn replay(data: &[u8]) -> (Vec<WalRecord>, bool) {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        if data.len() - offset < 4 {
            return (records, true);
        }
        let length = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        // A frame shorter than its fixed fields can only be garbage.
        if length < 8 + 1 + 4 || data.len() - offset - 4 < length {
            return (records, true);
        }
        let frame = &data[offset + 4..offset + 4 + length];
        let (payload, crc_bytes) = frame.split_at(length - 4);
        let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != expected {
            return (records, true);
        }

        let timestamp = u64::from_le_bytes(payload[..8].try_into().unwrap());
        let op = match WalOp::from_byte(payload[8]) {
            Some(op) => op,
            None => return (records, true),
        };
        let entry = match decode_body(&payload[9..]) {
            Some(entry) => entry,
            None => return (records, true),
        };
        records.push(WalRecord {
            op,
            timestamp,
            entry,
        });
        offset += 4 + length;
    }
    (records, false)
}

/// Replay with logging, for shard startup.
pub fn replay_logged(shard: u32, data: &[u8]) -> Vec<WalRecord> {
    let (records, truncated) = replay(data);
    if truncated {
        warn!(
            shard,
            records = records.len(),
            "metadata log has a torn tail; later records dropped"
        );
    }
    records
}
