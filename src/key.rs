//! Content-addressed cache keys
//!
//! A key is 32 bytes in two halves: the source half identifies the origin
//! of a request (remote URL, storage object), the variant half identifies
//! the processing parameters applied to it. Both halves are produced with
//! xxh3-128, so the same (source, variant) pair always lands on the same
//! key and the same storage path.

use std::fmt;
use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::xxh3_128;

/// Number of raw bytes in a cache key
pub const KEY_LEN: usize = 32;

/// Length of the source half in bytes
pub const SOURCE_HALF_LEN: usize = 16;

/// 32-byte content-addressed cache key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CacheKey {
    bytes: [u8; KEY_LEN],
}

impl CacheKey {
    /// Derive a key by hashing the source identity and the variant
    /// parameters independently.
    pub fn from_strings(source: &str, variant: &str) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        bytes[..SOURCE_HALF_LEN].copy_from_slice(&xxh3_128(source.as_bytes()).to_le_bytes());
        bytes[SOURCE_HALF_LEN..].copy_from_slice(&xxh3_128(variant.as_bytes()).to_le_bytes());
        Self { bytes }
    }

    /// Admit an externally produced 32-byte fingerprint.
    pub fn from_raw(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// 64-character lowercase hex rendering, the canonical string key.
    pub fn hex_key(&self) -> String {
        hex::encode(self.bytes)
    }

    /// The 32-character source-half hex string, used for purge-by-source
    /// and tagging.
    pub fn source_prefix(&self) -> String {
        hex::encode(&self.bytes[..SOURCE_HALF_LEN])
    }

    /// Relative storage path with three-level fan-out:
    /// `{first-4-of-source-hex}{sep}{32-source-hex}{sep}{32-variant-hex}[.ext]`.
    pub fn storage_path(&self, separator: char, extension: &str) -> String {
        let source_hex = hex::encode(&self.bytes[..SOURCE_HALF_LEN]);
        let variant_hex = hex::encode(&self.bytes[SOURCE_HALF_LEN..]);
        let mut path = String::with_capacity(4 + 1 + 32 + 1 + 32 + 1 + extension.len());
        path.push_str(&source_hex[..4]);
        path.push(separator);
        path.push_str(&source_hex);
        path.push(separator);
        path.push_str(&variant_hex);
        if !extension.is_empty() {
            path.push('.');
            path.push_str(extension);
        }
        path
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The key is already a uniform hash; the first 8 bytes carry
        // enough entropy for table placement.
        let mut first = [0u8; 8];
        first.copy_from_slice(&self.bytes[..8]);
        state.write_u64(u64::from_le_bytes(first));
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.hex_key())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_hex_key_is_lowercase_64_chars() {
        let key = CacheKey::from_strings("https://example.com/cat.jpg", "w=200&h=100");
        let hex = key.hex_key();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, hex.to_lowercase());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = CacheKey::from_strings("source", "variant");
        let b = CacheKey::from_strings("source", "variant");
        assert_eq!(a, b);
        assert_eq!(a.storage_path('/', "blob"), b.storage_path('/', "blob"));
    }

    #[test]
    fn test_halves_are_independent() {
        let a = CacheKey::from_strings("source", "v1");
        let b = CacheKey::from_strings("source", "v2");
        assert_ne!(a, b);
        assert_eq!(a.source_prefix(), b.source_prefix());

        let c = CacheKey::from_strings("other", "v1");
        assert_ne!(a.source_prefix(), c.source_prefix());
    }

    #[test]
    fn test_storage_path_shape() {
        let key = CacheKey::from_strings("src", "var");
        let path = key.storage_path('/', "blob");
        let parts: Vec<&str> = path.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 4);
        assert_eq!(parts[1].len(), 32);
        assert!(parts[1].starts_with(parts[0]));
        assert!(parts[2].ends_with(".blob"));
        assert_eq!(parts[2].trim_end_matches(".blob").len(), 32);
    }

    #[test]
    fn test_storage_path_without_extension() {
        let key = CacheKey::from_strings("src", "var");
        let path = key.storage_path('/', "");
        assert!(!path.contains('.'));
    }

    #[test]
    fn test_from_raw_round_trip() {
        let raw: [u8; KEY_LEN] = core::array::from_fn(|i| i as u8);
        let key = CacheKey::from_raw(raw);
        assert_eq!(key.as_bytes(), &raw);
    }

    #[test]
    fn test_distinct_keys_distinct_paths() {
        let mut paths = HashSet::new();
        for i in 0..1000 {
            let key = CacheKey::from_strings(&format!("source-{i}"), "variant");
            assert!(paths.insert(key.storage_path('/', "blob")));
        }
    }
}
