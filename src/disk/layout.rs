//! Hashed path layout for the disk engine
//!
//! Files are content-addressed: the first hex nibbles of the key (enough
//! to cover the configured fan-out) name the directory, the remaining
//! nibbles name the file. Reads always target the exact expected path;
//! there is no directory scanning on the hot path.

use std::path::{Path, PathBuf};

use crate::key::CacheKey;

/// Directory reserved for non-content blobs (health probes, bloom
/// checkpoints)
pub const META_DIR: &str = "__meta";

/// Suffix for in-progress writes
pub const TEMP_SUFFIX: &str = ".tmp";

/// Pure mapping from keys to filesystem paths
#[derive(Debug, Clone)]
pub struct PathLayout {
    root: PathBuf,
    prefix_nibbles: usize,
    extension: String,
}

impl PathLayout {
    /// Layout rooted at `root` with at least `subfolders` first-level
    /// directories.
    pub fn new(root: PathBuf, subfolders: u32, extension: impl Into<String>) -> Self {
        let bits = subfolders.max(1).next_power_of_two().trailing_zeros() as usize;
        // Each nibble covers 4 bits of fan-out; always shard at least one
        // nibble so the root directory stays small.
        let prefix_nibbles = bits.div_ceil(4).clamp(1, 8);
        Self {
            root,
            prefix_nibbles,
            extension: extension.into(),
        }
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hex nibbles used for the first-level directory.
    pub fn prefix_nibbles(&self) -> usize {
        self.prefix_nibbles
    }

    /// Relative path of a key: `{prefix}/{remainder}[.ext]`.
    pub fn relative_path(&self, key: &CacheKey) -> String {
        let hex = key.hex_key();
        let mut path = String::with_capacity(hex.len() + 2 + self.extension.len());
        path.push_str(&hex[..self.prefix_nibbles]);
        path.push('/');
        path.push_str(&hex[self.prefix_nibbles..]);
        if !self.extension.is_empty() {
            path.push('.');
            path.push_str(&self.extension);
        }
        path
    }

    /// Absolute path of a key's data file.
    pub fn physical_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(self.relative_path(key))
    }

    /// Absolute path of a relative path produced by this layout.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Temp-file path beside a target path.
    pub fn temp_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(TEMP_SUFFIX);
        PathBuf::from(os)
    }

    /// Absolute path of a reserved meta blob.
    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(META_DIR).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_width_follows_fanout() {
        let root = PathBuf::from("/cache");
        assert_eq!(PathLayout::new(root.clone(), 16, "blob").prefix_nibbles(), 1);
        assert_eq!(PathLayout::new(root.clone(), 256, "blob").prefix_nibbles(), 2);
        assert_eq!(PathLayout::new(root.clone(), 4096, "blob").prefix_nibbles(), 3);
        // Non-power-of-16 fan-outs round up.
        assert_eq!(PathLayout::new(root.clone(), 1000, "blob").prefix_nibbles(), 3);
        assert_eq!(PathLayout::new(root, 1, "blob").prefix_nibbles(), 1);
    }

    #[test]
    fn test_relative_path_is_deterministic() {
        let layout = PathLayout::new(PathBuf::from("/cache"), 4096, "blob");
        let key = CacheKey::from_strings("source", "variant");
        assert_eq!(layout.relative_path(&key), layout.relative_path(&key));

        let rel = layout.relative_path(&key);
        let (dir, file) = rel.split_once('/').unwrap();
        assert_eq!(dir.len(), 3);
        assert!(file.ends_with(".blob"));
        assert_eq!(dir, &key.hex_key()[..3]);
    }

    #[test]
    fn test_physical_path_under_root() {
        let layout = PathLayout::new(PathBuf::from("/cache"), 256, "blob");
        let key = CacheKey::from_strings("s", "v");
        let path = layout.physical_path(&key);
        assert!(path.starts_with("/cache"));
        assert_eq!(path, layout.resolve(&layout.relative_path(&key)));
    }

    #[test]
    fn test_temp_path_appends_suffix() {
        let path = PathBuf::from("/cache/ab/cdef.blob");
        assert_eq!(
            PathLayout::temp_path(&path),
            PathBuf::from("/cache/ab/cdef.blob.tmp")
        );
    }

    #[test]
    fn test_meta_path_is_reserved() {
        let layout = PathLayout::new(PathBuf::from("/cache"), 256, "blob");
        assert_eq!(
            layout.meta_path("bloom/v1"),
            PathBuf::from("/cache/__meta/bloom/v1")
        );
    }
}
