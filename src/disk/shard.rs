//! Metadata shards
//!
//! Entry records are partitioned across independent shards by the first
//! four bytes of the key. Each shard owns a memory index, an append-only
//! log that is replayed on startup, and a byte counter. The log file is
//! held under an exclusive OS lock for the shard's lifetime; a second
//! process mounting the same directory fails fast instead of corrupting
//! the log.
//!
//! The index lock is never held across data-file I/O; it guards only map
//! mutations. Log appends happen before the index mutation they describe.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

use crate::disk::entry::{now_millis, DiskEntry};
use crate::disk::wal::{self, WalOp};
use crate::error::{CacheError, CacheOpResult};
use crate::key::CacheKey;

/// Shard index for a key: the first four key bytes modulo the shard count.
pub fn shard_of(key: &CacheKey, shards: u32) -> u32 {
    let prefix = u32::from_le_bytes(key.as_bytes()[..4].try_into().unwrap());
    prefix % shards
}

/// One metadata shard: index, log, byte counter
#[derive(Debug)]
pub struct MetaShard {
    id: u32,
    index: RwLock<HashMap<CacheKey, DiskEntry>>,
    current_bytes: AtomicU64,
    log: Mutex<std::fs::File>,
}

impl MetaShard {
    /// Log file path for a shard id.
    pub fn log_path(meta_dir: &Path, id: u32) -> PathBuf {
        meta_dir.join(format!("shard-{id}.log"))
    }

    /// Mount the shard: lock its log exclusively, replay it into the
    /// index. A held lock means another process owns the directory and is
    /// a fatal conflict.
    pub fn mount(id: u32, meta_dir: &Path) -> CacheOpResult<Self> {
        std::fs::create_dir_all(meta_dir)?;
        let path = Self::log_path(meta_dir, id);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| CacheError::InstanceConflict(path.display().to_string()))?;

        let data = std::fs::read(&path)?;
        let mut index = HashMap::new();
        for record in wal::replay_logged(id, &data) {
            match record.op {
                WalOp::Upsert => {
                    index.insert(record.entry.key, record.entry);
                }
                WalOp::Delete => {
                    index.remove(&record.entry.key);
                }
            }
        }
        let current_bytes = index.values().map(|e| e.est_disk_size).sum();
        debug!(shard = id, entries = index.len(), current_bytes, "shard mounted");

        Ok(Self {
            id,
            index: RwLock::new(index),
            current_bytes: AtomicU64::new(current_bytes),
            log: Mutex::new(file),
        })
    }

    /// Shard id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bytes accounted to live entries.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::SeqCst)
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    /// Whether the shard holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Record for a key, if present.
    pub async fn get(&self, key: &CacheKey) -> Option<DiskEntry> {
        self.index.read().await.get(key).cloned()
    }

    fn append(&self, op: WalOp, entry: &DiskEntry) -> CacheOpResult<()> {
        let framed = wal::encode_record(op, now_millis(), entry);
        let mut log = self.log.lock();
        log.write_all(&framed)?;
        Ok(())
    }

    /// Insert or replace a record. The log append and the index mutation
    /// happen under the same write lock, so replay order matches what the
    /// index saw.
    pub async fn upsert(&self, entry: DiskEntry) -> CacheOpResult<()> {
        let mut index = self.index.write().await;
        self.append(WalOp::Upsert, &entry)?;
        let previous = index.insert(entry.key, entry.clone());
        drop(index);

        match previous {
            Some(old) => {
                if old.est_disk_size > entry.est_disk_size {
                    self.current_bytes
                        .fetch_sub(old.est_disk_size - entry.est_disk_size, Ordering::SeqCst);
                } else {
                    self.current_bytes
                        .fetch_add(entry.est_disk_size - old.est_disk_size, Ordering::SeqCst);
                }
            }
            None => {
                self.current_bytes
                    .fetch_add(entry.est_disk_size, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Remove a record, returning it when one existed.
    pub async fn remove(&self, key: &CacheKey) -> CacheOpResult<Option<DiskEntry>> {
        let mut index = self.index.write().await;
        let Some(entry) = index.get(key).cloned() else {
            return Ok(None);
        };
        self.append(WalOp::Delete, &entry)?;
        index.remove(key);
        drop(index);

        self.current_bytes
            .fetch_sub(entry.est_disk_size, Ordering::SeqCst);
        Ok(Some(entry))
    }

    /// Note a failed file delete so retries respect the backoff window.
    /// In-memory only; the log frame does not carry this field.
    pub async fn mark_deletion_attempt(&self, key: &CacheKey) {
        if let Some(entry) = self.index.write().await.get_mut(key) {
            entry.last_deletion_attempt = Some(now_millis());
        }
    }

    /// Copy of every live record, for eviction scans and purges.
    pub async fn snapshot(&self) -> Vec<DiskEntry> {
        self.index.read().await.values().cloned().collect()
    }

    /// Keys whose source half matches the given 32-hex prefix.
    pub async fn keys_with_source(&self, source_prefix: &str) -> Vec<CacheKey> {
        self.index
            .read()
            .await
            .keys()
            .filter(|k| k.source_prefix() == source_prefix)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KEY_LEN;

    fn entry(n: u8, size: u64) -> DiskEntry {
        let mut e = DiskEntry::reserve(
            CacheKey::from_raw([n; KEY_LEN]),
            format!("ab/{n:02x}.blob"),
            size,
        );
        e.created_at = now_millis();
        e
    }

    #[tokio::test]
    async fn test_upsert_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let shard = MetaShard::mount(0, dir.path()).unwrap();

        let e = entry(1, 100);
        shard.upsert(e.clone()).await.unwrap();
        assert_eq!(shard.get(&e.key).await.unwrap().est_disk_size, 100);
        assert_eq!(shard.current_bytes(), 100);

        let removed = shard.remove(&e.key).await.unwrap().unwrap();
        assert_eq!(removed.key, e.key);
        assert_eq!(shard.current_bytes(), 0);
        assert!(shard.get(&e.key).await.is_none());
        assert!(shard.remove(&e.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shard = MetaShard::mount(3, dir.path()).unwrap();
            shard.upsert(entry(1, 100)).await.unwrap();
            shard.upsert(entry(2, 200)).await.unwrap();
            shard.upsert(entry(3, 300)).await.unwrap();
            shard.remove(&entry(2, 200).key).await.unwrap();
        }

        let shard = MetaShard::mount(3, dir.path()).unwrap();
        assert_eq!(shard.len().await, 2);
        assert_eq!(shard.current_bytes(), 400);
        assert!(shard.get(&entry(1, 0).key).await.is_some());
        assert!(shard.get(&entry(2, 0).key).await.is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_reaccounts() {
        let dir = tempfile::tempdir().unwrap();
        let shard = MetaShard::mount(0, dir.path()).unwrap();

        shard.upsert(entry(1, 100)).await.unwrap();
        shard.upsert(entry(1, 40)).await.unwrap();
        assert_eq!(shard.current_bytes(), 40);
        assert_eq!(shard.len().await, 1);
    }

    #[tokio::test]
    async fn test_second_mount_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let _held = MetaShard::mount(0, dir.path()).unwrap();
        let err = MetaShard::mount(0, dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::InstanceConflict(_)));
    }

    #[tokio::test]
    async fn test_torn_tail_survives_remount() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shard = MetaShard::mount(0, dir.path()).unwrap();
            shard.upsert(entry(1, 100)).await.unwrap();
            shard.upsert(entry(2, 200)).await.unwrap();
        }
        // Chop into the last record.
        let path = MetaShard::log_path(dir.path(), 0);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 7]).unwrap();

        let shard = MetaShard::mount(0, dir.path()).unwrap();
        assert_eq!(shard.len().await, 1);
        assert_eq!(shard.current_bytes(), 100);
    }

    #[test]
    fn test_shard_of_is_stable_and_bounded() {
        for n in 0..32u8 {
            let key = CacheKey::from_raw([n; KEY_LEN]);
            let shard = shard_of(&key, 8);
            assert!(shard < 8);
            assert_eq!(shard, shard_of(&key, 8));
        }
    }

    #[tokio::test]
    async fn test_keys_with_source() {
        let dir = tempfile::tempdir().unwrap();
        let shard = MetaShard::mount(0, dir.path()).unwrap();

        let a = CacheKey::from_strings("origin-a", "v1");
        let b = CacheKey::from_strings("origin-a", "v2");
        let c = CacheKey::from_strings("origin-b", "v1");
        for key in [a, b, c] {
            let mut e = DiskEntry::reserve(key, "x/y.blob".into(), 10);
            e.created_at = now_millis();
            shard.upsert(e).await.unwrap();
        }

        let matched = shard.keys_with_source(&a.source_prefix()).await;
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&a) && matched.contains(&b));
    }
}
