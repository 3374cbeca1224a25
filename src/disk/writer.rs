//! Data-file writer
//!
//! Writes land in a `.tmp` sibling and are moved into place with a rename,
//! so a reader never observes a half-written artifact at its final path.
//! No fsync is issued; the metadata record is the ground truth and a torn
//! write after a crash is shed as an uncommitted file.

use std::io;
use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::disk::layout::PathLayout;

/// Outcome of a file write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFileOutcome {
    /// The file was written and moved into place
    FileCreated,
    /// The target already existed and was left untouched
    FileAlreadyExists,
    /// An I/O failure; the temp file has been cleaned up
    FileWriteError,
    /// The per-key write lock could not be acquired in time
    LockTimeout,
}

/// Write `bytes` to `target` through a temp file.
///
/// With `recheck_first`, an existing target short-circuits to
/// `FileAlreadyExists` without touching the file.
pub async fn write_file(
    target: &Path,
    bytes: &[u8],
    recheck_first: bool,
    ct: &CancellationToken,
) -> WriteFileOutcome {
    if recheck_first && fs::try_exists(target).await.unwrap_or(false) {
        return WriteFileOutcome::FileAlreadyExists;
    }
    if ct.is_cancelled() {
        return WriteFileOutcome::FileWriteError;
    }

    match write_via_temp(target, bytes).await {
        Ok(()) => WriteFileOutcome::FileCreated,
        Err(err) => {
            debug!(target = %target.display(), %err, "file write failed");
            WriteFileOutcome::FileWriteError
        }
    }
}

async fn write_via_temp(target: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp = PathLayout::temp_path(target);

    let result = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&temp, target).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp).await;
    }
    result
}
