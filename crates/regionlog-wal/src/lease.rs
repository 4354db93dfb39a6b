//! Lease Recovery
//!
//! On a distributed filesystem a dead server may still hold the write lease
//! on its last segment, and until the lease is released the final bytes of
//! that file are not visible to other readers. Crash recovery therefore
//! recovers the lease on every segment of the dead server before splitting.
//!
//! The filesystem side is abstracted behind [`LeaseRecovery`]. A recovery
//! that cannot complete yet reports `Error::LeaseConflict`, which
//! [`recover_leases`] retries with backoff. Exhausting the retries fails
//! loudly with `Error::LeaseRecoveryFailed`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::segment::list_segments;

#[async_trait]
pub trait LeaseRecovery: Send + Sync {
    /// Ensure no other writer holds `path` open.
    async fn recover_lease(&self, path: &Path) -> Result<()>;
}

/// Local filesystems have no leases.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLeaseRecovery;

#[async_trait]
impl LeaseRecovery for LocalLeaseRecovery {
    async fn recover_lease(&self, path: &Path) -> Result<()> {
        // Still confirm the file is there and readable
        tokio::fs::metadata(path).await?;
        Ok(())
    }
}

/// Recover the lease on one file, retrying conflicts per `policy`.
pub async fn recover_lease_with_retry(
    path: &Path,
    recovery: &dyn LeaseRecovery,
    policy: &RetryPolicy,
) -> Result<()> {
    match retry_with_backoff(policy, || recovery.recover_lease(path)).await {
        Ok(()) => {
            debug!(path = ?path, "Lease recovered");
            Ok(())
        }
        Err(e) if e.is_retryable() => {
            warn!(path = ?path, error = %e, "Lease recovery gave up");
            Err(Error::LeaseRecoveryFailed {
                path: path.to_path_buf(),
                attempts: policy.max_attempts(),
            })
        }
        Err(e) => Err(e),
    }
}

/// Recover leases on every segment in `dir`, oldest first. Returns the
/// segments whose leases were recovered.
pub async fn recover_leases(
    dir: &Path,
    recovery: &dyn LeaseRecovery,
    policy: &RetryPolicy,
) -> Result<Vec<PathBuf>> {
    let segments = list_segments(dir, None).await?;
    let mut recovered = Vec::with_capacity(segments.len());

    for (_, path) in segments {
        recover_lease_with_retry(&path, recovery, policy).await?;
        recovered.push(path);
    }

    info!(dir = ?dir, segments = recovered.len(), "Lease recovery complete");
    Ok(recovered)
}
