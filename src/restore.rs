//! Manifest-driven restore: downloads every file named in a manifest through a
//! bounded parallel pool, rehydrating any cold-tier objects along the way.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::cancel::CancellationToken;
use crate::encryption::EncryptionManager;
use crate::error::{Error, Result};
use crate::incremental::Manifest;
use crate::storage::{ColdRestoreStatus, RetrievalTier, StorageBackend};

const DEFAULT_RESTORE_PARALLELISM: usize = 10;
const COLD_RESTORE_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub manifest_key: String,
    pub destination_dir: PathBuf,
    pub retrieval_tier: RetrievalTier,
    pub parallelism: usize,
}

#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub files_restored: usize,
    pub files_failed: usize,
    pub bytes_restored: u64,
}

pub struct RestoreEngine {
    storage: Arc<dyn StorageBackend>,
}

impl RestoreEngine {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Restore every file named in the manifest at `request.manifest_key` into
    /// `request.destination_dir`, rehydrating cold objects first where needed.
    /// The caller is never asked to poll manually; this call blocks until warm.
    pub async fn restore(
        &self,
        request: &RestoreRequest,
        encryption: Option<&EncryptionManager>,
        token: &CancellationToken,
    ) -> Result<RestoreResult> {
        token.check()?;

        let raw = self.storage.get_bytes(&request.manifest_key).await?;
        let raw = match encryption {
            Some(enc) => enc.decrypt_bytes(&raw)?,
            None => raw,
        };
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| Error::Manifest(format!("could not parse manifest: {e}")))?;

        tokio::fs::create_dir_all(&request.destination_dir).await?;

        let parallelism = if request.parallelism > 0 {
            request.parallelism
        } else {
            DEFAULT_RESTORE_PARALLELISM
        };
        let semaphore = Arc::new(Semaphore::new(parallelism));

        let mut handles = Vec::with_capacity(manifest.files.len());
        for (relative_path, entry) in manifest.files {
            token.check()?;
            let semaphore = semaphore.clone();
            let storage = self.storage.clone();
            let destination_dir = request.destination_dir.clone();
            let tier = request.retrieval_tier;
            let encryption = encryption.cloned();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = restore_one_file(
                    storage.as_ref(),
                    &entry.s3_key,
                    &destination_dir,
                    &relative_path,
                    tier,
                    encryption.as_ref(),
                )
                .await;
                (relative_path, entry.size, outcome)
            }));
        }

        let mut files_restored = 0;
        let mut files_failed = 0;
        let mut bytes_restored = 0u64;

        for handle in handles {
            match handle.await {
                Ok((relative_path, size, Ok(()))) => {
                    files_restored += 1;
                    bytes_restored += size;
                    let _ = relative_path;
                }
                Ok((relative_path, _, Err(e))) => {
                    tracing::warn!(%relative_path, error = %e, "restore failed for file");
                    files_failed += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "restore task panicked");
                    files_failed += 1;
                }
            }
        }

        Ok(RestoreResult {
            files_restored,
            files_failed,
            bytes_restored,
        })
    }
}

async fn restore_one_file(
    storage: &dyn StorageBackend,
    key: &str,
    destination_dir: &Path,
    relative_path: &str,
    tier: RetrievalTier,
    encryption: Option<&EncryptionManager>,
) -> Result<()> {
    ensure_warm(storage, key, tier).await?;

    let target_path = destination_dir.join(relative_path);
    if let Some(parent) = target_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match encryption {
        None => {
            storage.download(key, &target_path).await?;
        }
        Some(enc) => {
            let temp = tempfile::NamedTempFile::new()?;
            storage.download(key, temp.path()).await?;
            enc.decrypt_file(temp.path(), &target_path).await?;
        }
    }
    Ok(())
}

/// Request rehydration and poll until ready. A no-op for objects that are
/// already in a Hot/Cool-IR tier.
async fn ensure_warm(storage: &dyn StorageBackend, key: &str, tier: RetrievalTier) -> Result<()> {
    let head = storage.head(key).await?;
    let is_cold = head
        .storage_class
        .map(|c| c.is_cold())
        .unwrap_or(false);
    if !is_cold {
        return Ok(());
    }

    match storage.check_cold_restore(key).await? {
        ColdRestoreStatus::Ready => return Ok(()),
        ColdRestoreStatus::InProgress => {}
        ColdRestoreStatus::None => {
            storage.initiate_cold_restore(key, tier).await?;
        }
    }

    loop {
        tokio::time::sleep(COLD_RESTORE_POLL_INTERVAL).await;
        if storage.check_cold_restore(key).await? == ColdRestoreStatus::Ready {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parallelism_applies_when_unset() {
        let request = RestoreRequest {
            manifest_key: "x".into(),
            destination_dir: PathBuf::from("/tmp"),
            retrieval_tier: RetrievalTier::Standard,
            parallelism: 0,
        };
        let effective = if request.parallelism > 0 {
            request.parallelism
        } else {
            DEFAULT_RESTORE_PARALLELISM
        };
        assert_eq!(effective, DEFAULT_RESTORE_PARALLELISM);
    }
}
