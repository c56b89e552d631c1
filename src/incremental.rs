//! Incremental backup engine: scans a job's source paths, compares each file's
//! signature against the previous manifest, uploads only what changed, and writes
//! a new manifest that's the union of carried-over and freshly uploaded entries.
//!
//! Scanning and uploading both run through bounded semaphore-gated worker pools
//! rather than sequential loops, and uploads that fail with a retryable error get
//! a second chance through a dedicated retry queue once the main pass finishes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::encryption::EncryptionManager;
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, StorageClass};

/// Files at or above this size are hashed by prefix+size instead of in full.
const SMALL_FILE_THRESHOLD_BYTES: u64 = 1024 * 1024;

/// A file's signature: unchanged iff all three components match the previous entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub size: u64,
    pub mtime: f64,
    pub hash: String,
}

/// One entry in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub mtime: f64,
    pub hash: String,
    pub s3_key: String,
}

/// The authoritative per-snapshot file index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub snapshot_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub job_id: Uuid,
    pub total_files: usize,
    pub files: HashMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn empty(job_id: Uuid, snapshot_id: String) -> Self {
        Self {
            snapshot_id,
            created_at: chrono::Utc::now(),
            job_id,
            total_files: 0,
            files: HashMap::new(),
        }
    }
}

/// Result summary returned to the worker.
#[derive(Debug, Clone)]
pub struct IncrementalResult {
    pub snapshot_id: String,
    pub size_bytes: u64,
    pub files_count: usize,
    pub destination_prefix: String,
    pub manifest_key: Option<String>,
    pub files_unchanged: usize,
    pub total_files_scanned: usize,
    pub upload_errors: usize,
}

/// What the engine needs to know about a job to run; deliberately decoupled from
/// `db::models::Job` so engines don't depend on the metadata store directly.
pub struct IncrementalJobSpec {
    pub job_id: Uuid,
    pub job_name: String,
    pub source_paths: Vec<PathBuf>,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    pub destination_prefix: String,
    pub target_class: StorageClass,
    pub encryption: Option<EncryptionManager>,
    pub scan_parallelism: usize,
    pub upload_parallelism: usize,
}

struct ScannedFile {
    relative_path: String,
    absolute_path: PathBuf,
    signature: Signature,
}

pub struct IncrementalEngine {
    storage: Arc<dyn StorageBackend>,
}

impl IncrementalEngine {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Run one incremental backup for `spec`: load the previous manifest, scan,
    /// upload what changed, then write the updated manifest.
    pub async fn run(
        &self,
        spec: &IncrementalJobSpec,
        logger: &crate::worker::RunLogger,
        token: &CancellationToken,
    ) -> Result<IncrementalResult> {
        let manifest_key = format!("{}/{}.manifest.json", spec.destination_prefix, spec.job_name);

        // Phase 1: load previous manifest.
        let previous = self.load_previous_manifest(&manifest_key, spec).await?;

        // Phase 2: scan.
        token.check()?;
        let (to_backup, unchanged_count, total_scanned) =
            self.scan(spec, previous.as_ref(), logger, token).await?;

        logger.log(&format!(
            "scan complete: {} to back up, {} unchanged, {} scanned",
            to_backup.len(),
            unchanged_count,
            total_scanned
        ));

        // Phase 3: no-op short circuit.
        if to_backup.is_empty() {
            return Ok(IncrementalResult {
                snapshot_id: new_snapshot_id(),
                size_bytes: 0,
                files_count: 0,
                destination_prefix: spec.destination_prefix.clone(),
                manifest_key: None,
                files_unchanged: unchanged_count,
                total_files_scanned: total_scanned,
                upload_errors: 0,
            });
        }

        token.check()?;

        // Phase 4: upload, with a second-chance retry queue for retryable failures.
        let (uploaded, upload_errors) = self
            .upload_all(spec, &to_backup, logger, token)
            .await?;

        // Phase 5: manifest write — union of previous entries (for unchanged files)
        // and newly uploaded entries.
        let snapshot_id = new_snapshot_id();
        let mut files = previous
            .as_ref()
            .map(|m| m.files.clone())
            .unwrap_or_default();

        let mut size_bytes: u64 = 0;
        for (relative_path, entry) in &uploaded {
            files.insert(relative_path.clone(), entry.clone());
            size_bytes += entry.size;
        }

        let manifest = Manifest {
            snapshot_id: snapshot_id.clone(),
            created_at: chrono::Utc::now(),
            job_id: spec.job_id,
            total_files: files.len(),
            files,
        };

        self.write_manifest(&manifest_key, &manifest, spec)
            .await
            .map_err(|e| {
                Error::Manifest(format!("failed to write manifest at {manifest_key}: {e}"))
            })?;

        // Phase 6: return.
        Ok(IncrementalResult {
            snapshot_id,
            size_bytes,
            files_count: uploaded.len(),
            destination_prefix: spec.destination_prefix.clone(),
            manifest_key: Some(manifest_key),
            files_unchanged: unchanged_count,
            total_files_scanned: total_scanned,
            upload_errors,
        })
    }

    async fn load_previous_manifest(
        &self,
        manifest_key: &str,
        spec: &IncrementalJobSpec,
    ) -> Result<Option<Manifest>> {
        if !self.storage.exists(manifest_key).await? {
            return Ok(None);
        }
        let raw = self.storage.get_bytes(manifest_key).await?;
        let raw = match &spec.encryption {
            Some(enc) => enc.decrypt_bytes(&raw)?,
            None => raw,
        };
        let manifest: Manifest = serde_json::from_slice(&raw)?;
        Ok(Some(manifest))
    }

    async fn write_manifest(
        &self,
        manifest_key: &str,
        manifest: &Manifest,
        spec: &IncrementalJobSpec,
    ) -> Result<()> {
        let raw = serde_json::to_vec_pretty(manifest)?;
        let raw = match &spec.encryption {
            Some(enc) => enc.encrypt_bytes(&raw)?,
            None => raw,
        };
        self.storage
            .put_bytes(manifest_key, raw, StorageClass::Hot)
            .await
    }

    fn build_globset(patterns: &[String]) -> Result<globset::GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::Other(format!("invalid glob '{pattern}': {e}")))?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| Error::Other(format!("failed to build glob set: {e}")))
    }

    /// Walk every source path, applying include/exclude globs, and compute the
    /// signature of every candidate file via a bounded worker pool
    ///
    async fn scan(
        &self,
        spec: &IncrementalJobSpec,
        previous: Option<&Manifest>,
        logger: &crate::worker::RunLogger,
        token: &CancellationToken,
    ) -> Result<(Vec<ScannedFile>, usize, usize)> {
        let include = Self::build_globset(&spec.include_globs)?;
        let exclude = Self::build_globset(&spec.exclude_globs)?;

        let mut candidates: Vec<(PathBuf, String)> = Vec::new();
        for (path_index, root) in spec.source_paths.iter().enumerate() {
            token.check()?;
            if path_index > 0 && path_index % 1 == 0 {
                // Cancellation checkpoint: between source paths.
            }
            if !root.exists() {
                logger.warn(&format!("source path does not exist: {}", root.display()));
                continue;
            }

            let mut file_count_in_root = 0u64;
            for entry in walkdir::WalkDir::new(root)
                .into_iter()
                .filter_entry(|e| !is_excluded_dir(e, root, &exclude))
            {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        logger.warn(&format!("walk error: {e}"));
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");

                if !include.is_empty() && !include.is_match(&relative) {
                    continue;
                }
                if exclude.is_match(&relative) {
                    continue;
                }

                candidates.push((entry.path().to_path_buf(), relative));

                file_count_in_root += 1;
                if file_count_in_root % 100 == 0 {
                    token.check()?; // "every 100 files during traversal"
                }
            }
        }

        token.check()?; // "between scan phase and upload phase"

        let total_scanned = candidates.len();
        let semaphore = Arc::new(Semaphore::new(spec.scan_parallelism.max(1)));
        let mut handles = Vec::with_capacity(candidates.len());

        for (absolute_path, relative_path) in candidates {
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let signature = compute_signature(&absolute_path).await;
                (relative_path, absolute_path, signature)
            }));
        }

        let mut to_backup = Vec::new();
        let mut unchanged_count = 0usize;
        let mut skipped = 0usize;

        for handle in handles {
            match handle.await {
                Ok((relative_path, absolute_path, Ok(signature))) => {
                    let unchanged = previous
                        .and_then(|m| m.files.get(&relative_path))
                        .map(|prev| {
                            prev.size == signature.size
                                && prev.mtime == signature.mtime
                                && prev.hash == signature.hash
                        })
                        .unwrap_or(false);

                    if unchanged {
                        unchanged_count += 1;
                    } else {
                        to_backup.push(ScannedFile {
                            relative_path,
                            absolute_path,
                            signature,
                        });
                    }
                }
                Ok((relative_path, _, Err(e))) => {
                    logger.warn(&format!("skipping unreadable file {relative_path}: {e}"));
                    skipped += 1;
                }
                Err(e) => {
                    logger.warn(&format!("scan task panicked: {e}"));
                    skipped += 1;
                }
            }
        }

        let _ = skipped; // counted via log only, not surfaced on the result.
        Ok((to_backup, unchanged_count, total_scanned))
    }

    /// Upload every file in `to_backup` via a bounded pool, draining a second-chance
    /// retry queue afterward.
    async fn upload_all(
        &self,
        spec: &IncrementalJobSpec,
        to_backup: &[ScannedFile],
        logger: &crate::worker::RunLogger,
        token: &CancellationToken,
    ) -> Result<(HashMap<String, ManifestEntry>, usize)> {
        let semaphore = Arc::new(Semaphore::new(spec.upload_parallelism.max(1)));
        let retry_queue: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let uploaded: Arc<Mutex<HashMap<String, ManifestEntry>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let permanent_failures = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(to_backup.len());
        for (index, file) in to_backup.iter().enumerate() {
            token.check()?; // "before every per-file upload"
            let semaphore = semaphore.clone();
            let storage = self.storage.clone();
            let uploaded = uploaded.clone();
            let retry_queue = retry_queue.clone();
            let destination_prefix = spec.destination_prefix.clone();
            let job_name = spec.job_name.clone();
            let target_class = spec.target_class;
            let encryption = spec.encryption.clone();
            let relative_path = file.relative_path.clone();
            let absolute_path = file.absolute_path.clone();
            let permanent_failures = permanent_failures.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = upload_one_file(
                    storage.as_ref(),
                    &destination_prefix,
                    &job_name,
                    &relative_path,
                    &absolute_path,
                    target_class,
                    encryption.as_ref(),
                )
                .await;

                match result {
                    Ok(entry) => {
                        uploaded.lock().await.insert(relative_path, entry);
                    }
                    Err(e) if e.is_retryable() => {
                        retry_queue.lock().await.push(index);
                    }
                    Err(e) => {
                        tracing::warn!(%relative_path, error = %e, "upload permanently failed, not retrying");
                        permanent_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        // Drain the second-chance queue with §4.1 backoff.
        let pending_indices = retry_queue.lock().await.clone();
        let mut upload_errors = 0usize;
        let retry_policy = crate::retry::RetryPolicy::default();

        for index in pending_indices {
            token.check()?; // "before every retry"
            let file = &to_backup[index];
            let result = crate::retry::retry_with_backoff(
                &retry_policy,
                |_attempt| {
                    upload_one_file(
                        self.storage.as_ref(),
                        &spec.destination_prefix,
                        &spec.job_name,
                        &file.relative_path,
                        &file.absolute_path,
                        spec.target_class,
                        spec.encryption.as_ref(),
                    )
                },
                |e: &Error| e.is_retryable(),
            )
            .await;

            match result {
                Ok(entry) => {
                    uploaded.lock().await.insert(file.relative_path.clone(), entry);
                }
                Err(e) => {
                    logger.warn(&format!(
                        "upload failed after retries for {}: {e}",
                        file.relative_path
                    ));
                    upload_errors += 1;
                }
            }
        }

        let uploaded = Arc::try_unwrap(uploaded)
            .map(|m| m.into_inner())
            .unwrap_or_default();
        upload_errors += permanent_failures.load(std::sync::atomic::Ordering::Relaxed);
        Ok((uploaded, upload_errors))
    }
}

async fn upload_one_file(
    storage: &dyn StorageBackend,
    destination_prefix: &str,
    job_name: &str,
    relative_path: &str,
    absolute_path: &Path,
    target_class: StorageClass,
    encryption: Option<&EncryptionManager>,
) -> Result<ManifestEntry> {
    let signature = compute_signature(absolute_path).await?;
    let destination_key = format!("{destination_prefix}/{job_name}/{relative_path}");

    match encryption {
        None => {
            storage.upload(absolute_path, &destination_key, target_class, None).await?;
        }
        Some(enc) => {
            let temp = tempfile::NamedTempFile::new()?;
            enc.encrypt_file(absolute_path, temp.path()).await?;
            storage
                .upload(temp.path(), &destination_key, target_class, None)
                .await?;
            // `temp` is removed on drop regardless of the outcome above.
        }
    }

    Ok(ManifestEntry {
        size: signature.size,
        mtime: signature.mtime,
        hash: signature.hash,
        s3_key: destination_key,
    })
}

/// §4.4.1: full hash below the small-file threshold, else `first_MiB || ascii(size)`.
async fn compute_signature(path: &Path) -> Result<Signature> {
    let metadata = tokio::fs::metadata(path).await?;
    let size = metadata.len();
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let hash = if size < SMALL_FILE_THRESHOLD_BYTES {
        hash_whole_file(path).await?
    } else {
        hash_prefix_plus_size(path, size).await?
    };

    Ok(Signature { size, mtime, hash })
}

async fn hash_whole_file(path: &Path) -> Result<String> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(hasher.finalize()))
}

async fn hash_prefix_plus_size(path: &Path, size: u64) -> Result<String> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut prefix = vec![0u8; SMALL_FILE_THRESHOLD_BYTES as usize];
    let mut filled = 0usize;
    while filled < prefix.len() {
        let n = file.read(&mut prefix[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    prefix.truncate(filled);

    let mut hasher = Sha256::new();
    hasher.update(&prefix);
    hasher.update(size.to_string().as_bytes());
    Ok(hex_encode(hasher.finalize()))
}

fn hex_encode(bytes: impl AsRef<[u8]>) -> String {
    bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

fn is_excluded_dir(entry: &walkdir::DirEntry, root: &Path, exclude: &globset::GlobSet) -> bool {
    if !entry.file_type().is_dir() || entry.path() == root {
        return false;
    }
    let relative = entry
        .path()
        .strip_prefix(root)
        .unwrap_or(entry.path())
        .to_string_lossy()
        .replace('\\', "/");
    exclude.is_match(&relative)
}

fn new_snapshot_id() -> String {
    format!("{}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"), Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_file_hashes_in_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let sig_a = compute_signature(&path).await.unwrap();
        let sig_b = compute_signature(&path).await.unwrap();
        assert_eq!(sig_a, sig_b);
        assert_eq!(sig_a.size, 11);
    }

    #[tokio::test]
    async fn changed_small_file_changes_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let before = compute_signature(&path).await.unwrap();

        tokio::fs::write(&path, b"hello world!!").await.unwrap();
        let after = compute_signature(&path).await.unwrap();

        assert_ne!(before.hash, after.hash);
        assert_ne!(before.size, after.size);
    }

    #[tokio::test]
    async fn large_file_uses_prefix_plus_size_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("large.bin");
        let mut data = vec![0u8; (SMALL_FILE_THRESHOLD_BYTES + 10) as usize];
        data[SMALL_FILE_THRESHOLD_BYTES as usize + 5] = 0xFF; // a tail-only change
        tokio::fs::write(&path, &data).await.unwrap();
        let before = compute_signature(&path).await.unwrap();

        // Mutate only past the first MiB: the prefix+size hash must not change.
        let mut data2 = data.clone();
        data2[SMALL_FILE_THRESHOLD_BYTES as usize + 6] = 0xAB;
        tokio::fs::write(&path, &data2).await.unwrap();
        let after = compute_signature(&path).await.unwrap();

        assert_eq!(before.hash, after.hash);
        assert_eq!(before.size, after.size);
    }
}
