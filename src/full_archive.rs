//! Full-archive backup engine: bundles every source path into a single gzip-compressed
//! tarball and uploads it as one object, rather than backing up files individually.

use std::path::{Path, PathBuf};

use tokio::task;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::encryption::EncryptionManager;
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, StorageClass};

/// What the engine needs to know about a job to run a full archive.
pub struct FullArchiveJobSpec {
    pub job_id: Uuid,
    pub job_name: String,
    pub source_paths: Vec<PathBuf>,
    pub destination_key: String,
    pub target_class: StorageClass,
    pub encryption: Option<EncryptionManager>,
}

#[derive(Debug, Clone)]
pub struct FullArchiveResult {
    pub size_bytes: u64,
    pub files_count: usize,
    pub destination_key: String,
}

pub struct FullArchiveEngine {
    storage: std::sync::Arc<dyn StorageBackend>,
}

impl FullArchiveEngine {
    pub fn new(storage: std::sync::Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Build a gzip-compressed tar of every source path, overwriting any previous
    /// archive at the same key. Full archives carry no history: each run replaces
    /// the last one outright.
    pub async fn run(
        &self,
        spec: &FullArchiveJobSpec,
        logger: &crate::worker::RunLogger,
        token: &CancellationToken,
    ) -> Result<FullArchiveResult> {
        token.check()?;

        let work_dir = tempfile::tempdir()?;
        let archive_path = work_dir.path().join("archive.tar.gz");

        let source_paths = spec.source_paths.clone();
        let archive_path_for_build = archive_path.clone();
        let (files_count, raw_size) = task::spawn_blocking(move || {
            build_tar_gz(&source_paths, &archive_path_for_build)
        })
        .await
        .map_err(|e| Error::Other(format!("archive build task panicked: {e}")))??;

        logger.log(&format!(
            "built archive with {files_count} files, {raw_size} bytes compressed"
        ));

        token.check()?;

        let upload_path = match &spec.encryption {
            None => archive_path.clone(),
            Some(enc) => {
                let encrypted_path = work_dir.path().join("archive.tar.gz.enc");
                enc.encrypt_file(&archive_path, &encrypted_path).await?;
                encrypted_path
            }
        };

        self.storage
            .upload(&upload_path, &spec.destination_key, spec.target_class, None)
            .await?;

        let final_size = tokio::fs::metadata(&upload_path).await?.len();

        Ok(FullArchiveResult {
            size_bytes: final_size,
            files_count,
            destination_key: spec.destination_key.clone(),
        })
    }
}

/// Synchronous tar+gzip build; run inside `spawn_blocking` since `tar`/`flate2` are
/// not async. Returns (files_count, compressed_size_bytes).
fn build_tar_gz(source_paths: &[PathBuf], archive_path: &Path) -> Result<(usize, u64)> {
    let file = std::fs::File::create(archive_path)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut files_count = 0usize;
    for root in source_paths {
        if !root.exists() {
            continue;
        }
        let root_name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());

        if root.is_file() {
            builder.append_path_with_name(root, &root_name)?;
            files_count += 1;
            continue;
        }

        for entry in walkdir::WalkDir::new(root) {
            let entry = entry.map_err(|e| Error::Other(format!("walk error: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let archive_name = PathBuf::from(&root_name).join(relative);
            builder.append_path_with_name(entry.path(), &archive_name)?;
            files_count += 1;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;

    let compressed_size = std::fs::metadata(archive_path)?.len();
    Ok((files_count, compressed_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_archive_with_expected_file_count() {
        let source_dir = tempfile::tempdir().unwrap();
        std::fs::write(source_dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(source_dir.path().join("b.txt"), b"world").unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let archive_path = out_dir.path().join("out.tar.gz");

        let (files_count, size) =
            build_tar_gz(&[source_dir.path().to_path_buf()], &archive_path).unwrap();

        assert_eq!(files_count, 2);
        assert!(size > 0);
        assert!(archive_path.exists());
    }

    #[test]
    fn missing_source_path_is_skipped_not_fatal() {
        let out_dir = tempfile::tempdir().unwrap();
        let archive_path = out_dir.path().join("out.tar.gz");
        let missing = PathBuf::from("/nonexistent/path/for/this/test");

        let (files_count, _) = build_tar_gz(&[missing], &archive_path).unwrap();
        assert_eq!(files_count, 0);
    }
}
