//! Run lifecycle: enforces single-flight execution per job, recovers runs orphaned
//! by a previous process crash, and dispatches each run into the incremental or
//! full-archive engine depending on the job's configuration.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::db::models::{BackupRun, Job, NotificationKind, RunStatus};
use crate::db::repository::{
    BackupRunRepository, JobRepository, NotificationRepository, SnapshotRepository,
};
use crate::encryption::EncryptionManager;
use crate::error::{Error, Result};
use crate::full_archive::{FullArchiveEngine, FullArchiveJobSpec};
use crate::incremental::{IncrementalEngine, IncrementalJobSpec};
use crate::storage::StorageBackend;

/// A fraction of files failing to upload at or below this threshold still counts as
/// an overall success. Above it, the run is FAILED.
const PARTIAL_SUCCESS_MAX_ERROR_RATIO: f64 = 0.05;

/// Minimal per-run logger: writes to a file under `log_dir` and mirrors to `tracing`.
pub struct RunLogger {
    run_id: Uuid,
    file: tokio::sync::Mutex<Option<std::fs::File>>,
    path: PathBuf,
}

impl RunLogger {
    pub fn new(log_dir: &str, run_id: Uuid) -> std::io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = PathBuf::from(log_dir).join(format!("{run_id}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            run_id,
            file: tokio::sync::Mutex::new(Some(file)),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn log(&self, message: &str) {
        tracing::info!(run_id = %self.run_id, "{message}");
        self.append(message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(run_id = %self.run_id, "{message}");
        self.append(message);
    }

    fn append(&self, message: &str) {
        use std::io::Write;
        if let Ok(mut guard) = self.file.try_lock() {
            if let Some(file) = guard.as_mut() {
                let _ = writeln!(file, "[{}] {}", chrono::Utc::now().to_rfc3339(), message);
            }
        }
    }
}

/// Orchestrates job execution: single-flight enforcement, orphan recovery, retention
/// pruning, and notification recording.
pub struct Worker {
    pool: PgPool,
    storage: Arc<dyn StorageBackend>,
    running: DashMap<Uuid, CancellationToken>,
    log_dir: String,
    encryption_passphrase: Option<String>,
    encryption_salt: Option<String>,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        storage: Arc<dyn StorageBackend>,
        log_dir: String,
        encryption_passphrase: Option<String>,
        encryption_salt: Option<String>,
    ) -> Self {
        Self {
            pool,
            storage,
            running: DashMap::new(),
            log_dir,
            encryption_passphrase,
            encryption_salt,
        }
    }

    /// Sweep every `RUNNING` row to `FAILED` on startup: a prior process exited
    /// mid-run, so these runs cannot still be in progress.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let runs = BackupRunRepository::new(&self.pool).find_running().await?;
        let count = runs.len();
        for run in runs {
            tracing::warn!(run_id = %run.id, job_id = %run.job_id, "recovering orphaned run");
            BackupRunRepository::new(&self.pool)
                .finish(
                    run.id,
                    RunStatus::Failed,
                    run.size_bytes,
                    run.files_count,
                    run.destination_key,
                    run.storage_class,
                    Some("orphaned: process restarted mid-run".to_string()),
                    run.snapshot_id,
                )
                .await?;
            self.notify_failure(run.job_id, run.id, "orphaned: process restarted mid-run")
                .await?;
        }
        Ok(count)
    }

    /// True if a run for `job_id` is currently tracked as in flight.
    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.running.contains_key(&job_id)
    }

    /// Request cancellation of an in-flight run for `job_id`. No-op if not running.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        if let Some(token) = self.running.get(&job_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Execute one run of `job_id`, enforcing at most one in-flight run per job.
    /// Returns the finished `BackupRun`.
    pub async fn trigger_run(&self, job_id: Uuid, manual_trigger: bool) -> Result<BackupRun> {
        if self.running.contains_key(&job_id) {
            return Err(Error::InvalidState(format!(
                "job {job_id} already has a run in flight"
            )));
        }

        let job = JobRepository::new(&self.pool).find_by_id(job_id).await?;
        let token = CancellationToken::new();
        self.running.insert(job_id, token.clone());

        let outcome = self.execute(&job, manual_trigger, &token).await;
        self.running.remove(&job_id);
        outcome
    }

    async fn execute(
        &self,
        job: &Job,
        manual_trigger: bool,
        token: &CancellationToken,
    ) -> Result<BackupRun> {
        let pending = BackupRunRepository::new(&self.pool)
            .create_pending(job.id, manual_trigger)
            .await?;
        let logger = RunLogger::new(&self.log_dir, pending.id)
            .map_err(|e| Error::Other(format!("failed to open run log: {e}")))?;
        BackupRunRepository::new(&self.pool)
            .set_log_path(pending.id, &logger.path().to_string_lossy())
            .await?;

        BackupRunRepository::new(&self.pool)
            .mark_running(pending.id)
            .await?;
        logger.log(&format!("run {} started for job '{}'", pending.id, job.name));

        let encryption = self.build_encryption_manager(job)?;
        let result = if job.incremental_enabled {
            self.run_incremental(job, &pending, &encryption, &logger, token)
                .await
        } else {
            self.run_full_archive(job, &pending, &encryption, &logger, token)
                .await
        };

        let finished = match result {
            Ok(outcome) => {
                logger.log(&format!(
                    "run {} finished: {:?}, {} bytes, {} files",
                    pending.id, outcome.status, outcome.size_bytes, outcome.files_count
                ));
                let finished = BackupRunRepository::new(&self.pool)
                    .finish(
                        pending.id,
                        outcome.status,
                        outcome.size_bytes as i64,
                        outcome.files_count as i32,
                        outcome.destination_key.clone(),
                        Some(job.target_storage_class),
                        outcome.error_message.clone(),
                        outcome.snapshot_id.clone(),
                    )
                    .await?;

                if let Some(snapshot_id) = &outcome.snapshot_id {
                    SnapshotRepository::new(&self.pool)
                        .create(
                            job.id,
                            pending.id,
                            snapshot_id,
                            outcome.size_bytes as i64,
                            outcome.files_count as i32,
                            outcome.destination_key.as_deref().unwrap_or_default(),
                            outcome.manifest_key.as_deref(),
                            job.target_storage_class,
                            job.incremental_enabled,
                            outcome.files_unchanged as i32,
                        )
                        .await?;
                    self.prune_retention(job).await?;
                }

                if outcome.status == RunStatus::Failed {
                    self.notify_failure(
                        job.id,
                        pending.id,
                        outcome.error_message.as_deref().unwrap_or("run failed"),
                    )
                    .await?;
                }

                finished
            }
            Err(Error::Cancelled) => {
                logger.warn(&format!("run {} cancelled", pending.id));
                BackupRunRepository::new(&self.pool)
                    .finish(
                        pending.id,
                        RunStatus::Cancelled,
                        0,
                        0,
                        None,
                        None,
                        Some("cancelled".to_string()),
                        None,
                    )
                    .await?
            }
            Err(e) => {
                logger.warn(&format!("run {} failed: {e}", pending.id));
                let finished = BackupRunRepository::new(&self.pool)
                    .finish(
                        pending.id,
                        RunStatus::Failed,
                        0,
                        0,
                        None,
                        None,
                        Some(e.to_string()),
                        None,
                    )
                    .await?;
                self.notify_failure(job.id, pending.id, &e.to_string()).await?;
                finished
            }
        };

        JobRepository::new(&self.pool)
            .record_run_outcome(job.id, finished.status, chrono::Utc::now())
            .await?;

        Ok(finished)
    }

    fn build_encryption_manager(&self, job: &Job) -> Result<Option<EncryptionManager>> {
        if !job.encryption_enabled {
            return Ok(None);
        }
        let passphrase = self.encryption_passphrase.as_deref().ok_or_else(|| {
            Error::Configuration("encryption enabled for job but no passphrase configured".into())
        })?;
        let salt = self.encryption_salt.as_deref().ok_or_else(|| {
            Error::Configuration("encryption enabled for job but no salt configured".into())
        })?;
        Ok(Some(EncryptionManager::from_passphrase(passphrase, salt)?))
    }

    async fn run_incremental(
        &self,
        job: &Job,
        run: &BackupRun,
        encryption: &Option<EncryptionManager>,
        logger: &RunLogger,
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        let _ = run;
        let spec = IncrementalJobSpec {
            job_id: job.id,
            job_name: job.name.clone(),
            source_paths: job.source_path_list().into_iter().map(PathBuf::from).collect(),
            include_globs: job.include_glob_list(),
            exclude_globs: job.exclude_glob_list(),
            destination_prefix: job.destination_prefix.clone(),
            target_class: job.target_storage_class,
            encryption: encryption.clone(),
            scan_parallelism: 4,
            upload_parallelism: 4,
        };

        let engine = IncrementalEngine::new(self.storage.clone());
        let result = engine.run(&spec, logger, token).await?;

        let error_ratio = if result.total_files_scanned == 0 {
            0.0
        } else {
            result.upload_errors as f64 / result.total_files_scanned as f64
        };

        let status = if result.upload_errors == 0 {
            RunStatus::Success
        } else if error_ratio <= PARTIAL_SUCCESS_MAX_ERROR_RATIO {
            logger.warn(&format!(
                "{} of {} files failed to upload ({:.1}%); within partial-success threshold",
                result.upload_errors,
                result.total_files_scanned,
                error_ratio * 100.0
            ));
            RunStatus::Success
        } else {
            RunStatus::Failed
        };

        let error_message = if result.upload_errors > 0 {
            Some(format!("{} files failed to upload", result.upload_errors))
        } else {
            None
        };

        Ok(RunOutcome {
            status,
            size_bytes: result.size_bytes,
            files_count: result.files_count,
            destination_key: Some(job.incremental_prefix()),
            manifest_key: result.manifest_key,
            snapshot_id: Some(result.snapshot_id),
            files_unchanged: result.files_unchanged,
            error_message,
        })
    }

    async fn run_full_archive(
        &self,
        job: &Job,
        run: &BackupRun,
        encryption: &Option<EncryptionManager>,
        logger: &RunLogger,
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        let _ = run;
        let destination_key = job.archive_key();
        let spec = FullArchiveJobSpec {
            job_id: job.id,
            job_name: job.name.clone(),
            source_paths: job.source_path_list().into_iter().map(PathBuf::from).collect(),
            destination_key: destination_key.clone(),
            target_class: job.target_storage_class,
            encryption: encryption.clone(),
        };

        let engine = FullArchiveEngine::new(self.storage.clone());
        let result = engine.run(&spec, logger, token).await?;

        Ok(RunOutcome {
            status: RunStatus::Success,
            size_bytes: result.size_bytes,
            files_count: result.files_count,
            destination_key: Some(result.destination_key),
            manifest_key: None,
            snapshot_id: Some(format!("{}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"), job.id)),
            files_unchanged: 0,
            error_message: None,
        })
    }

    /// Keep-last-N pruning only: no GFS tiers, no remote deletion, just flipping
    /// `retained` past the job's configured keep count.
    async fn prune_retention(&self, job: &Job) -> Result<()> {
        let repo = SnapshotRepository::new(&self.pool);
        let retained = repo.retained_ordered(job.id).await?;
        let keep = job.retention_keep_last_n.max(0) as usize;
        if retained.len() <= keep {
            return Ok(());
        }
        for snapshot in retained.into_iter().skip(keep) {
            repo.clear_retained(snapshot.id, "exceeded retention_keep_last_n").await?;
        }
        Ok(())
    }

    async fn notify_failure(&self, job_id: Uuid, run_id: Uuid, message: &str) -> Result<()> {
        NotificationRepository::new(&self.pool)
            .create(job_id, Some(run_id), NotificationKind::RunFailed, message)
            .await?;
        Ok(())
    }
}

struct RunOutcome {
    status: RunStatus,
    size_bytes: u64,
    files_count: usize,
    destination_key: Option<String>,
    manifest_key: Option<String>,
    snapshot_id: Option<String>,
    files_unchanged: usize,
    error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_success_threshold_is_five_percent() {
        assert!((PARTIAL_SUCCESS_MAX_ERROR_RATIO - 0.05).abs() < f64::EPSILON);
    }
}
