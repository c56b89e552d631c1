//! Repository layer: `find_by_id`/`find_all`/`create`/`update`/`count` with
//! offset/limit pagination. All dynamic SQL uses bind parameters — see DESIGN.md.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;

use super::models::{
    BackupRun, Job, Notification, Pagination, RunStatus, Snapshot, StorageMetric,
};

pub struct JobRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> JobRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Job, DbError> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Job>, DbError> {
        Ok(sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool)
            .await?)
    }

    pub async fn find_all_enabled(&self) -> Result<Vec<Job>, DbError> {
        Ok(
            sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE enabled = true ORDER BY name")
                .fetch_all(self.pool)
                .await?,
        )
    }

    pub async fn find_all(&self, pagination: Pagination) -> Result<Vec<Job>, DbError> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs ORDER BY name OFFSET $1 LIMIT $2",
        )
        .bind(pagination.offset)
        .bind(pagination.limit)
        .fetch_all(self.pool)
        .await?)
    }

    /// Job names are unique, enforced here via the `UNIQUE` constraint on
    /// `jobs.name`; a duplicate name surfaces as a `DbError::Sql`.
    pub async fn create(&self, job: &Job) -> Result<Job, DbError> {
        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, name, kind, source_paths, schedule_expression, enabled,
                destination_bucket, destination_prefix, target_storage_class,
                include_globs, exclude_globs, retention_keep_last_n, retention_daily,
                retention_weekly, retention_monthly, bandwidth_limit_bytes_per_sec,
                cpu_limit_percent, encryption_enabled, incremental_enabled,
                created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(job.kind)
        .bind(&job.source_paths)
        .bind(&job.schedule_expression)
        .bind(job.enabled)
        .bind(&job.destination_bucket)
        .bind(&job.destination_prefix)
        .bind(job.target_storage_class)
        .bind(&job.include_globs)
        .bind(&job.exclude_globs)
        .bind(job.retention_keep_last_n)
        .bind(job.retention_daily)
        .bind(job.retention_weekly)
        .bind(job.retention_monthly)
        .bind(job.bandwidth_limit_bytes_per_sec)
        .bind(job.cpu_limit_percent)
        .bind(job.encryption_enabled)
        .bind(job.incremental_enabled)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(self.pool)
        .await
        .map_err(DbError::from)
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), DbError> {
        sqlx::query("UPDATE jobs SET enabled = $1, updated_at = $2 WHERE id = $3")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_run_outcome(
        &self,
        id: Uuid,
        status: RunStatus,
        run_at: chrono::DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE jobs SET last_run_at = $1, last_run_status = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(run_at)
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_next_fire_at(
        &self,
        id: Uuid,
        next_fire_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE jobs SET next_fire_at = $1 WHERE id = $2")
            .bind(next_fire_at)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), DbError> {
        // Deletion cancels the schedule (caller's responsibility) but leaves historical
        // runs/snapshots intact, so only the job row is removed.
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64, DbError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}

pub struct BackupRunRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> BackupRunRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<BackupRun, DbError> {
        sqlx::query_as::<_, BackupRun>("SELECT * FROM backup_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("backup_run {id}")))
    }

    pub async fn find_running(&self) -> Result<Vec<BackupRun>, DbError> {
        Ok(sqlx::query_as::<_, BackupRun>(
            "SELECT * FROM backup_runs WHERE status = 'RUNNING'",
        )
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn find_by_job(
        &self,
        job_id: Uuid,
        pagination: Pagination,
    ) -> Result<Vec<BackupRun>, DbError> {
        Ok(sqlx::query_as::<_, BackupRun>(
            "SELECT * FROM backup_runs WHERE job_id = $1 ORDER BY started_at DESC OFFSET $2 LIMIT $3",
        )
        .bind(job_id)
        .bind(pagination.offset)
        .bind(pagination.limit)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn create_pending(&self, job_id: Uuid, manual_trigger: bool) -> Result<BackupRun, DbError> {
        sqlx::query_as::<_, BackupRun>(
            r#"
            INSERT INTO backup_runs (id, job_id, status, started_at, size_bytes, files_count, manual_trigger)
            VALUES ($1, $2, 'PENDING', $3, 0, 0, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(Utc::now())
        .bind(manual_trigger)
        .fetch_one(self.pool)
        .await
        .map_err(DbError::from)
    }

    pub async fn mark_running(&self, id: Uuid) -> Result<(), DbError> {
        sqlx::query("UPDATE backup_runs SET status = 'RUNNING' WHERE id = $1 AND status = 'PENDING'")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        size_bytes: i64,
        files_count: i32,
        destination_key: Option<String>,
        storage_class: Option<crate::storage::StorageClass>,
        error_message: Option<String>,
        snapshot_id: Option<String>,
    ) -> Result<BackupRun, DbError> {
        let completed_at = Utc::now();
        sqlx::query_as::<_, BackupRun>(
            r#"
            UPDATE backup_runs SET
                status = $1,
                completed_at = $2,
                duration_ms = EXTRACT(EPOCH FROM ($2 - started_at)) * 1000,
                size_bytes = $3,
                files_count = $4,
                destination_key = $5,
                storage_class = $6,
                error_message = $7,
                snapshot_id = $8
            WHERE id = $9
            RETURNING *
            "#,
        )
        .bind(status)
        .bind(completed_at)
        .bind(size_bytes)
        .bind(files_count)
        .bind(destination_key)
        .bind(storage_class)
        .bind(error_message)
        .bind(snapshot_id)
        .bind(id)
        .fetch_one(self.pool)
        .await
        .map_err(DbError::from)
    }

    pub async fn set_log_path(&self, id: Uuid, log_path: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE backup_runs SET log_path = $1 WHERE id = $2")
            .bind(log_path)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

pub struct SnapshotRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> SnapshotRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Snapshot, DbError> {
        sqlx::query_as::<_, Snapshot>("SELECT * FROM snapshots WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("snapshot {id}")))
    }

    /// The most recently created snapshot for a job that is still retained.
    pub async fn latest_retained(&self, job_id: Uuid) -> Result<Option<Snapshot>, DbError> {
        Ok(sqlx::query_as::<_, Snapshot>(
            "SELECT * FROM snapshots WHERE job_id = $1 AND retained = true ORDER BY created_at DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(self.pool)
        .await?)
    }

    pub async fn retained_ordered(&self, job_id: Uuid) -> Result<Vec<Snapshot>, DbError> {
        Ok(sqlx::query_as::<_, Snapshot>(
            "SELECT * FROM snapshots WHERE job_id = $1 AND retained = true ORDER BY created_at DESC",
        )
        .bind(job_id)
        .fetch_all(self.pool)
        .await?)
    }

    pub async fn all_retained(&self) -> Result<Vec<Snapshot>, DbError> {
        Ok(
            sqlx::query_as::<_, Snapshot>("SELECT * FROM snapshots WHERE retained = true")
                .fetch_all(self.pool)
                .await?,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        job_id: Uuid,
        backup_run_id: Uuid,
        snapshot_id: &str,
        size_bytes: i64,
        files_count: i32,
        destination_key: &str,
        manifest_key: Option<&str>,
        storage_class: crate::storage::StorageClass,
        is_incremental: bool,
        files_unchanged: i32,
    ) -> Result<Snapshot, DbError> {
        sqlx::query_as::<_, Snapshot>(
            r#"
            INSERT INTO snapshots (
                id, job_id, backup_run_id, snapshot_id, created_at, size_bytes,
                files_count, destination_key, manifest_key, storage_class,
                is_incremental, files_unchanged, retained
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,true)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(backup_run_id)
        .bind(snapshot_id)
        .bind(Utc::now())
        .bind(size_bytes)
        .bind(files_count)
        .bind(destination_key)
        .bind(manifest_key)
        .bind(storage_class)
        .bind(is_incremental)
        .bind(files_unchanged)
        .fetch_one(self.pool)
        .await
        .map_err(DbError::from)
    }

    /// Retention only ever flips this flag; it never deletes a row or a remote object.
    pub async fn clear_retained(&self, id: Uuid, reason: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE snapshots SET retained = false, retention_reason = $1 WHERE id = $2")
            .bind(reason)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_destination_key(&self, id: Uuid, key: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE snapshots SET destination_key = $1 WHERE id = $2")
            .bind(key)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_manifest_key(&self, id: Uuid, key: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE snapshots SET manifest_key = $1 WHERE id = $2")
            .bind(key)
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

pub struct NotificationRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> NotificationRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        job_id: Uuid,
        run_id: Option<Uuid>,
        kind: super::models::NotificationKind,
        message: &str,
    ) -> Result<Notification, DbError> {
        sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (id, job_id, run_id, kind, message, created_at, delivered)
            VALUES ($1, $2, $3, $4, $5, $6, false)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(run_id)
        .bind(kind)
        .bind(message)
        .bind(Utc::now())
        .fetch_one(self.pool)
        .await
        .map_err(DbError::from)
    }

    pub async fn undelivered(&self) -> Result<Vec<Notification>, DbError> {
        Ok(sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE delivered = false ORDER BY created_at",
        )
        .fetch_all(self.pool)
        .await?)
    }
}

pub struct StorageMetricRepository<'a> {
    pool: &'a PgPool,
}

impl<'a> StorageMetricRepository<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Upsert by date: at most one row per calendar day.
    pub async fn upsert(&self, metric: &StorageMetric) -> Result<StorageMetric, DbError> {
        sqlx::query_as::<_, StorageMetric>(
            r#"
            INSERT INTO storage_metrics (
                id, metric_date, total_size_bytes, total_monthly_cost_usd,
                size_by_class, per_job_breakdown, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (metric_date) DO UPDATE SET
                total_size_bytes = EXCLUDED.total_size_bytes,
                total_monthly_cost_usd = EXCLUDED.total_monthly_cost_usd,
                size_by_class = EXCLUDED.size_by_class,
                per_job_breakdown = EXCLUDED.per_job_breakdown
            RETURNING *
            "#,
        )
        .bind(metric.id)
        .bind(metric.metric_date)
        .bind(metric.total_size_bytes)
        .bind(metric.total_monthly_cost_usd)
        .bind(&metric.size_by_class)
        .bind(&metric.per_job_breakdown)
        .bind(metric.created_at)
        .fetch_one(self.pool)
        .await
        .map_err(DbError::from)
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<StorageMetric>, DbError> {
        Ok(sqlx::query_as::<_, StorageMetric>(
            "SELECT * FROM storage_metrics ORDER BY metric_date DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?)
    }
}
