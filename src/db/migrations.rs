//! Migration tracking: a version table plus an ordered list of forward migrations
//! for the Job/BackupRun/Snapshot/Notification/StorageMetric schema.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::DbError;

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i32,
    pub name: String,
    pub up: String,
    pub down: String,
    pub applied_at: Option<DateTime<Utc>>,
}

pub struct MigrationManager<'a> {
    pool: &'a PgPool,
}

impl<'a> MigrationManager<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(self.pool)
        .await?;
        Ok(())
    }

    pub async fn current_version(&self) -> Result<i32, DbError> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM _migrations")
                .fetch_optional(self.pool)
                .await?;
        Ok(row.map(|(v,)| v).unwrap_or(0))
    }

    pub async fn apply(&self, migration: &Migration) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(&migration.up).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(&migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(&self, migration: &Migration) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(&migration.down).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM _migrations WHERE version = $1")
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn migrate(&self, migrations: &[Migration]) -> Result<(), DbError> {
        self.init().await?;
        let current = self.current_version().await?;
        let mut pending: Vec<&Migration> = migrations
            .iter()
            .filter(|m| m.version > current)
            .collect();
        pending.sort_by_key(|m| m.version);
        for migration in pending {
            tracing::info!(version = migration.version, name = %migration.name, "applying migration");
            self.apply(migration).await?;
        }
        Ok(())
    }
}

/// The schema for this domain: Job/BackupRun/Snapshot/Notification/StorageMetric.
pub fn default_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        name: "create_base_schema".to_string(),
        up: r#"
            CREATE TABLE jobs (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                source_paths JSONB NOT NULL DEFAULT '[]',
                schedule_expression TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT true,
                destination_bucket TEXT NOT NULL,
                destination_prefix TEXT NOT NULL,
                target_storage_class TEXT NOT NULL,
                include_globs JSONB NOT NULL DEFAULT '[]',
                exclude_globs JSONB NOT NULL DEFAULT '[]',
                retention_keep_last_n INTEGER NOT NULL DEFAULT 7,
                retention_daily INTEGER NOT NULL DEFAULT 0,
                retention_weekly INTEGER NOT NULL DEFAULT 0,
                retention_monthly INTEGER NOT NULL DEFAULT 0,
                bandwidth_limit_bytes_per_sec BIGINT,
                cpu_limit_percent INTEGER,
                encryption_enabled BOOLEAN NOT NULL DEFAULT false,
                incremental_enabled BOOLEAN NOT NULL DEFAULT true,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_run_at TIMESTAMPTZ,
                last_run_status TEXT,
                next_fire_at TIMESTAMPTZ
            );

            CREATE TABLE backup_runs (
                id UUID PRIMARY KEY,
                job_id UUID NOT NULL REFERENCES jobs(id),
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                duration_ms BIGINT,
                snapshot_id TEXT,
                size_bytes BIGINT NOT NULL DEFAULT 0,
                files_count INTEGER NOT NULL DEFAULT 0,
                destination_key TEXT,
                storage_class TEXT,
                error_message TEXT,
                log_path TEXT,
                manual_trigger BOOLEAN NOT NULL DEFAULT false
            );
            CREATE INDEX idx_backup_runs_job_id ON backup_runs(job_id);
            CREATE INDEX idx_backup_runs_status ON backup_runs(status);

            CREATE TABLE snapshots (
                id UUID PRIMARY KEY,
                job_id UUID NOT NULL REFERENCES jobs(id),
                backup_run_id UUID NOT NULL REFERENCES backup_runs(id),
                snapshot_id TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                size_bytes BIGINT NOT NULL DEFAULT 0,
                files_count INTEGER NOT NULL DEFAULT 0,
                destination_key TEXT NOT NULL,
                manifest_key TEXT,
                storage_class TEXT NOT NULL,
                is_incremental BOOLEAN NOT NULL DEFAULT true,
                files_unchanged INTEGER NOT NULL DEFAULT 0,
                retained BOOLEAN NOT NULL DEFAULT true,
                retention_reason TEXT
            );
            CREATE INDEX idx_snapshots_job_id_created_at ON snapshots(job_id, created_at DESC);

            CREATE TABLE notifications (
                id UUID PRIMARY KEY,
                job_id UUID NOT NULL REFERENCES jobs(id),
                run_id UUID REFERENCES backup_runs(id),
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                delivered BOOLEAN NOT NULL DEFAULT false
            );

            CREATE TABLE storage_metrics (
                id UUID PRIMARY KEY,
                metric_date DATE NOT NULL UNIQUE,
                total_size_bytes BIGINT NOT NULL DEFAULT 0,
                total_monthly_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
                size_by_class JSONB NOT NULL DEFAULT '{}',
                per_job_breakdown JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );
        "#
        .to_string(),
        down: r#"
            DROP TABLE IF EXISTS storage_metrics;
            DROP TABLE IF EXISTS notifications;
            DROP TABLE IF EXISTS snapshots;
            DROP TABLE IF EXISTS backup_runs;
            DROP TABLE IF EXISTS jobs;
        "#
        .to_string(),
        applied_at: None,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_migrations_are_ordered_from_one() {
        let migrations = default_migrations();
        assert_eq!(migrations[0].version, 1);
        assert!(migrations[0].up.contains("CREATE TABLE jobs"));
    }
}
