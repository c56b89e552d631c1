//! Durable entities, deriving `sqlx::FromRow` to map directly onto query results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StorageClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum JobKind {
    FileSet,
    /// No engine implements this kind yet. It exists on the data model for
    /// completeness only.
    HostImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum NotificationKind {
    RunFailed,
    RunSuccess,
}

/// A recurring backup specification.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub kind: JobKind,
    /// Ordered list of source paths, stored as JSON for portability across drivers.
    pub source_paths: serde_json::Value,
    pub schedule_expression: String,
    pub enabled: bool,
    pub destination_bucket: String,
    pub destination_prefix: String,
    pub target_storage_class: StorageClass,
    pub include_globs: serde_json::Value,
    pub exclude_globs: serde_json::Value,
    pub retention_keep_last_n: i32,
    /// Unevaluated: fields persist, but GFS-tiered retention is not implemented.
    pub retention_daily: i32,
    pub retention_weekly: i32,
    pub retention_monthly: i32,
    pub bandwidth_limit_bytes_per_sec: Option<i64>,
    pub cpu_limit_percent: Option<i32>,
    pub encryption_enabled: bool,
    pub incremental_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn source_path_list(&self) -> Vec<String> {
        serde_json::from_value(self.source_paths.clone()).unwrap_or_default()
    }

    pub fn include_glob_list(&self) -> Vec<String> {
        serde_json::from_value(self.include_globs.clone()).unwrap_or_default()
    }

    pub fn exclude_glob_list(&self) -> Vec<String> {
        serde_json::from_value(self.exclude_globs.clone()).unwrap_or_default()
    }

    /// Canonical manifest key for this job.
    pub fn manifest_key(&self) -> String {
        format!("{}/{}.manifest.json", self.destination_prefix, self.name)
    }

    /// Consolidated per-file destination key prefix.
    pub fn incremental_prefix(&self) -> String {
        format!("{}/{}/", self.destination_prefix, self.name)
    }

    /// Full-archive destination key.
    pub fn archive_key(&self) -> String {
        if self.encryption_enabled {
            format!("{}/{}.tar.gz.enc", self.destination_prefix, self.name)
        } else {
            format!("{}/{}.tar.gz", self.destination_prefix, self.name)
        }
    }
}

/// One execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BackupRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub snapshot_id: Option<String>,
    pub size_bytes: i64,
    pub files_count: i32,
    pub destination_key: Option<String>,
    pub storage_class: Option<StorageClass>,
    pub error_message: Option<String>,
    pub log_path: Option<String>,
    pub manual_trigger: bool,
}

/// A retained artifact that restore can target.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Snapshot {
    pub id: Uuid,
    pub job_id: Uuid,
    pub backup_run_id: Uuid,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub files_count: i32,
    pub destination_key: String,
    pub manifest_key: Option<String>,
    pub storage_class: StorageClass,
    pub is_incremental: bool,
    pub files_unchanged: i32,
    pub retained: bool,
    pub retention_reason: Option<String>,
}

/// A due notification. Delivery is out of scope; this row is the durable record
/// that one was due.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub job_id: Uuid,
    pub run_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
}

/// Daily aggregate row. At most one row per calendar day.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StorageMetric {
    pub id: Uuid,
    pub metric_date: chrono::NaiveDate,
    pub total_size_bytes: i64,
    pub total_monthly_cost_usd: f64,
    /// `{storage_class: {size_bytes, cost_usd}}`.
    pub size_by_class: serde_json::Value,
    /// `{job_id: {size_bytes, files_count}}`.
    pub per_job_breakdown: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Simple offset/limit pagination.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { offset: 0, limit: 50 }
    }
}
