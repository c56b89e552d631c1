//! Storage cost metrics and trend projection: walk each job's object listing,
//! aggregate size and cost by storage class, and upsert a daily rollup row.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::StorageMetric;
use crate::db::repository::{JobRepository, StorageMetricRepository};
use crate::error::Result;
use crate::storage::{StorageBackend, StorageClass};

/// Per-GiB-month list pricing used for the cost projection. This is a simple
/// fixed table, not a full multi-provider pricing engine.
fn monthly_cost_per_gib(class: StorageClass) -> f64 {
    match class {
        StorageClass::Hot => 0.023,
        StorageClass::CoolIr => 0.0125,
        StorageClass::CoolFlex => 0.0125,
        StorageClass::Deep => 0.00099,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassBreakdown {
    pub size_bytes: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobBreakdown {
    pub size_bytes: u64,
    pub files_count: u64,
}

/// A month-over-month linear trend, extrapolated from the last two daily samples.
/// A simple linear projection is sufficient here; no seasonal model is needed.
#[derive(Debug, Clone, Copy)]
pub struct CostProjection {
    pub current_monthly_usd: f64,
    pub projected_next_month_usd: f64,
}

pub struct MetricsCollector {
    pool: sqlx::PgPool,
    storage: Arc<dyn StorageBackend>,
}

impl MetricsCollector {
    pub fn new(pool: sqlx::PgPool, storage: Arc<dyn StorageBackend>) -> Self {
        Self { pool, storage }
    }

    /// Walk every enabled job's destination prefix, total up size by storage class and
    /// by job, compute the day's cost, and upsert the `storage_metrics` row for today.
    /// At most one row per calendar day.
    pub async fn collect_daily(&self) -> Result<StorageMetric> {
        let jobs = JobRepository::new(&self.pool).find_all_enabled().await?;

        let mut size_by_class: HashMap<StorageClass, u64> = HashMap::new();
        let mut per_job: HashMap<Uuid, JobBreakdown> = HashMap::new();
        let mut total_size: u64 = 0;

        for job in &jobs {
            let prefix = job.incremental_prefix();
            let objects = self.storage.list(&prefix).await?;

            let mut job_size = 0u64;
            for object in &objects {
                let size = object.size;
                let class = object.storage_class.unwrap_or(job.target_storage_class);
                *size_by_class.entry(class).or_insert(0) += size;
                job_size += size;
                total_size += size;
            }

            per_job.insert(
                job.id,
                JobBreakdown {
                    size_bytes: job_size,
                    files_count: objects.len() as u64,
                },
            );
        }

        let mut size_by_class_json = HashMap::new();
        let mut total_cost = 0.0;
        for (class, size) in &size_by_class {
            let cost = bytes_to_gib(*size) * monthly_cost_per_gib(*class);
            total_cost += cost;
            size_by_class_json.insert(
                format!("{class:?}").to_uppercase(),
                ClassBreakdown {
                    size_bytes: *size,
                    cost_usd: cost,
                },
            );
        }

        let metric = StorageMetric {
            id: Uuid::new_v4(),
            metric_date: chrono::Utc::now().date_naive(),
            total_size_bytes: total_size as i64,
            total_monthly_cost_usd: total_cost,
            size_by_class: serde_json::to_value(&size_by_class_json)?,
            per_job_breakdown: serde_json::to_value(&per_job)?,
            created_at: chrono::Utc::now(),
        };

        StorageMetricRepository::new(&self.pool).upsert(&metric).await?;
        Ok(metric)
    }

    /// A linear projection from the most recent two daily samples. Returns `None`
    /// when fewer than two samples exist yet.
    pub async fn project_cost(&self) -> Result<Option<CostProjection>> {
        let recent = StorageMetricRepository::new(&self.pool).recent(2).await?;
        if recent.len() < 2 {
            return Ok(None);
        }
        let current = recent[0].total_monthly_cost_usd;
        let previous = recent[1].total_monthly_cost_usd;
        let daily_delta = current - previous;
        let projected = current + daily_delta * 30.0;

        Ok(Some(CostProjection {
            current_monthly_usd: current,
            projected_next_month_usd: projected.max(0.0),
        }))
    }
}

fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_ranks_deep_cheapest() {
        assert!(monthly_cost_per_gib(StorageClass::Deep) < monthly_cost_per_gib(StorageClass::Hot));
        assert!(
            monthly_cost_per_gib(StorageClass::CoolIr)
                <= monthly_cost_per_gib(StorageClass::Hot)
        );
    }

    #[test]
    fn gib_conversion_is_exact_for_one_gib() {
        assert!((bytes_to_gib(1024 * 1024 * 1024) - 1.0).abs() < 1e-9);
    }
}
