//! Schedule grammar and dispatch: polls enabled jobs on an interval, determines
//! which are due via the `cron` crate, and dispatches due jobs into the worker.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::db::models::Job;
use crate::db::repository::JobRepository;
use crate::error::{Error, Result};
use crate::worker::Worker;

/// One of the named shorthand presets accepted alongside raw 5-field cron
/// expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preset {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Preset {
    fn as_cron(&self) -> &'static str {
        match self {
            Preset::Hourly => "0 0 * * * *",
            Preset::Daily => "0 0 0 * * *",
            Preset::Weekly => "0 0 0 * * SUN",
            Preset::Monthly => "0 0 0 1 * *",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Some(Preset::Hourly),
            "daily" => Some(Preset::Daily),
            "weekly" => Some(Preset::Weekly),
            "monthly" => Some(Preset::Monthly),
            _ => None,
        }
    }
}

/// Fallback used when an expression cannot be parsed at all: falls back to a daily
/// schedule and logs a warning, rather than refusing to run the job.
const FALLBACK_CRON: &str = "0 0 0 * * *";

/// Resolve a job's `schedule_expression` into a `cron::Schedule`, accepting:
///  - raw 6-field cron expressions (seconds-first, per the `cron` crate convention)
///  - the presets `hourly`/`daily`/`weekly`/`monthly`
///  - `@every_Nm` / `@every_Nh` / `@every_Nd` shorthand
/// and falling back to a daily schedule with a logged warning if none apply.
pub fn parse_schedule(expression: &str) -> Schedule {
    if let Some(preset) = Preset::parse(expression) {
        return Schedule::from_str(preset.as_cron()).expect("preset cron strings are valid");
    }

    if let Some(shorthand) = parse_every_shorthand(expression) {
        if let Ok(schedule) = Schedule::from_str(&shorthand) {
            return schedule;
        }
    }

    match Schedule::from_str(expression) {
        Ok(schedule) => schedule,
        Err(e) => {
            tracing::warn!(
                expression,
                error = %e,
                "could not parse schedule expression; falling back to daily"
            );
            Schedule::from_str(FALLBACK_CRON).expect("fallback cron string is valid")
        }
    }
}

/// Parses `@every_Nm`/`@every_Nh`/`@every_Nd` into an equivalent cron expression.
/// Minute-granularity intervals only; this is a convenience shorthand, not a general
/// interval scheduler.
fn parse_every_shorthand(expression: &str) -> Option<String> {
    let rest = expression.trim().strip_prefix("@every_")?;
    let unit = rest.chars().last()?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() == rest.len() {
        return None;
    }
    let n: u32 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }

    match unit {
        'm' => Some(format!("0 0/{n} * * * *")),
        'h' => Some(format!("0 0 0/{n} * * *")),
        'd' => Some(format!("0 0 0 1/{n} * *")),
        _ => None,
    }
}

pub fn next_fire_time(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_schedule(expression).after(&after).next()
}

/// Polls the job table for due work and dispatches into the worker. One instance runs
/// for the lifetime of the daemon process.
pub struct Scheduler {
    pool: sqlx::PgPool,
    worker: Arc<Worker>,
}

impl Scheduler {
    pub fn new(pool: sqlx::PgPool, worker: Arc<Worker>) -> Self {
        Self { pool, worker }
    }

    /// One polling tick: find enabled jobs whose `next_fire_at` has passed, dispatch
    /// each (skipping ones already running per single-flight), and advance
    /// `next_fire_at` for every job considered. Returns the number dispatched.
    pub async fn tick(&self) -> Result<usize> {
        let repo = JobRepository::new(&self.pool);
        let jobs = repo.find_all_enabled().await?;
        let now = Utc::now();
        let mut dispatched = 0;

        for job in jobs {
            if !self.is_due(&job, now) {
                continue;
            }

            let next = next_fire_time(&job.schedule_expression, now);
            repo.set_next_fire_at(job.id, next).await?;

            if self.worker.is_running(job.id) {
                tracing::info!(job_id = %job.id, "skipping dispatch: run already in flight");
                continue;
            }

            let worker = self.worker.clone();
            let job_id = job.id;
            tokio::spawn(async move {
                if let Err(e) = worker.trigger_run(job_id, false).await {
                    tracing::error!(job_id = %job_id, error = %e, "scheduled run failed to start");
                }
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    fn is_due(&self, job: &Job, now: DateTime<Utc>) -> bool {
        match job.next_fire_at {
            Some(next) => next <= now,
            None => true, // never scheduled: fire on first tick after creation/restart.
        }
    }

    /// Run `tick` on an interval until cancelled. `poll_interval` should be much
    /// shorter than the finest schedule granularity in use (a minute, typically).
    pub async fn run(&self, poll_interval: std::time::Duration) -> Result<()> {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "scheduler tick failed");
            }
        }
    }
}

/// Surfaced to callers who want a parse without the daily-fallback behavior, e.g. a
/// future admin-facing validation endpoint.
pub fn try_parse_schedule(expression: &str) -> Result<Schedule> {
    if let Some(preset) = Preset::parse(expression) {
        return Schedule::from_str(preset.as_cron())
            .map_err(|e| Error::Scheduling(e.to_string()));
    }
    if let Some(shorthand) = parse_every_shorthand(expression) {
        return Schedule::from_str(&shorthand).map_err(|e| Error::Scheduling(e.to_string()));
    }
    Schedule::from_str(expression).map_err(|e| Error::Scheduling(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_hourly_parses() {
        let schedule = parse_schedule("hourly");
        let next = schedule.after(&Utc::now()).next();
        assert!(next.is_some());
    }

    #[test]
    fn every_shorthand_parses_minutes() {
        let cron_str = parse_every_shorthand("@every_15m").unwrap();
        assert!(Schedule::from_str(&cron_str).is_ok());
    }

    #[test]
    fn every_shorthand_rejects_garbage_unit() {
        assert!(parse_every_shorthand("@every_15x").is_none());
    }

    #[test]
    fn unparseable_expression_falls_back_to_daily() {
        let now = Utc::now();
        let schedule = parse_schedule("not a real schedule");
        let fallback = Schedule::from_str(FALLBACK_CRON).unwrap();
        assert_eq!(schedule.after(&now).next(), fallback.after(&now).next());
    }

    #[test]
    fn raw_cron_expression_is_used_directly() {
        assert!(try_parse_schedule("0 30 4 * * *").is_ok());
    }
}
