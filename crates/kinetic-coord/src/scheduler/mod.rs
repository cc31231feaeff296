//! In-process job scheduler.
//!
//! Jobs are registered at startup and never persisted. On start, each
//! enabled job's cron expression is turned into a delay to its next
//! occurrence, computed once, and a repeating timer is created with that
//! delay as its period. Daily and weekly jobs therefore settle into a fixed
//! interval after the first run instead of re-aligning to the wall clock.
//!
//! Timers are process-local: every running instance schedules its own copy
//! of each job.

mod cron;
mod ticker;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use kinetic_core::{CoordError, Result, SharedClock, metric_names};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub use self::cron::CronSchedule;
pub use self::ticker::{ManualTicker, TickFn, Ticker, TimerHandle, TokioTicker};

/// Work run by the scheduler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Kind of work, reported as the job's handler type.
    fn handler_type(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run: Option<OffsetDateTime>,
    pub handler_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunReport {
    pub job_id: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-job configuration override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOverride {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Offset used to evaluate daily and weekly expressions, in minutes east of UTC
    #[serde(default)]
    pub utc_offset_minutes: i16,

    /// Maximum run time of a single job execution (seconds)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Overrides keyed by job id
    #[serde(default)]
    pub jobs: HashMap<String, JobOverride>,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_job_timeout_secs() -> u64 {
    300
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            utc_offset_minutes: 0,
            job_timeout_secs: default_job_timeout_secs(),
            jobs: HashMap::new(),
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.offset()?;
        if self.job_timeout_secs == 0 {
            return Err("scheduler.job_timeout_secs must be > 0".to_string());
        }
        for (id, job) in &self.jobs {
            if let Some(cron) = &job.cron {
                CronSchedule::parse(cron).map_err(|e| format!("scheduler.jobs.{id}.cron: {e}"))?;
            }
        }
        Ok(())
    }

    fn offset(&self) -> std::result::Result<UtcOffset, String> {
        let seconds = i32::from(self.utc_offset_minutes) * 60;
        UtcOffset::from_whole_seconds(seconds)
            .map_err(|e| format!("scheduler.utc_offset_minutes out of range: {e}"))
    }
}

struct JobEntry {
    job: ScheduledJob,
    handler: Arc<dyn JobHandler>,
}

pub struct JobScheduler {
    jobs: DashMap<String, JobEntry>,
    timers: DashMap<String, TimerHandle>,
    ticker: Arc<dyn Ticker>,
    clock: SharedClock,
    offset: UtcOffset,
    job_timeout: Duration,
    overrides: HashMap<String, JobOverride>,
    running: AtomicBool,
    this: Weak<JobScheduler>,
}

impl JobScheduler {
    pub fn new(settings: &SchedulerSettings, ticker: Arc<dyn Ticker>, clock: SharedClock) -> Arc<Self> {
        let offset = settings.offset().unwrap_or(UtcOffset::UTC);
        Arc::new_cyclic(|this| Self {
            jobs: DashMap::new(),
            timers: DashMap::new(),
            ticker,
            clock,
            offset,
            job_timeout: Duration::from_secs(settings.job_timeout_secs.max(1)),
            overrides: settings.jobs.clone(),
            running: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Add a job. Configured overrides for `id` replace the cron expression
    /// and enabled flag.
    pub fn register(
        &self,
        id: &str,
        name: &str,
        cron_expression: &str,
        handler: Arc<dyn JobHandler>,
    ) {
        let overrides = self.overrides.get(id).cloned().unwrap_or_default();
        let job = ScheduledJob {
            id: id.to_string(),
            name: name.to_string(),
            cron_expression: overrides.cron.unwrap_or_else(|| cron_expression.to_string()),
            enabled: overrides.enabled.unwrap_or(true),
            last_run: None,
            next_run: None,
            handler_type: handler.handler_type().to_string(),
        };
        let enabled = job.enabled;
        tracing::info!(
            job_id = %id,
            job_name = %name,
            cron_expression = %job.cron_expression,
            enabled,
            "Registered scheduled job"
        );
        // Any timer of a previous registration belongs to the old entry
        self.timers.remove(id);
        self.jobs.insert(id.to_string(), JobEntry { job, handler });

        if enabled && self.is_running() {
            self.schedule_job(id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Create timers for every enabled job.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let enabled: Vec<String> = self
            .jobs
            .iter()
            .filter(|entry| entry.job.enabled)
            .map(|entry| entry.key().clone())
            .collect();
        let scheduled = enabled.iter().filter(|id| self.schedule_job(id)).count();
        tracing::info!(jobs = self.jobs.len(), scheduled, "Job scheduler started");
    }

    /// Cancel every active timer.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.timers.clear();
        for mut entry in self.jobs.iter_mut() {
            entry.job.next_run = None;
        }
        tracing::info!("Job scheduler stopped");
    }

    fn schedule_job(&self, id: &str) -> bool {
        let Some(cron_expression) = self.jobs.get(id).map(|e| e.job.cron_expression.clone()) else {
            return false;
        };

        let schedule = match CronSchedule::parse(&cron_expression) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(
                    job_id = %id,
                    cron_expression = %cron_expression,
                    error = %e,
                    "Unsupported cron expression, job not scheduled"
                );
                if let Some(mut entry) = self.jobs.get_mut(id) {
                    entry.job.next_run = None;
                }
                return false;
            }
        };

        let now = self.clock.now();
        let delay = schedule.delay_from(now.to_offset(self.offset));

        let this = self.this.clone();
        let job_id = id.to_string();
        let tick: TickFn = Arc::new(move || {
            let this = this.clone();
            let job_id = job_id.clone();
            async move {
                if let Some(scheduler) = this.upgrade() {
                    scheduler.run_scheduled(&job_id).await;
                }
            }
            .boxed()
        });

        let handle = self.ticker.every(delay, tick);
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.job.next_run = Some(now + delay);
        }
        self.timers.insert(id.to_string(), handle);

        tracing::debug!(
            job_id = %id,
            schedule = %schedule,
            delay_secs = delay.as_secs(),
            "Job scheduled"
        );
        true
    }

    async fn run_scheduled(&self, id: &str) {
        // Errors are already logged and counted by run_job
        let _ = self.run_job(id).await;

        let period = self.timers.get(id).map(|t| t.period());
        if let (Some(period), Some(mut entry)) = (period, self.jobs.get_mut(id)) {
            entry.job.next_run = Some(self.clock.now() + period);
        }
    }

    /// Run a job once with panic isolation and a timeout.
    async fn run_job(&self, id: &str) -> Result<JobRunReport> {
        let (handler, name) = {
            let entry = self
                .jobs
                .get(id)
                .ok_or_else(|| CoordError::not_found("job", id))?;
            (entry.handler.clone(), entry.job.name.clone())
        };

        let started_at = self.clock.now();
        let started = Instant::now();
        let timeout = self.job_timeout;

        let outcome =
            tokio::time::timeout(timeout, AssertUnwindSafe(handler.run()).catch_unwind()).await;

        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(CoordError::handler_failure(id, e.to_string())),
            Ok(Err(panic)) => {
                let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                Some(CoordError::handler_failure(id, format!("panicked: {panic_msg}")))
            }
            Err(_) => Some(CoordError::handler_failure(
                id,
                format!("timed out after {}s", timeout.as_secs()),
            )),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.job.last_run = Some(started_at);
        }

        let result = match &failure {
            None => {
                tracing::debug!(job_id = %id, job_name = %name, duration_ms, "Job completed");
                "success"
            }
            Some(e) => {
                tracing::error!(
                    job_id = %id,
                    job_name = %name,
                    error = %e,
                    category = %e.category(),
                    duration_ms,
                    "Scheduled job failed"
                );
                "failure"
            }
        };
        metrics::counter!(
            metric_names::SCHEDULER_JOB_RUNS_TOTAL,
            "job" => id.to_string(),
            "result" => result
        )
        .increment(1);

        Ok(JobRunReport {
            job_id: id.to_string(),
            success: failure.is_none(),
            duration_ms,
            error: failure.map(|e| e.to_string()),
        })
    }

    /// Enable or disable a job, recreating or clearing its timer.
    pub fn toggle_job(&self, id: &str, enabled: bool) -> Result<ScheduledJob> {
        {
            let mut entry = self
                .jobs
                .get_mut(id)
                .ok_or_else(|| CoordError::not_found("job", id))?;
            entry.job.enabled = enabled;
            entry.job.next_run = None;
        }
        self.timers.remove(id);
        if enabled && self.is_running() {
            self.schedule_job(id);
        }
        tracing::info!(job_id = %id, enabled, "Scheduled job toggled");
        self.get_job(id).ok_or_else(|| CoordError::not_found("job", id))
    }

    /// Run a job now, outside its timer. Disabled jobs can be run too.
    pub async fn execute_job_manually(&self, id: &str) -> Result<JobRunReport> {
        tracing::info!(job_id = %id, "Manually executing job");
        self.run_job(id).await
    }

    pub fn get_job(&self, id: &str) -> Option<ScheduledJob> {
        self.jobs.get(id).map(|entry| entry.job.clone())
    }

    /// Every registered job, ordered by id.
    pub fn jobs_status(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.iter().map(|entry| entry.job.clone()).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }
}
