/*!
Cron scheduling.

[`Scheduler`] owns a set of named jobs, each pairing a cron expression and a
timezone with an async task. Once started, every job runs on its own tokio
task that sleeps until the next fire time or until shutdown is signalled.
Expressions use either the classic five fields (minute precision) or the six
and seven field forms with seconds (and years).
*/

pub mod daemon;
pub mod jobs;

use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use self::daemon::{SchedulerState, STATE_FILE, STOP_FILE};
pub use self::jobs::{register_backup_jobs, run_scheduled_tier, trigger_backup};

type JobTask = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Parse a cron expression
///
/// Five-field expressions are read with classic crontab semantics (Sunday is
/// day 0 or 7) and converted to the seconds-first form by prepending `0`.
///
/// # Errors
/// Returns a schedule error for malformed expressions.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let normalized = normalize_cron(expression)?;
    Schedule::from_str(&normalized).map_err(|e| {
        BackupError::schedule(format!("Invalid cron expression '{expression}': {e}"))
    })
}

/// Resolve an IANA timezone name such as `Europe/Berlin`
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| BackupError::config(format!("Unknown timezone '{name}': {e}")))
}

/// Next time `schedule` fires strictly after `after`, evaluated in `timezone`
pub fn next_fire_after(schedule: &Schedule, timezone: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&timezone))
        .next()
        .map(|at| at.with_timezone(&Utc))
}

fn normalize_cron(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let day_of_week = crontab_day_of_week(fields[4])?;
            Ok(format!("0 {} {day_of_week}", fields[..4].join(" ")))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(BackupError::schedule(format!(
            "Cron expression '{expression}' has {n} fields, expected 5, 6 or 7"
        ))),
    }
}

/// Translate crontab day-of-week numbers (0-7, Sunday = 0 or 7) into the
/// 1-7 numbering (Sunday = 1) used by the seconds-first form
fn crontab_day_of_week(field: &str) -> Result<String> {
    let shift = |raw: &str| -> Result<u32> {
        let day: u32 = raw
            .parse()
            .map_err(|_| BackupError::schedule(format!("Invalid day of week '{raw}'")))?;
        if day > 7 {
            return Err(BackupError::schedule(format!("Day of week {day} is out of range")));
        }
        Ok(day % 7 + 1)
    };
    let is_number = |raw: &str| !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit());

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let translated = match range.split_once('-') {
            Some((start, end)) if is_number(start) && is_number(end) => {
                let (start_day, end_raw) = (shift(start)?, end.parse::<u32>().unwrap_or(0));
                if end_raw == 7 && step.is_none() {
                    // Sunday at the end of a range wraps to the start of the week
                    items.push(format!("{start_day}-7"));
                    items.push("1".to_string());
                    continue;
                }
                format!("{start_day}-{}", shift(end)?)
            }
            None if is_number(range) => shift(range)?.to_string(),
            _ => range.to_string(),
        };
        items.push(match step {
            Some(step) => format!("{translated}/{step}"),
            None => translated,
        });
    }
    Ok(items.join(","))
}

/// Snapshot of one job for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub expression: String,
    pub timezone: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub running: bool,
}

#[derive(Debug, Default)]
struct JobState {
    last_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
    running: bool,
}

struct Job {
    name: String,
    expression: String,
    schedule: Schedule,
    timezone: Tz,
    task: JobTask,
    state: Mutex<JobState>,
}

impl Job {
    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_fire_after(&self.schedule, self.timezone, after)
    }

    /// Run the task once, capturing errors and panics
    async fn execute(&self) -> Result<()> {
        let started = Utc::now();
        {
            let mut state = self.state();
            state.running = true;
            state.last_run = Some(started);
        }
        info!(job = %self.name, "Running scheduled job");

        let result = match tokio::spawn((self.task)()).await {
            Ok(result) => result,
            Err(e) => Err(BackupError::schedule(format!("Job {} panicked: {e}", self.name))),
        };

        let mut state = self.state();
        state.running = false;
        match &result {
            Ok(()) => {
                state.last_error = None;
                info!(job = %self.name, "Scheduled job finished");
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                error!(job = %self.name, error = %e, "Scheduled job failed");
            }
        }
        result
    }

    fn status(&self, now: DateTime<Utc>) -> JobStatus {
        let state = self.state();
        JobStatus {
            name: self.name.clone(),
            expression: self.expression.clone(),
            timezone: self.timezone.name().to_string(),
            next_run: self.next_after(now),
            last_run: state.last_run,
            last_error: state.last_error.clone(),
            running: state.running,
        }
    }
}

/// Cron scheduler for async jobs
///
/// # Example
/// ```rust,no_run
/// use inkvault_core::schedule::{parse_timezone, Scheduler};
///
/// # async fn run() -> inkvault_core::Result<()> {
/// let mut scheduler = Scheduler::new();
/// scheduler.register("heartbeat", "*/5 * * * *", parse_timezone("UTC")?, || async {
///     tracing::info!("still here");
///     Ok(())
/// })?;
/// scheduler.start()?;
/// // ...
/// scheduler.stop_all().await;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Arc<Job>>,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job
    ///
    /// # Arguments
    /// * `name` - Unique job name, used by [`Scheduler::trigger`]
    /// * `expression` - Cron expression (5, 6 or 7 fields)
    /// * `timezone` - Zone the expression is evaluated in
    /// * `task` - Factory producing one run of the job
    ///
    /// # Errors
    /// Fails for duplicate names, invalid expressions, or when the scheduler
    /// is already running.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        expression: &str,
        timezone: Tz,
        task: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        if self.is_running() {
            return Err(BackupError::schedule(format!(
                "Cannot register job {name} while the scheduler is running"
            )));
        }
        if self.jobs.iter().any(|job| job.name == name) {
            return Err(BackupError::schedule(format!("Job {name} is already registered")));
        }
        let schedule = parse_cron(expression)?;
        let task: JobTask = Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(task()) });

        debug!(job = %name, expression, timezone = %timezone.name(), "Registered job");
        self.jobs.push(Arc::new(Job {
            name,
            expression: expression.to_string(),
            schedule,
            timezone,
            task,
            state: Mutex::new(JobState::default()),
        }));
        Ok(())
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.name.clone()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Next fire time of `name` strictly after `after`
    ///
    /// Pure with respect to the clock, so it can be used to test schedules.
    pub fn next_fire(&self, name: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.find(name).ok()?.next_after(after)
    }

    /// Spawn one task per job; must be called inside a tokio runtime
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(BackupError::schedule("Scheduler is already running"));
        }
        let (tx, rx) = watch::channel(false);
        for job in &self.jobs {
            self.handles
                .push(tokio::spawn(run_job(Arc::clone(job), rx.clone())));
        }
        self.shutdown = Some(tx);
        info!(jobs = self.jobs.len(), "Scheduler started");
        Ok(())
    }

    /// Signal every job to stop and wait for them
    ///
    /// A job that is currently running finishes its run first.
    pub async fn stop_all(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    /// Run a job immediately, outside its schedule
    pub async fn trigger(&self, name: &str) -> Result<()> {
        self.find(name)?.execute().await
    }

    pub fn status(&self) -> Vec<JobStatus> {
        let now = Utc::now();
        self.jobs.iter().map(|job| job.status(now)).collect()
    }

    fn find(&self, name: &str) -> Result<&Arc<Job>> {
        self.jobs
            .iter()
            .find(|job| job.name == name)
            .ok_or_else(|| BackupError::schedule(format!("Unknown job: {name}")))
    }
}

async fn run_job(job: Arc<Job>, mut shutdown: watch::Receiver<bool>) {
    let mut last_fire: Option<DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        let reference = last_fire.map_or(now, |fired| fired.max(now));
        let Some(next) = job.next_after(reference) else {
            info!(job = %job.name, "No upcoming fire time, job finished");
            return;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        debug!(job = %job.name, next = %next, "Waiting for next fire time");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                last_fire = Some(next);
                // Errors are recorded in the job state; the schedule continues.
                let _ = job.execute().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(job = %job.name, "Job received shutdown");
                    return;
                }
            }
        }
    }
}
