//! Schedule sweep.
//!
//! A cron job runs [`Scheduler::sweep`] on the configured cadence. Each
//! sweep materializes the due occurrences of active schedules, claims and
//! runs due executions, then ticks instances left `running` by an earlier
//! turn. Claiming is a compare-and-set on the row, so several processes may
//! sweep the same database.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;
use croner::Cron;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, instrument, warn};

use super::deadlines::expire_overdue_interactions;
use crate::config::SchedulerConfig;
use crate::engine::{Executor, TransitionResult, Trigger};
use crate::error::{Error, Result};
use crate::metrics;
use crate::recurrence;
use crate::storage::{
    Activity, ScheduleDefinition, ScheduledExecution, ScheduledStatus, SqliteStorage,
};

/// Occurrences materialized per schedule in one sweep.
const MAX_CATCH_UP: usize = 32;

/// Seconds a `running` instance must sit idle before a sweep ticks it.
/// Keeps the sweep off instances whose first turn is about to start.
const RESUME_IDLE_SECS: i64 = 30;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub materialized: usize,
    pub completed: usize,
    /// Failed attempts left for a later sweep
    pub retried: usize,
    pub failed: usize,
    /// Claimed by another worker first
    pub skipped: usize,
    pub deactivated: usize,
    /// Idle `running` instances that made progress on a tick
    pub resumed: usize,
}

/// Runs the schedule sweep and the interaction deadline sweep.
pub struct Scheduler {
    /// The underlying job scheduler (wrapped for interior mutability)
    job_scheduler: Arc<Mutex<JobScheduler>>,
    executor: Arc<Executor>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Create a new scheduler.
    pub async fn new(executor: Arc<Executor>, config: SchedulerConfig) -> Result<Self> {
        let job_scheduler = JobScheduler::new()
            .await
            .map_err(|e| Error::Internal(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            job_scheduler: Arc::new(Mutex::new(job_scheduler)),
            executor,
            config,
        })
    }

    /// Register the sweep job and start ticking.
    pub async fn start(&self) -> Result<()> {
        info!(cron = %self.config.sweep_cron, "Starting schedule sweep...");

        let executor = self.executor.clone();
        let config = self.config.clone();
        let job = Job::new_async_tz(self.config.sweep_cron.as_str(), Utc, move |_uuid, _lock| {
            let executor = executor.clone();
            let config = config.clone();

            Box::pin(async move {
                let now = Utc::now();
                if let Err(e) = sweep(&executor, &config, now).await {
                    error!(error = %e, "Schedule sweep failed");
                }
                if let Err(e) = expire_overdue_interactions(&executor, now).await {
                    error!(error = %e, "Deadline sweep failed");
                }
            })
        })
        .map_err(|e| {
            Error::Config(format!(
                "Invalid sweep cron '{}': {}",
                self.config.sweep_cron, e
            ))
        })?;

        {
            let sched = self.job_scheduler.lock().await;
            sched
                .add(job)
                .await
                .map_err(|e| Error::Internal(format!("Failed to add sweep job: {}", e)))?;
            sched
                .start()
                .await
                .map_err(|e| Error::Internal(format!("Failed to start scheduler: {}", e)))?;
        }

        info!("Scheduler started");
        Ok(())
    }

    /// Stop the scheduler gracefully.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping scheduler...");

        {
            let mut sched = self.job_scheduler.lock().await;
            sched
                .shutdown()
                .await
                .map_err(|e| Error::Internal(format!("Failed to stop scheduler: {}", e)))?;
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Run one sweep as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        sweep(&self.executor, &self.config, now).await
    }
}

/// Validate and store a new schedule.
pub async fn create_schedule(storage: &SqliteStorage, schedule: &ScheduleDefinition) -> Result<()> {
    recurrence::validate_expression(&schedule.cron)?;
    if !schedule.timezone.trim().is_empty() {
        parse_timezone(&schedule.timezone)?;
    }
    if schedule.form_id.trim().is_empty() {
        return Err(Error::Validation("Schedule needs a form_id".to_string()));
    }
    if schedule.end_at.is_some_and(|end| end <= schedule.start_at) {
        return Err(Error::Validation(
            "Schedule end must be after its start".to_string(),
        ));
    }
    if schedule.repeat_limit == Some(0) {
        return Err(Error::Validation(
            "repeat_limit must be at least 1".to_string(),
        ));
    }
    if !schedule.workflow_id.is_empty()
        && storage.get_workflow(&schedule.workflow_id).await?.is_none()
    {
        return Err(Error::Validation(format!(
            "Unknown workflow '{}'",
            schedule.workflow_id
        )));
    }

    storage.save_schedule(schedule).await?;
    info!(
        schedule_id = %schedule.id,
        cron = %schedule.cron,
        timezone = %schedule.timezone,
        "Schedule created"
    );
    Ok(())
}

/// Materialize due occurrences, claim and run due executions, then resume
/// idle `running` instances.
#[instrument(name = "scheduler.sweep", skip(executor, config))]
pub async fn sweep(
    executor: &Executor,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let storage = executor.storage();
    let mut report = SweepReport::default();

    for schedule in storage.list_schedules(true).await? {
        match materialize(storage, &schedule, &config.default_timezone, now).await {
            Ok((created, deactivated)) => {
                report.materialized += created;
                if deactivated {
                    report.deactivated += 1;
                }
            }
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Failed to materialize schedule");
            }
        }
    }

    for execution in storage.due_executions(now).await? {
        if !storage.claim_execution(&execution).await? {
            debug!(execution_id = %execution.id, "Execution claimed elsewhere");
            report.skipped += 1;
            continue;
        }

        match run_execution(executor, &execution).await {
            Ok(activity_id) => {
                storage.complete_execution(&execution.id, &activity_id).await?;
                metrics::record_scheduled_execution("completed");
                report.completed += 1;
            }
            Err(e) => {
                let status = storage
                    .fail_execution(&execution.id, &e.to_string(), config.max_retries)
                    .await?;
                if status == Some(ScheduledStatus::Failed) {
                    error!(
                        execution_id = %execution.id,
                        schedule_id = %execution.schedule_id,
                        attempts = execution.attempts + 1,
                        error = %e,
                        "Scheduled execution failed permanently"
                    );
                    metrics::record_scheduled_execution("failed");
                    report.failed += 1;
                } else {
                    warn!(
                        execution_id = %execution.id,
                        attempt = execution.attempts + 1,
                        error = %e,
                        "Scheduled execution failed; will retry"
                    );
                    metrics::record_scheduled_execution("retried");
                    report.retried += 1;
                }
            }
        }
    }

    report.resumed = resume_idle_instances(executor, now).await?;

    if report != SweepReport::default() {
        info!(
            materialized = report.materialized,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            deactivated = report.deactivated,
            resumed = report.resumed,
            "Sweep finished"
        );
    }
    Ok(report)
}

/// Tick instances that a turn left `running`: yielded at the step limit,
/// follow-ups past the per-call limit, or follow-ups whose turn errored.
async fn resume_idle_instances(executor: &Executor, now: DateTime<Utc>) -> Result<usize> {
    let idle_before = now - Duration::seconds(RESUME_IDLE_SECS);
    let mut resumed = 0;

    for instance in executor.storage().running_instances(idle_before).await? {
        match executor.advance(&instance.id, Trigger::Tick).await {
            Ok(TransitionResult::NoOp) => {}
            Ok(result) => {
                debug!(
                    instance_id = %instance.id,
                    outcome = result.outcome(),
                    "Idle instance resumed"
                );
                resumed += 1;
            }
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Failed to resume idle instance");
            }
        }
    }
    Ok(resumed)
}

/// Create `pending` rows for every occurrence up to `now`. Returns the
/// number created and whether the schedule was deactivated.
#[instrument(
    name = "schedule.materialize",
    skip(storage, schedule, default_timezone),
    fields(schedule_id = %schedule.id)
)]
async fn materialize(
    storage: &SqliteStorage,
    schedule: &ScheduleDefinition,
    default_timezone: &str,
    now: DateTime<Utc>,
) -> Result<(usize, bool)> {
    let cron = Cron::new(&schedule.cron)
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid cron '{}': {}", schedule.cron, e)))?;
    let timezone = if schedule.timezone.trim().is_empty() {
        parse_timezone(default_timezone)?
    } else {
        parse_timezone(&schedule.timezone)?
    };

    let mut count = storage.count_executions(&schedule.id).await?;
    let (mut from, mut inclusive) = match storage.last_occurrence(&schedule.id).await? {
        Some(last) if last >= schedule.start_at => (last, false),
        _ => (schedule.start_at, true),
    };

    let mut created = 0;
    while created < MAX_CATCH_UP {
        if schedule.repeat_limit.is_some_and(|limit| count >= limit) {
            retire(storage, schedule, "repeat limit reached").await?;
            return Ok((created, true));
        }

        let next = timezone.next_occurrence(&cron, from, inclusive)?;
        if schedule.end_at.is_some_and(|end| next > end) {
            retire(storage, schedule, "end date passed").await?;
            return Ok((created, true));
        }
        if next > now {
            break;
        }

        if storage
            .materialize_execution(&schedule.id, next)
            .await?
            .is_some()
        {
            debug!(scheduled_for = %next, "Occurrence materialized");
            created += 1;
            count += 1;
        }
        from = next;
        inclusive = false;
    }

    Ok((created, false))
}

async fn retire(storage: &SqliteStorage, schedule: &ScheduleDefinition, reason: &str) -> Result<()> {
    if storage.retire_schedule(&schedule.id).await? {
        info!(schedule_id = %schedule.id, reason, "Schedule deactivated");
    }
    Ok(())
}

/// Open the scheduled activity and start its workflow. Returns the
/// activity id.
async fn run_execution(executor: &Executor, execution: &ScheduledExecution) -> Result<String> {
    let storage = executor.storage();
    let schedule = storage
        .get_schedule(&execution.schedule_id)
        .await?
        .ok_or_else(|| {
            Error::Execution(format!("Schedule not found: {}", execution.schedule_id))
        })?;

    let status = storage.initial_status().await?.unwrap_or_default();
    let activity = Activity::new(&schedule.form_id, &schedule.name, status);
    let activity_id = activity.id.clone();

    let started = if schedule.workflow_id.is_empty() {
        executor.open_activity(activity).await?
    } else {
        // Fail before creating the activity so a retry does not leave orphans
        if storage
            .latest_published(&schedule.workflow_id)
            .await?
            .is_none()
        {
            return Err(Error::Workflow(format!(
                "Workflow '{}' has no published definition",
                schedule.workflow_id
            )));
        }
        storage.save_activity(&activity).await?;
        Some(
            executor
                .start_instance(&activity_id, &schedule.workflow_id)
                .await?,
        )
    };

    match started.map(|s| s.result) {
        Some(TransitionResult::Halted { failure }) => {
            warn!(
                execution_id = %execution.id,
                activity_id = %activity_id,
                failure = %failure,
                "Scheduled instance halted"
            );
        }
        Some(result) => {
            info!(
                execution_id = %execution.id,
                activity_id = %activity_id,
                outcome = result.outcome(),
                "Scheduled execution ran"
            );
        }
        None => {
            info!(
                execution_id = %execution.id,
                activity_id = %activity_id,
                "Scheduled activity opened without a workflow"
            );
        }
    }
    Ok(activity_id)
}

#[derive(Debug)]
enum CronTimezone {
    Utc,
    FixedOffset(FixedOffset),
    Named(Tz),
}

impl CronTimezone {
    /// Next occurrence at or after `from` (strictly after unless
    /// `inclusive`), evaluated in this timezone.
    fn next_occurrence(
        &self,
        cron: &Cron,
        from: DateTime<Utc>,
        inclusive: bool,
    ) -> Result<DateTime<Utc>> {
        match self {
            Self::Utc => find_next(cron, &from, inclusive),
            Self::FixedOffset(offset) => find_next(cron, &from.with_timezone(offset), inclusive),
            Self::Named(tz) => find_next(cron, &from.with_timezone(tz), inclusive),
        }
    }
}

fn find_next<T: TimeZone>(cron: &Cron, from: &DateTime<T>, inclusive: bool) -> Result<DateTime<Utc>>
where
    T::Offset: std::fmt::Display,
{
    cron.find_next_occurrence(from, inclusive)
        .map(|next| next.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("No next occurrence after {}: {}", from, e)))
}

fn parse_timezone(raw: &str) -> Result<CronTimezone> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("utc") {
        return Ok(CronTimezone::Utc);
    }

    if let Ok(tz) = trimmed.parse::<Tz>() {
        return Ok(CronTimezone::Named(tz));
    }

    if let Some(offset) = parse_fixed_offset(trimmed) {
        return Ok(CronTimezone::FixedOffset(offset));
    }

    Err(Error::Validation(format!(
        "Invalid timezone '{}'. Use IANA name (e.g. 'America/Sao_Paulo') or UTC offset (e.g. '-03:00')",
        raw
    )))
}

fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None if rest.len() == 4 => (rest[0..2].parse::<i32>().ok()?, rest[2..4].parse::<i32>().ok()?),
        None => return None,
    };

    if hours > 23 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
