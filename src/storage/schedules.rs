//! Schedule definitions and their materialized executions.
//!
//! Execution rows only move forward: `pending -> started -> completed`,
//! `pending -> canceled`, and `started -> failed` once the retry cap is
//! reached. A failed attempt below the cap keeps the row `started` with
//! `retries` caught up to `attempts`; that state is what marks a row as
//! waiting for another attempt.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::models::*;
use super::sqlite::{parse_datetime_utc, parse_enum_column, parse_optional_datetime};
use super::SqliteStorage;
use crate::error::Result;

const SCHEDULE_COLUMNS: &str = "id, name, workflow_id, form_id, cron, timezone, start_at, \
     end_at, repeat_limit, active, created_at";

const EXECUTION_COLUMNS: &str = "id, schedule_id, scheduled_for, status, retries, attempts, \
     activity_id, error, created_at, updated_at";

impl SqliteStorage {
    // ========================================================================
    // Schedule definitions
    // ========================================================================

    pub async fn save_schedule(&self, schedule: &ScheduleDefinition) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO schedules
                (id, name, workflow_id, form_id, cron, timezone, start_at, end_at,
                 repeat_limit, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                schedule.id,
                schedule.name,
                schedule.workflow_id,
                schedule.form_id,
                schedule.cron,
                schedule.timezone,
                schedule.start_at.to_rfc3339(),
                schedule.end_at.map(|d| d.to_rfc3339()),
                schedule.repeat_limit,
                schedule.active,
                schedule.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleDefinition>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS);
        let schedule = conn
            .query_row(&sql, [id], Self::row_to_schedule)
            .optional()?;
        Ok(schedule)
    }

    pub async fn list_schedules(&self, active_only: bool) -> Result<Vec<ScheduleDefinition>> {
        let conn = self.conn.lock().await;
        let sql = if active_only {
            format!(
                "SELECT {} FROM schedules WHERE active = 1 ORDER BY created_at",
                SCHEDULE_COLUMNS
            )
        } else {
            format!("SELECT {} FROM schedules ORDER BY created_at", SCHEDULE_COLUMNS)
        };
        let mut stmt = conn.prepare(&sql)?;
        let schedules = stmt
            .query_map([], Self::row_to_schedule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(schedules)
    }

    /// Toggle a schedule. Deactivating cancels its pending executions and
    /// returns how many were canceled.
    pub async fn set_schedule_active(&self, id: &str, active: bool) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE schedules SET active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        let canceled = if active {
            0
        } else {
            tx.execute(
                "UPDATE scheduled_executions SET status = 'canceled', updated_at = ?1
                 WHERE schedule_id = ?2 AND status = 'pending'",
                params![Utc::now().to_rfc3339(), id],
            )?
        };
        tx.commit()?;
        Ok(canceled)
    }

    /// Deactivate a schedule that ran out of occurrences. Rows already
    /// materialized still run.
    pub async fn retire_schedule(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE schedules SET active = 0 WHERE id = ?1 AND active = 1",
            [id],
        )?;
        Ok(updated == 1)
    }

    fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleDefinition> {
        Ok(ScheduleDefinition {
            id: row.get(0)?,
            name: row.get(1)?,
            workflow_id: row.get(2)?,
            form_id: row.get(3)?,
            cron: row.get(4)?,
            timezone: row.get(5)?,
            start_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
            end_at: parse_optional_datetime(row.get(7)?)?,
            repeat_limit: row.get(8)?,
            active: row.get(9)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(10)?)?,
        })
    }

    // ========================================================================
    // Scheduled executions
    // ========================================================================

    /// Create the `pending` row for one occurrence. Returns `None` if the
    /// occurrence was already materialized.
    pub async fn materialize_execution(
        &self,
        schedule_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Option<ScheduledExecution>> {
        let now = Utc::now();
        let execution = ScheduledExecution {
            id: uuid::Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_string(),
            scheduled_for,
            status: ScheduledStatus::Pending,
            retries: 0,
            attempts: 0,
            activity_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO scheduled_executions
                (id, schedule_id, scheduled_for, status, retries, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5, ?6)",
            params![
                execution.id,
                execution.schedule_id,
                execution.scheduled_for.to_rfc3339(),
                execution.status.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        Ok((inserted == 1).then_some(execution))
    }

    /// Latest materialized occurrence of a schedule.
    pub async fn last_occurrence(&self, schedule_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let last: Option<String> = conn.query_row(
            "SELECT MAX(scheduled_for) FROM scheduled_executions WHERE schedule_id = ?1",
            [schedule_id],
            |row| row.get(0),
        )?;
        Ok(parse_optional_datetime(last)?)
    }

    /// Occurrences materialized so far, canceled ones included.
    pub async fn count_executions(&self, schedule_id: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM scheduled_executions WHERE schedule_id = ?1",
            [schedule_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Rows ready for an attempt, oldest first: due `pending` rows and
    /// `started` rows whose last attempt failed below the retry cap.
    pub async fn due_executions(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledExecution>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM scheduled_executions
             WHERE scheduled_for <= ?1
               AND (status = 'pending' OR (status = 'started' AND attempts = retries))
             ORDER BY scheduled_for",
            EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map([now.to_rfc3339()], Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(executions)
    }

    /// Claim the next attempt of a row as read by [`Self::due_executions`].
    ///
    /// Compare-and-set on `attempts`: a first attempt moves `pending ->
    /// started`, a retry leaves the row `started`. Only one concurrent
    /// caller wins each attempt.
    pub async fn claim_execution(&self, execution: &ScheduledExecution) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE scheduled_executions
             SET status = 'started', attempts = attempts + 1, updated_at = ?1
             WHERE id = ?2 AND attempts = ?3
               AND (status = 'pending' OR (status = 'started' AND attempts = retries))",
            params![Utc::now().to_rfc3339(), execution.id, execution.attempts],
        )?;
        Ok(updated == 1)
    }

    pub async fn complete_execution(&self, id: &str, activity_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE scheduled_executions
             SET status = 'completed', activity_id = ?1, error = NULL, updated_at = ?2
             WHERE id = ?3 AND status = 'started'",
            params![activity_id, Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated == 1)
    }

    /// Record a failed attempt. The row stays `started` and is offered for
    /// another attempt until `max_retries` failures have been recorded, then
    /// becomes `failed`. Returns the resulting status, or `None` if no
    /// attempt was in flight.
    pub async fn fail_execution(
        &self,
        id: &str,
        error: &str,
        max_retries: u32,
    ) -> Result<Option<ScheduledStatus>> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE scheduled_executions
             SET retries = retries + 1,
                 error = ?1,
                 status = CASE WHEN retries + 1 >= ?2 THEN 'failed' ELSE 'started' END,
                 updated_at = ?3
             WHERE id = ?4 AND status = 'started' AND attempts = retries + 1",
            params![error, max_retries, Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let status: String = conn.query_row(
            "SELECT status FROM scheduled_executions WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(Some(parse_enum_column(0, &status)?))
    }

    pub async fn cancel_execution(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE scheduled_executions SET status = 'canceled', updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated == 1)
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<ScheduledExecution>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM scheduled_executions WHERE id = ?1",
            EXECUTION_COLUMNS
        );
        let execution = conn
            .query_row(&sql, [id], Self::row_to_execution)
            .optional()?;
        Ok(execution)
    }

    pub async fn list_executions(&self, schedule_id: &str) -> Result<Vec<ScheduledExecution>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM scheduled_executions WHERE schedule_id = ?1 ORDER BY scheduled_for",
            EXECUTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map([schedule_id], Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(executions)
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledExecution> {
        Ok(ScheduledExecution {
            id: row.get(0)?,
            schedule_id: row.get(1)?,
            scheduled_for: parse_datetime_utc(&row.get::<_, String>(2)?)?,
            status: parse_enum_column(3, &row.get::<_, String>(3)?)?,
            retries: row.get(4)?,
            attempts: row.get(5)?,
            activity_id: row.get(6)?,
            error: row.get(7)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(9)?)?,
        })
    }
}
