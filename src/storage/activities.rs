//! Activities, workflow instances and per-step history.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::models::*;
use super::sqlite::{parse_datetime_utc, parse_enum_column, parse_json_column, parse_optional_datetime};
use super::SqliteStorage;
use crate::error::Result;

const ACTIVITY_COLUMNS: &str = "id, form_id, name, description, protocol, status, due_date, \
     parent_id, users, fields, created_at, updated_at, finished_at";

const INSTANCE_COLUMNS: &str =
    "id, activity_id, definition_id, cursor, status, version, error, created_at, updated_at, finished_at";

impl SqliteStorage {
    // ========================================================================
    // Activity operations
    // ========================================================================

    /// Insert or overwrite an activity.
    pub async fn save_activity(&self, activity: &Activity) -> Result<()> {
        let status = serde_json::to_string(&activity.status)?;
        let users = serde_json::to_string(&activity.users)?;
        let fields = serde_json::to_string(&activity.fields)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO activities
                (id, form_id, name, description, protocol, status, due_date, parent_id,
                 users, fields, created_at, updated_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                protocol = excluded.protocol,
                status = excluded.status,
                due_date = excluded.due_date,
                parent_id = excluded.parent_id,
                users = excluded.users,
                fields = excluded.fields,
                updated_at = excluded.updated_at,
                finished_at = excluded.finished_at",
            params![
                activity.id,
                activity.form_id,
                activity.name,
                activity.description,
                activity.protocol,
                status,
                activity.due_date.map(|d| d.to_rfc3339()),
                activity.parent_id,
                users,
                fields,
                activity.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
                activity.finished_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Overwrite only the field values of an activity.
    pub async fn update_activity_fields(&self, id: &str, fields: &[FormField]) -> Result<bool> {
        let fields = serde_json::to_string(fields)?;
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE activities SET fields = ?1, updated_at = ?2 WHERE id = ?3",
            params![fields, Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }

    /// Overwrite only the status of an activity. A terminal status also
    /// stamps `finished_at` unless it is already set.
    pub async fn update_activity_status(&self, id: &str, status: &StatusRef) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let finished_at = status.kind.is_terminal().then(|| now.clone());
        let status = serde_json::to_string(status)?;
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE activities
             SET status = ?1, updated_at = ?2, finished_at = COALESCE(finished_at, ?3)
             WHERE id = ?4",
            params![status, now, finished_at, id],
        )?;
        Ok(updated > 0)
    }

    /// Stamp `finished_at` once; later calls keep the first timestamp.
    pub async fn mark_activity_finished(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE activities
             SET finished_at = COALESCE(finished_at, ?1), updated_at = ?2
             WHERE id = ?3",
            params![at.to_rfc3339(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated > 0)
    }

    pub async fn get_activity(&self, id: &str) -> Result<Option<Activity>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM activities WHERE id = ?1", ACTIVITY_COLUMNS);
        let activity = conn
            .query_row(&sql, [id], Self::row_to_activity)
            .optional()?;
        Ok(activity)
    }

    /// Activities created from another activity by a new-ticket step.
    pub async fn list_child_activities(&self, parent_id: &str) -> Result<Vec<Activity>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM activities WHERE parent_id = ?1 ORDER BY created_at",
            ACTIVITY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let activities = stmt
            .query_map([parent_id], Self::row_to_activity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(activities)
    }

    fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
        Ok(Activity {
            id: row.get(0)?,
            form_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            protocol: row.get(4)?,
            status: parse_json_column(5, &row.get::<_, String>(5)?)?,
            due_date: parse_optional_datetime(row.get(6)?)?,
            parent_id: row.get(7)?,
            users: parse_json_column(8, &row.get::<_, String>(8)?)?,
            fields: parse_json_column(9, &row.get::<_, String>(9)?)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(10)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(11)?)?,
            finished_at: parse_optional_datetime(row.get(12)?)?,
        })
    }

    // ========================================================================
    // Instance operations
    // ========================================================================

    pub async fn create_instance(&self, instance: &Instance) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO instances
                (id, activity_id, definition_id, cursor, status, version, error,
                 created_at, updated_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                instance.id,
                instance.activity_id,
                instance.definition_id,
                instance.cursor,
                instance.status.as_str(),
                instance.version,
                instance.error,
                instance.created_at.to_rfc3339(),
                instance.updated_at.to_rfc3339(),
                instance.finished_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM instances WHERE id = ?1", INSTANCE_COLUMNS);
        let instance = conn
            .query_row(&sql, [id], Self::row_to_instance)
            .optional()?;
        Ok(instance)
    }

    /// Write an instance if nobody else has since it was read.
    ///
    /// Returns `false` when the stored version no longer matches; the caller
    /// lost the race and must re-read. On success `instance.version` is
    /// bumped to the stored value.
    pub async fn update_instance(&self, instance: &mut Instance) -> Result<bool> {
        let now = Utc::now();
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE instances
             SET cursor = ?1, status = ?2, error = ?3, finished_at = ?4,
                 updated_at = ?5, version = version + 1
             WHERE id = ?6 AND version = ?7",
            params![
                instance.cursor,
                instance.status.as_str(),
                instance.error,
                instance.finished_at.map(|d| d.to_rfc3339()),
                now.to_rfc3339(),
                instance.id,
                instance.version,
            ],
        )?;

        if updated == 1 {
            instance.version += 1;
            instance.updated_at = now;
        }
        Ok(updated == 1)
    }

    pub async fn list_instances(&self, activity_id: &str) -> Result<Vec<Instance>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM instances WHERE activity_id = ?1 ORDER BY created_at",
            INSTANCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let instances = stmt
            .query_map([activity_id], Self::row_to_instance)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    /// Instances left `running` (yielded or dropped follow-ups) that have not
    /// been touched since `idle_before`, oldest first.
    pub async fn running_instances(&self, idle_before: DateTime<Utc>) -> Result<Vec<Instance>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM instances WHERE status = 'running' AND updated_at <= ?1
             ORDER BY updated_at",
            INSTANCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let instances = stmt
            .query_map([idle_before.to_rfc3339()], Self::row_to_instance)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
        Ok(Instance {
            id: row.get(0)?,
            activity_id: row.get(1)?,
            definition_id: row.get(2)?,
            cursor: row.get(3)?,
            status: parse_enum_column(4, &row.get::<_, String>(4)?)?,
            version: row.get(5)?,
            error: row.get(6)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            finished_at: parse_optional_datetime(row.get(9)?)?,
        })
    }

    // ========================================================================
    // Step history
    // ========================================================================

    /// Open a history entry for a step visit.
    pub async fn start_step(
        &self,
        instance_id: &str,
        step_id: &str,
        status: StepStatus,
    ) -> Result<StepRecord> {
        let record = StepRecord {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            step_id: step_id.to_string(),
            status,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO instance_steps (id, instance_id, step_id, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.instance_id,
                record.step_id,
                record.status.as_str(),
                record.started_at.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    /// Move a history entry to a new status. Terminal statuses stamp
    /// `finished_at`.
    pub async fn update_step_status(
        &self,
        record_id: &str,
        status: StepStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let finished_at = matches!(status, StepStatus::Finished | StepStatus::Error)
            .then(|| Utc::now().to_rfc3339());
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE instance_steps SET status = ?1, error = ?2, finished_at = ?3 WHERE id = ?4",
            params![status.as_str(), error, finished_at, record_id],
        )?;
        Ok(())
    }

    /// Most recent history entry for a step of an instance.
    pub async fn latest_step_record(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<Option<StepRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, instance_id, step_id, status, started_at, finished_at, error
                 FROM instance_steps WHERE instance_id = ?1 AND step_id = ?2
                 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                params![instance_id, step_id],
                Self::row_to_step_record,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_step_records(&self, instance_id: &str) -> Result<Vec<StepRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, step_id, status, started_at, finished_at, error
             FROM instance_steps WHERE instance_id = ?1 ORDER BY started_at, rowid",
        )?;
        let records = stmt
            .query_map([instance_id], Self::row_to_step_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn row_to_step_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRecord> {
        Ok(StepRecord {
            id: row.get(0)?,
            instance_id: row.get(1)?,
            step_id: row.get(2)?,
            status: parse_enum_column(3, &row.get::<_, String>(3)?)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
            finished_at: parse_optional_datetime(row.get(5)?)?,
            error: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{parse_definition, START_STEP_ID};
    use serde_json::json;

    async fn seed(storage: &SqliteStorage) -> (Activity, String) {
        storage
            .save_workflow(&StoredWorkflow {
                id: "wf".into(),
                name: "wf".into(),
                form_id: Some("form".into()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let steps = parse_definition("- id: a\n  kind: script\n  payload: { script: '1' }\n")
            .unwrap()
            .steps;
        let definition = storage.create_draft("wf", &steps).await.unwrap();

        let mut activity = Activity::new("form", "Ticket", StatusRef::default());
        activity.users.push(ActivityUser::new("u1", "Ana", "ana@example.com"));
        activity.fields.push(FormField::text("age", json!(20)));
        storage.save_activity(&activity).await.unwrap();
        (activity, definition.id)
    }

    #[tokio::test]
    async fn test_activity_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (mut activity, _) = seed(&storage).await;

        let loaded = storage.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(loaded.users, activity.users);
        assert_eq!(loaded.field_map().get("age"), Some(&json!(20)));

        assert!(activity.set_field("age", json!(21)));
        assert!(!activity.set_field("unknown", json!(1)));
        storage.save_activity(&activity).await.unwrap();
        let reloaded = storage.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(reloaded.field_map().get("age"), Some(&json!(21)));
    }

    #[tokio::test]
    async fn test_instance_version_check() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (activity, definition_id) = seed(&storage).await;

        let instance = Instance::new(&activity.id, &definition_id);
        storage.create_instance(&instance).await.unwrap();
        assert_eq!(instance.cursor.as_deref(), Some(START_STEP_ID));

        let mut first = storage.get_instance(&instance.id).await.unwrap().unwrap();
        let mut second = first.clone();

        first.cursor = Some("a".into());
        assert!(storage.update_instance(&mut first).await.unwrap());
        assert_eq!(first.version, 1);

        // Stale copy loses
        second.status = InstanceStatus::Finished;
        assert!(!storage.update_instance(&mut second).await.unwrap());

        let stored = storage.get_instance(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.cursor.as_deref(), Some("a"));
        assert_eq!(stored.status, InstanceStatus::Running);
        assert_eq!(storage.list_instances(&activity.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_step_history() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (activity, definition_id) = seed(&storage).await;
        let instance = Instance::new(&activity.id, &definition_id);
        storage.create_instance(&instance).await.unwrap();

        let record = storage
            .start_step(&instance.id, "a", StepStatus::InProgress)
            .await
            .unwrap();
        storage
            .update_step_status(&record.id, StepStatus::Error, Some("boom"))
            .await
            .unwrap();

        let latest = storage
            .latest_step_record(&instance.id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, StepStatus::Error);
        assert_eq!(latest.error.as_deref(), Some("boom"));
        assert!(latest.finished_at.is_some());
        assert_eq!(storage.list_step_records(&instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_column_updates_leave_other_columns_alone() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (activity, _) = seed(&storage).await;

        let done = StatusRef::new("st-done", "Done", StatusKind::Done);
        assert!(storage.update_activity_status(&activity.id, &done).await.unwrap());

        // A stale copy only carries its fields over
        let mut stale = activity.clone();
        stale.upsert_field("region", json!("south"));
        storage
            .update_activity_fields(&stale.id, &stale.fields)
            .await
            .unwrap();

        let stored = storage.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(stored.status, done);
        assert_eq!(stored.field_map().get("region"), Some(&json!("south")));
        let closed_at = stored.finished_at.unwrap();

        storage
            .mark_activity_finished(&activity.id, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let stored = storage.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(stored.finished_at, Some(closed_at));
    }

    #[tokio::test]
    async fn test_running_instances_skips_recent_and_settled() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let (activity, definition_id) = seed(&storage).await;

        let idle = Instance::new(&activity.id, &definition_id);
        storage.create_instance(&idle).await.unwrap();
        let waiting = Instance::new(&activity.id, &definition_id);
        storage.create_instance(&waiting).await.unwrap();
        let mut waiting = storage.get_instance(&waiting.id).await.unwrap().unwrap();
        waiting.status = InstanceStatus::Waiting;
        assert!(storage.update_instance(&mut waiting).await.unwrap());

        let later = Utc::now() + chrono::Duration::seconds(5);
        let found = storage.running_instances(later).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, idle.id);

        let earlier = Utc::now() - chrono::Duration::minutes(5);
        assert!(storage.running_instances(earlier).await.unwrap().is_empty());
    }
}
