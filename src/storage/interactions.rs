//! Interactions and their per-recipient responses.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::models::*;
use super::sqlite::{parse_datetime_utc, parse_enum_column, parse_json_column, parse_optional_datetime};
use super::SqliteStorage;
use crate::error::Result;

const INTERACTION_COLUMNS: &str = "id, instance_id, activity_id, step_id, kind, form_id, \
     recipients, quorum, status, envelope_id, due_at, created_at, closed_at";

impl SqliteStorage {
    pub async fn create_interaction(&self, interaction: &Interaction) -> Result<()> {
        let recipients = serde_json::to_string(&interaction.recipients)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO interactions
                (id, instance_id, activity_id, step_id, kind, form_id, recipients, quorum,
                 status, envelope_id, due_at, created_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                interaction.id,
                interaction.instance_id,
                interaction.activity_id,
                interaction.step_id,
                interaction.kind.as_str(),
                interaction.form_id,
                recipients,
                interaction.quorum,
                interaction.status.as_str(),
                interaction.envelope_id,
                interaction.due_at.map(|d| d.to_rfc3339()),
                interaction.created_at.to_rfc3339(),
                interaction.closed_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM interactions WHERE id = ?1", INTERACTION_COLUMNS);
        let interaction = conn
            .query_row(&sql, [id], Self::row_to_interaction)
            .optional()?;
        Ok(interaction)
    }

    /// Latest interaction opened for an (instance, step) pair, any status.
    pub async fn interaction_for_step(
        &self,
        instance_id: &str,
        step_id: &str,
    ) -> Result<Option<Interaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM interactions WHERE instance_id = ?1 AND step_id = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            INTERACTION_COLUMNS
        );
        let interaction = conn
            .query_row(&sql, params![instance_id, step_id], Self::row_to_interaction)
            .optional()?;
        Ok(interaction)
    }

    pub async fn list_open_interactions(&self, activity_id: &str) -> Result<Vec<Interaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM interactions WHERE activity_id = ?1 AND status = 'open'
             ORDER BY created_at",
            INTERACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let interactions = stmt
            .query_map([activity_id], Self::row_to_interaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(interactions)
    }

    /// Open interactions whose deadline is at or before `now`.
    pub async fn overdue_interactions(&self, now: DateTime<Utc>) -> Result<Vec<Interaction>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM interactions
             WHERE status = 'open' AND due_at IS NOT NULL AND due_at <= ?1
             ORDER BY due_at",
            INTERACTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let interactions = stmt
            .query_map([now.to_rfc3339()], Self::row_to_interaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(interactions)
    }

    pub async fn count_open_interactions(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM interactions WHERE status = 'open'",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Close an open interaction. Returns `false` if it was already closed.
    pub async fn close_interaction(&self, id: &str, status: InteractionStatus) -> Result<bool> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE interactions SET status = ?1, closed_at = ?2 WHERE id = ?3 AND status = 'open'",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(updated == 1)
    }

    /// Supersede every open interaction of an instance.
    pub async fn supersede_instance_interactions(&self, instance_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE interactions SET status = 'superseded', closed_at = ?1
             WHERE instance_id = ?2 AND status = 'open'",
            params![Utc::now().to_rfc3339(), instance_id],
        )?;
        Ok(updated)
    }

    /// Supersede every open interaction of an activity.
    pub async fn supersede_activity_interactions(&self, activity_id: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE interactions SET status = 'superseded', closed_at = ?1
             WHERE activity_id = ?2 AND status = 'open'",
            params![Utc::now().to_rfc3339(), activity_id],
        )?;
        Ok(updated)
    }

    pub async fn set_envelope_id(&self, interaction_id: &str, envelope_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE interactions SET envelope_id = ?1 WHERE id = ?2",
            params![envelope_id, interaction_id],
        )?;
        Ok(())
    }

    fn row_to_interaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Interaction> {
        Ok(Interaction {
            id: row.get(0)?,
            instance_id: row.get(1)?,
            activity_id: row.get(2)?,
            step_id: row.get(3)?,
            kind: parse_enum_column(4, &row.get::<_, String>(4)?)?,
            form_id: row.get(5)?,
            recipients: parse_json_column(6, &row.get::<_, String>(6)?)?,
            quorum: row.get(7)?,
            status: parse_enum_column(8, &row.get::<_, String>(8)?)?,
            envelope_id: row.get(9)?,
            due_at: parse_optional_datetime(row.get(10)?)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(11)?)?,
            closed_at: parse_optional_datetime(row.get(12)?)?,
        })
    }

    // ========================================================================
    // Responses
    // ========================================================================

    /// Record one respondent's answer. A repeated respondent is ignored and
    /// reported as `false`.
    pub async fn record_response(
        &self,
        interaction_id: &str,
        respondent: &str,
        data: &Value,
    ) -> Result<bool> {
        let data = serde_json::to_string(data)?;
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO interaction_responses
                (id, interaction_id, respondent, data, responded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                interaction_id,
                respondent,
                data,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(inserted == 1)
    }

    pub async fn list_responses(&self, interaction_id: &str) -> Result<Vec<InteractionResponse>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, interaction_id, respondent, data, responded_at
             FROM interaction_responses WHERE interaction_id = ?1
             ORDER BY responded_at, rowid",
        )?;
        let responses = stmt
            .query_map([interaction_id], Self::row_to_response)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(responses)
    }

    /// Every answer given to `form_id` through this activity's interactions.
    pub async fn form_answers(&self, activity_id: &str, form_id: &str) -> Result<Vec<Value>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT r.data FROM interaction_responses r
             JOIN interactions i ON i.id = r.interaction_id
             WHERE i.activity_id = ?1 AND i.form_id = ?2
             ORDER BY r.responded_at, r.rowid",
        )?;
        let answers = stmt
            .query_map(params![activity_id, form_id], |row| {
                parse_json_column(0, &row.get::<_, String>(0)?)
            })?
            .collect::<std::result::Result<Vec<Value>, _>>()?;
        Ok(answers)
    }

    fn row_to_response(row: &rusqlite::Row<'_>) -> rusqlite::Result<InteractionResponse> {
        Ok(InteractionResponse {
            id: row.get(0)?,
            interaction_id: row.get(1)?,
            respondent: row.get(2)?,
            data: parse_json_column(3, &row.get::<_, String>(3)?)?,
            responded_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_definition;
    use chrono::Duration;
    use serde_json::json;

    async fn seed(storage: &SqliteStorage) -> Instance {
        storage
            .save_workflow(&StoredWorkflow {
                id: "wf".into(),
                name: "wf".into(),
                form_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let steps = parse_definition("- id: a\n  kind: script\n  payload: { script: '1' }\n")
            .unwrap()
            .steps;
        let definition = storage.create_draft("wf", &steps).await.unwrap();
        let activity = Activity::new("form", "Ticket", StatusRef::default());
        storage.save_activity(&activity).await.unwrap();
        let instance = Instance::new(&activity.id, &definition.id);
        storage.create_instance(&instance).await.unwrap();
        instance
    }

    fn interaction(instance: &Instance) -> Interaction {
        let mut interaction = Interaction::new(
            instance,
            "ask",
            InteractionKind::Interaction,
            vec!["a@x.io".into(), "b@x.io".into()],
            2,
        );
        interaction.form_id = Some("approval".into());
        interaction
    }

    #[tokio::test]
    async fn test_responses_are_unique_per_respondent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instance = seed(&storage).await;
        let interaction = interaction(&instance);
        storage.create_interaction(&interaction).await.unwrap();

        assert!(storage
            .record_response(&interaction.id, "a@x.io", &json!({"ok": true}))
            .await
            .unwrap());
        assert!(!storage
            .record_response(&interaction.id, "a@x.io", &json!({"ok": false}))
            .await
            .unwrap());

        let responses = storage.list_responses(&interaction.id).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].data, json!({"ok": true}));

        let answers = storage
            .form_answers(&instance.activity_id, "approval")
            .await
            .unwrap();
        assert_eq!(answers, vec![json!({"ok": true})]);
    }

    #[tokio::test]
    async fn test_close_is_compare_and_set() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instance = seed(&storage).await;
        let interaction = interaction(&instance);
        storage.create_interaction(&interaction).await.unwrap();
        assert_eq!(storage.count_open_interactions().await.unwrap(), 1);

        assert!(storage
            .close_interaction(&interaction.id, InteractionStatus::Satisfied)
            .await
            .unwrap());
        assert!(!storage
            .close_interaction(&interaction.id, InteractionStatus::Superseded)
            .await
            .unwrap());

        let stored = storage.get_interaction(&interaction.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InteractionStatus::Satisfied);
        assert!(stored.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_supersede_and_overdue() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let instance = seed(&storage).await;

        let mut overdue = interaction(&instance);
        overdue.due_at = Some(Utc::now() - Duration::hours(1));
        storage.create_interaction(&overdue).await.unwrap();

        let found = storage.overdue_interactions(Utc::now()).await.unwrap();
        assert_eq!(found.len(), 1);

        let superseded = storage
            .supersede_activity_interactions(&instance.activity_id)
            .await
            .unwrap();
        assert_eq!(superseded, 1);
        assert!(storage.overdue_interactions(Utc::now()).await.unwrap().is_empty());
        assert!(storage
            .list_open_interactions(&instance.activity_id)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            storage.supersede_instance_interactions(&instance.id).await.unwrap(),
            0
        );
    }
}
