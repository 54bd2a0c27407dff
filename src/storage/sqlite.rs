//! SQLite storage implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};
use crate::workflow::{ensure_publishable, DefinitionStatus, Step, WorkflowDefinition};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
pub(crate) fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn parse_optional_datetime(
    s: Option<String>,
) -> rusqlite::Result<Option<chrono::DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

/// Decode a JSON column, surfacing malformed content as a conversion error.
pub(crate) fn parse_json_column<T: serde::de::DeserializeOwned>(
    index: usize,
    s: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_enum_column<T: std::str::FromStr<Err = String>>(
    index: usize,
    s: &str,
) -> rusqlite::Result<T> {
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e.into())
    })
}

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                form_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workflows_form ON workflows(form_id);

            CREATE TABLE IF NOT EXISTS workflow_definitions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                steps TEXT NOT NULL,
                created_at TEXT NOT NULL,
                published_at TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE,
                UNIQUE(workflow_id, version)
            );

            CREATE TABLE IF NOT EXISTS statuses (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS variables (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY,
                form_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                protocol TEXT,
                status TEXT NOT NULL,
                due_date TEXT,
                parent_id TEXT,
                users TEXT NOT NULL,
                fields TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                activity_id TEXT NOT NULL,
                definition_id TEXT NOT NULL,
                cursor TEXT,
                status TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT,
                FOREIGN KEY (activity_id) REFERENCES activities(id) ON DELETE CASCADE,
                FOREIGN KEY (definition_id) REFERENCES workflow_definitions(id)
            );
            CREATE INDEX IF NOT EXISTS idx_instances_activity ON instances(activity_id);

            CREATE TABLE IF NOT EXISTS instance_steps (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT,
                FOREIGN KEY (instance_id) REFERENCES instances(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_instance_steps_instance
                ON instance_steps(instance_id, started_at);

            CREATE TABLE IF NOT EXISTS interactions (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                activity_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                form_id TEXT,
                recipients TEXT NOT NULL,
                quorum INTEGER NOT NULL,
                status TEXT NOT NULL,
                envelope_id TEXT,
                due_at TEXT,
                created_at TEXT NOT NULL,
                closed_at TEXT,
                FOREIGN KEY (instance_id) REFERENCES instances(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_instance ON interactions(instance_id, step_id);
            CREATE INDEX IF NOT EXISTS idx_interactions_activity ON interactions(activity_id, status);

            CREATE TABLE IF NOT EXISTS interaction_responses (
                id TEXT PRIMARY KEY,
                interaction_id TEXT NOT NULL,
                respondent TEXT NOT NULL,
                data TEXT NOT NULL,
                responded_at TEXT NOT NULL,
                FOREIGN KEY (interaction_id) REFERENCES interactions(id) ON DELETE CASCADE,
                UNIQUE(interaction_id, respondent)
            );

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                form_id TEXT NOT NULL,
                cron TEXT NOT NULL,
                timezone TEXT NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT,
                repeat_limit INTEGER,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_executions (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                status TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                activity_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (schedule_id) REFERENCES schedules(id) ON DELETE CASCADE,
                UNIQUE(schedule_id, scheduled_for)
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_executions_due
                ON scheduled_executions(status, scheduled_for);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Workflow operations
    // ========================================================================

    pub async fn save_workflow(&self, workflow: &StoredWorkflow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflows (id, name, form_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, form_id = excluded.form_id",
            params![
                workflow.id,
                workflow.name,
                workflow.form_id,
                workflow.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let workflow = conn
            .query_row(
                "SELECT id, name, form_id, created_at FROM workflows WHERE id = ?1",
                [id],
                Self::row_to_workflow,
            )
            .optional()?;
        Ok(workflow)
    }

    /// Workflow bound to a form, used to start instances for new activities.
    pub async fn find_workflow_for_form(&self, form_id: &str) -> Result<Option<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let workflow = conn
            .query_row(
                "SELECT id, name, form_id, created_at FROM workflows
                 WHERE form_id = ?1 ORDER BY created_at LIMIT 1",
                [form_id],
                Self::row_to_workflow,
            )
            .optional()?;
        Ok(workflow)
    }

    pub async fn list_workflows(&self) -> Result<Vec<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, name, form_id, created_at FROM workflows ORDER BY name")?;
        let workflows = stmt
            .query_map([], Self::row_to_workflow)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workflows)
    }

    fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredWorkflow> {
        Ok(StoredWorkflow {
            id: row.get(0)?,
            name: row.get(1)?,
            form_id: row.get(2)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(3)?)?,
        })
    }

    // ========================================================================
    // Definition operations
    // ========================================================================

    /// Store a new draft as the next version of a workflow.
    pub async fn create_draft(&self, workflow_id: &str, steps: &[Step]) -> Result<WorkflowDefinition> {
        let steps_json = serde_json::to_string(steps)?;
        let conn = self.conn.lock().await;

        let exists: Option<String> = conn
            .query_row("SELECT id FROM workflows WHERE id = ?1", [workflow_id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(Error::Workflow(format!("Workflow not found: {}", workflow_id)));
        }

        let version: u32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM workflow_definitions WHERE workflow_id = ?1",
            [workflow_id],
            |row| row.get(0),
        )?;

        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO workflow_definitions (id, workflow_id, version, status, steps, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                workflow_id,
                version,
                DefinitionStatus::Draft.as_str(),
                steps_json,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(WorkflowDefinition {
            id,
            workflow_id: workflow_id.to_string(),
            version,
            status: DefinitionStatus::Draft,
            steps: steps.to_vec(),
        })
    }

    /// Replace the steps of a draft. Published definitions are immutable.
    pub async fn replace_draft(&self, definition_id: &str, steps: &[Step]) -> Result<()> {
        let steps_json = serde_json::to_string(steps)?;
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE workflow_definitions SET steps = ?1 WHERE id = ?2 AND status = 'draft'",
            params![steps_json, definition_id],
        )?;
        if updated == 0 {
            return Err(Error::Workflow(format!(
                "Definition {} is not an editable draft",
                definition_id
            )));
        }
        Ok(())
    }

    /// Validate and publish a draft.
    pub async fn publish_definition(&self, definition_id: &str) -> Result<WorkflowDefinition> {
        let mut definition = self
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| Error::Workflow(format!("Definition not found: {}", definition_id)))?;

        if definition.is_published() {
            return Ok(definition);
        }
        ensure_publishable(&definition)?;

        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE workflow_definitions SET status = 'published', published_at = ?1
             WHERE id = ?2 AND status = 'draft'",
            params![Utc::now().to_rfc3339(), definition_id],
        )?;
        if updated == 0 {
            return Err(Error::Workflow(format!(
                "Definition {} changed while publishing",
                definition_id
            )));
        }

        definition.status = DefinitionStatus::Published;
        Ok(definition)
    }

    pub async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let definition = conn
            .query_row(
                "SELECT id, workflow_id, version, status, steps
                 FROM workflow_definitions WHERE id = ?1",
                [id],
                Self::row_to_definition,
            )
            .optional()?;
        Ok(definition)
    }

    /// Highest published version of a workflow.
    pub async fn latest_published(&self, workflow_id: &str) -> Result<Option<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let definition = conn
            .query_row(
                "SELECT id, workflow_id, version, status, steps
                 FROM workflow_definitions
                 WHERE workflow_id = ?1 AND status = 'published'
                 ORDER BY version DESC LIMIT 1",
                [workflow_id],
                Self::row_to_definition,
            )
            .optional()?;
        Ok(definition)
    }

    pub async fn list_definitions(&self, workflow_id: &str) -> Result<Vec<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, version, status, steps
             FROM workflow_definitions WHERE workflow_id = ?1 ORDER BY version",
        )?;
        let definitions = stmt
            .query_map([workflow_id], Self::row_to_definition)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(definitions)
    }

    fn row_to_definition(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowDefinition> {
        Ok(WorkflowDefinition {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            version: row.get(2)?,
            status: parse_enum_column(3, &row.get::<_, String>(3)?)?,
            steps: parse_json_column(4, &row.get::<_, String>(4)?)?,
        })
    }

    // ========================================================================
    // Status and variable operations
    // ========================================================================

    pub async fn save_status(&self, status: &StatusRef) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO statuses (id, name, kind) VALUES (?1, ?2, ?3)",
            params![status.id, status.name, status.kind.as_str()],
        )?;
        Ok(())
    }

    pub async fn get_status(&self, id: &str) -> Result<Option<StatusRef>> {
        let conn = self.conn.lock().await;
        let status = conn
            .query_row(
                "SELECT id, name, kind FROM statuses WHERE id = ?1",
                [id],
                |row| {
                    Ok(StatusRef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: parse_enum_column(2, &row.get::<_, String>(2)?)?,
                    })
                },
            )
            .optional()?;
        Ok(status)
    }

    /// Status new activities start in: the first `progress` status by name.
    pub async fn initial_status(&self) -> Result<Option<StatusRef>> {
        let conn = self.conn.lock().await;
        let status = conn
            .query_row(
                "SELECT id, name, kind FROM statuses WHERE kind = 'progress' ORDER BY name LIMIT 1",
                [],
                |row| {
                    Ok(StatusRef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: StatusKind::Progress,
                    })
                },
            )
            .optional()?;
        Ok(status)
    }

    pub async fn set_variable(&self, name: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO variables (name, value) VALUES (?1, ?2)",
            params![name, value],
        )?;
        Ok(())
    }

    /// Process-level variables exposed to templates and scripts as `vars`.
    pub async fn get_variables(&self) -> Result<HashMap<String, String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT name, value FROM variables")?;
        let vars = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<String, String>, _>>()?;
        Ok(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_definition;

    async fn seed_workflow(storage: &SqliteStorage, id: &str, form_id: &str) {
        storage
            .save_workflow(&StoredWorkflow {
                id: id.to_string(),
                name: format!("{} workflow", id),
                form_id: Some(form_id.to_string()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn steps(yaml: &str) -> Vec<Step> {
        parse_definition(yaml).unwrap().steps
    }

    const VALID: &str = r#"
- id: start
  kind: start
  next: { default: run }
- id: run
  kind: script
  payload: { script: "1 + 1" }
"#;

    #[tokio::test]
    async fn test_workflow_lookup_by_form() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_workflow(&storage, "wf-1", "form-a").await;

        let found = storage.find_workflow_for_form("form-a").await.unwrap().unwrap();
        assert_eq!(found.id, "wf-1");
        assert!(storage.find_workflow_for_form("form-b").await.unwrap().is_none());
        assert_eq!(storage.list_workflows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_definition_versions_and_publish() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_workflow(&storage, "wf-1", "form-a").await;

        let v1 = storage.create_draft("wf-1", &steps(VALID)).await.unwrap();
        let v2 = storage.create_draft("wf-1", &steps(VALID)).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert!(storage.latest_published("wf-1").await.unwrap().is_none());

        let published = storage.publish_definition(&v1.id).await.unwrap();
        assert!(published.is_published());
        let latest = storage.latest_published("wf-1").await.unwrap().unwrap();
        assert_eq!(latest.id, v1.id);

        // Published definitions cannot be edited
        let err = storage.replace_draft(&v1.id, &steps(VALID)).await.unwrap_err();
        assert!(matches!(err, Error::Workflow(_)));
        storage.replace_draft(&v2.id, &steps(VALID)).await.unwrap();

        // Steps round-trip through storage
        let loaded = storage.get_definition(&v1.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps, steps(VALID));
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_draft() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_workflow(&storage, "wf-1", "form-a").await;

        let invalid = steps(
            r#"
- id: start
  kind: start
  next: { default: call }
- id: call
  kind: web_request
"#,
        );
        let draft = storage.create_draft("wf-1", &invalid).await.unwrap();
        let err = storage.publish_definition(&draft.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let still_draft = storage.get_definition(&draft.id).await.unwrap().unwrap();
        assert_eq!(still_draft.status, DefinitionStatus::Draft);
    }

    #[tokio::test]
    async fn test_draft_for_unknown_workflow() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.create_draft("nope", &steps(VALID)).await.is_err());
    }

    #[tokio::test]
    async fn test_statuses_and_variables() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .save_status(&StatusRef::new("st-open", "Open", StatusKind::Progress))
            .await
            .unwrap();
        storage
            .save_status(&StatusRef::new("st-done", "Done", StatusKind::Done))
            .await
            .unwrap();

        let done = storage.get_status("st-done").await.unwrap().unwrap();
        assert!(done.kind.is_terminal());
        assert_eq!(storage.initial_status().await.unwrap().unwrap().id, "st-open");

        storage.set_variable("API_URL", "https://api.example.com").await.unwrap();
        let vars = storage.get_variables().await.unwrap();
        assert_eq!(vars.get("API_URL").map(String::as_str), Some("https://api.example.com"));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("streamline.db");
        SqliteStorage::open(&path).unwrap();
        assert!(path.exists());
    }
}
