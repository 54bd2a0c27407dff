//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Logical workflow. Owns numbered definition versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredWorkflow {
    pub id: String,
    pub name: String,
    /// Form whose new activities start this workflow
    pub form_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Activity status category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    #[default]
    Progress,
    Done,
    Canceled,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Done => "done",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal statuses close every open interaction on the activity.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StatusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "progress" => Ok(Self::Progress),
            "done" => Ok(Self::Done),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Unknown status kind: {}", s)),
        }
    }
}

/// Activity status as stored on the activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: StatusKind,
}

impl StatusRef {
    pub fn new(id: &str, name: &str, kind: StatusKind) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Institute {
    pub name: String,
    #[serde(default)]
    pub acronym: Option<String>,
}

/// A user attached to an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityUser {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub matriculation: Option<String>,
    #[serde(default)]
    pub institute: Option<Institute>,
}

impl ActivityUser {
    pub fn new(id: &str, name: &str, email: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            matriculation: None,
            institute: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub label: String,
    pub value: Value,
}

/// One form field with its current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub id: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub options: Vec<FieldOption>,
    /// System fields are never exposed to templates
    #[serde(default)]
    pub system: bool,
}

fn default_field_type() -> String {
    "text".to_string()
}

impl FormField {
    pub fn text(id: &str, value: Value) -> Self {
        Self {
            id: id.to_string(),
            field_type: default_field_type(),
            label: None,
            value,
            options: Vec::new(),
            system: false,
        }
    }
}

/// The business record a workflow instance works on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub form_id: String,
    pub name: String,
    pub description: Option<String>,
    pub protocol: Option<String>,
    pub status: StatusRef,
    pub due_date: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub users: Vec<ActivityUser>,
    pub fields: Vec<FormField>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Activity {
    pub fn new(form_id: &str, name: &str, status: StatusRef) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            form_id: form_id.to_string(),
            name: name.to_string(),
            description: None,
            protocol: None,
            status,
            due_date: None,
            parent_id: None,
            users: Vec::new(),
            fields: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Field values by id, as entered.
    pub fn field_map(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|f| (f.id.clone(), f.value.clone()))
            .collect()
    }

    /// Overwrite an existing field. Unknown ids are ignored and reported.
    pub fn set_field(&mut self, id: &str, value: Value) -> bool {
        match self.fields.iter_mut().find(|f| f.id == id) {
            Some(field) => {
                field.value = value;
                true
            }
            None => false,
        }
    }

    /// Set a field, appending a plain text field when the id is new.
    pub fn upsert_field(&mut self, id: &str, value: Value) {
        match self.fields.iter_mut().find(|f| f.id == id) {
            Some(field) => field.value = value,
            None => self.fields.push(FormField::text(id, value)),
        }
    }
}

/// Per-step status within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Idle,
    InQueue,
    InProgress,
    Finished,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InQueue => "in_queue",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "in_queue" => Ok(Self::InQueue),
            "in_progress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// Instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Cursor points at a step that has not run yet
    Running,
    /// Suspended on an interaction or e-sign step
    Waiting,
    Finished,
    /// Halted by a fatal step error
    Error,
    /// Replaced by a swapped-in instance
    Superseded,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Superseded => "superseded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Superseded)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "superseded" => Ok(Self::Superseded),
            _ => Err(format!("Unknown instance status: {}", s)),
        }
    }
}

/// One execution of a workflow definition against one activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub activity_id: String,
    pub definition_id: String,
    /// Current step; `None` once the path has ended
    pub cursor: Option<String>,
    pub status: InstanceStatus,
    /// Optimistic concurrency token, bumped on every write
    pub version: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(activity_id: &str, definition_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            activity_id: activity_id.to_string(),
            definition_id: definition_id.to_string(),
            cursor: Some(crate::workflow::START_STEP_ID.to_string()),
            status: InstanceStatus::Running,
            version: 0,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status history entry for one step visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub instance_id: String,
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Form answers from recipients
    Interaction,
    /// Signer completions from the e-signature provider
    Signature,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interaction => "interaction",
            Self::Signature => "signature",
        }
    }
}

impl std::str::FromStr for InteractionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interaction" => Ok(Self::Interaction),
            "signature" => Ok(Self::Signature),
            _ => Err(format!("Unknown interaction kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    Open,
    /// Quorum met, instance resumed
    Satisfied,
    /// Instance swapped out or activity closed; late responses are rejected
    Superseded,
    /// Deadline passed; resumed with the responses gathered so far
    Expired,
}

impl InteractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Satisfied => "satisfied",
            Self::Superseded => "superseded",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InteractionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "satisfied" => Ok(Self::Satisfied),
            "superseded" => Ok(Self::Superseded),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Unknown interaction status: {}", s)),
        }
    }
}

/// Pending external input for one (instance, step) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub instance_id: String,
    pub activity_id: String,
    pub step_id: String,
    pub kind: InteractionKind,
    pub form_id: Option<String>,
    pub recipients: Vec<String>,
    /// Responses needed before the step resumes
    pub quorum: u32,
    pub status: InteractionStatus,
    pub envelope_id: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Interaction {
    pub fn new(
        instance: &Instance,
        step_id: &str,
        kind: InteractionKind,
        recipients: Vec<String>,
        quorum: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance.id.clone(),
            activity_id: instance.activity_id.clone(),
            step_id: step_id.to_string(),
            kind,
            form_id: None,
            recipients,
            quorum,
            status: InteractionStatus::Open,
            envelope_id: None,
            due_at: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionResponse {
    pub id: String,
    pub interaction_id: String,
    pub respondent: String,
    pub data: Value,
    pub responded_at: DateTime<Utc>,
}

/// Recurring activity creation for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: String,
    pub name: String,
    pub workflow_id: String,
    pub form_id: String,
    /// 5-field cron expression
    pub cron: String,
    pub timezone: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub repeat_limit: Option<u32>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduleDefinition {
    /// An active UTC schedule starting now, with no end and no repeat limit.
    pub fn new(name: &str, workflow_id: &str, form_id: &str, cron: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            workflow_id: workflow_id.to_string(),
            form_id: form_id.to_string(),
            cron: cron.to_string(),
            timezone: "UTC".to_string(),
            start_at: now,
            end_at: None,
            repeat_limit: None,
            active: true,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    Pending,
    Started,
    Completed,
    Failed,
    Canceled,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ScheduledStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduledStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Unknown scheduled status: {}", s)),
        }
    }
}

/// One materialized occurrence of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledExecution {
    pub id: String,
    pub schedule_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: ScheduledStatus,
    /// Failed attempts
    pub retries: u32,
    /// Claimed attempts; equal to `retries` while a retry is due
    pub attempts: u32,
    pub activity_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
