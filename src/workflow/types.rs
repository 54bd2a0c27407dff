//! Workflow type definitions.
//!
//! A definition is a flat list of steps linked by `next` edges:
//!
//! ```yaml
//! steps:
//!   - id: start
//!     kind: start
//!     next: { default: check-age }
//!   - id: check-age
//!     kind: conditional
//!     payload:
//!       form_id: form-1
//!       conditions:
//!         - { field: age, operator: ">", value: "18" }
//!     next: { default: notify, alternative: null }
//!   - id: notify
//!     kind: send_email
//!     payload:
//!       to: ["${{activity.#users.email}}"]
//!       subject: "Welcome ${{activity.name}}"
//!       body: "..."
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Id of the implicit entry step.
pub const START_STEP_ID: &str = "start";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Published,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
        }
    }
}

impl std::fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            _ => Err(format!("Unknown definition status: {}", s)),
        }
    }
}

/// One numbered version of a logical workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub workflow_id: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub status: DefinitionStatus,

    pub steps: Vec<Step>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_published(&self) -> bool {
        self.status == DefinitionStatus::Published
    }
}

/// Outgoing edges of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Next {
    #[serde(default, alias = "default-source")]
    pub default: Option<String>,

    /// Only branching kinds (interaction, conditional) may carry this edge
    #[serde(
        default,
        alias = "alternative-source",
        skip_serializing_if = "Option::is_none"
    )]
    pub alternative: Option<String>,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct Step {
    pub id: String,
    pub name: Option<String>,
    pub kind: StepKind,
    pub next: Next,
}

impl Step {
    pub fn new(id: &str, kind: StepKind, next: Next) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            kind,
            next,
        }
    }
}

/// Step kind and its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Start,
    SendEmail(SendEmailPayload),
    ChangeStatus(ChangeStatusPayload),
    SwapWorkflow(SwapWorkflowPayload),
    Interaction(InteractionPayload),
    Conditional(ConditionalPayload),
    WebRequest(WebRequestPayload),
    Script(ScriptPayload),
    NewTicket(NewTicketPayload),
    ESign(ESignPayload),
}

impl StepKind {
    /// Wire name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::SendEmail(_) => "send_email",
            Self::ChangeStatus(_) => "change_status",
            Self::SwapWorkflow(_) => "swap_workflow",
            Self::Interaction(_) => "interaction",
            Self::Conditional(_) => "conditional",
            Self::WebRequest(_) => "web_request",
            Self::Script(_) => "script",
            Self::NewTicket(_) => "new_ticket",
            Self::ESign(_) => "e_sign",
        }
    }

    /// Kinds allowed to carry an `alternative` edge.
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::Interaction(_) | Self::Conditional(_))
    }

    /// Kinds that suspend the instance waiting for external input.
    pub fn is_suspension_point(&self) -> bool {
        matches!(self, Self::Interaction(_) | Self::ESign(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendEmailPayload {
    /// Recipient templates; `users` expands to every activity user
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeStatusPayload {
    #[serde(default)]
    pub status_id: String,
    /// Notify activity users when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapWorkflowPayload {
    /// Logical workflow whose latest published definition takes over
    #[serde(default)]
    pub workflow_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitType {
    Any,
    All,
    Custom,
}

/// How a condition list combines its clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionPayload {
    #[serde(default)]
    pub form_id: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default, alias = "waitType", skip_serializing_if = "Option::is_none")]
    pub wait_type: Option<WaitType>,
    #[serde(default, alias = "waitValue", skip_serializing_if = "Option::is_none")]
    pub wait_value: Option<u32>,
    /// Legacy flag, consulted only when `wait_type` is absent
    #[serde(default, alias = "waitForOne")]
    pub wait_for_one: bool,
    #[serde(default, alias = "conditional")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub match_mode: MatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_in_hours: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionalPayload {
    #[serde(default)]
    pub form_id: String,
    #[serde(default, alias = "conditional")]
    pub conditions: Vec<Condition>,
    /// Step taken when a clause references a field that does not exist
    #[serde(default, alias = "ifNotExists", skip_serializing_if = "Option::is_none")]
    pub if_not_exists: Option<String>,
    #[serde(default)]
    pub match_mode: MatchMode,
}

/// One `{field, operator, value}` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

/// Comparison operator of a clause. Symbolic and named spellings are
/// both accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl std::str::FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "==" | "eq" => Ok(Self::Eq),
            "!=" | "ne" => Ok(Self::Ne),
            ">" | "gt" => Ok(Self::Gt),
            "<" | "lt" => Ok(Self::Lt),
            ">=" | "gte" => Ok(Self::Gte),
            "<=" | "lte" => Ok(Self::Lte),
            "contains" => Ok(Self::Contains),
            "in" => Ok(Self::In),
            "notIn" | "not_in" => Ok(Self::NotIn),
            "isNull" | "is_null" => Ok(Self::IsNull),
            "isNotNull" | "is_not_null" => Ok(Self::IsNotNull),
            other => Err(format!("Unknown operator: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebRequestPayload {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    /// JSON template; sent as text when it does not parse after rendering
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_async: bool,
    /// `key` is the field id, `value` a dotted path into the response body
    #[serde(default)]
    pub field_populate: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptPayload {
    #[serde(default)]
    pub script: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTicketPayload {
    #[serde(default)]
    pub form_id: String,
    /// Name template for the new activity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Field id to value template
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ESignPayload {
    #[serde(default, alias = "documentKey")]
    pub document_key: String,
    #[serde(default)]
    pub signers: Vec<Signer>,
    /// Document fields, values are templates
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub wait_for_signatures: bool,
}

impl Default for ESignPayload {
    fn default() -> Self {
        Self {
            document_key: String::new(),
            signers: Vec::new(),
            fields: BTreeMap::new(),
            wait_for_signatures: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Wire shape of a step: `{id, kind, payload, next}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(alias = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    next: Next,
}

impl TryFrom<RawStep> for Step {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let payload = match raw.payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        fn decode<T: serde::de::DeserializeOwned>(
            step_id: &str,
            payload: Value,
        ) -> Result<T, String> {
            serde_json::from_value(payload)
                .map_err(|e| format!("Invalid payload for step '{}': {}", step_id, e))
        }

        let id = raw.id;
        let kind = match raw.kind.replace('-', "_").as_str() {
            "start" | "circle" => StepKind::Start,
            "send_email" => StepKind::SendEmail(decode(&id, payload)?),
            "change_status" => StepKind::ChangeStatus(decode(&id, payload)?),
            "swap_workflow" => StepKind::SwapWorkflow(decode(&id, payload)?),
            "interaction" => StepKind::Interaction(decode(&id, payload)?),
            "conditional" => StepKind::Conditional(decode(&id, payload)?),
            "web_request" => StepKind::WebRequest(decode(&id, payload)?),
            "script" => StepKind::Script(decode(&id, payload)?),
            "new_ticket" => StepKind::NewTicket(decode(&id, payload)?),
            "e_sign" | "esign" | "clicksign" => StepKind::ESign(decode(&id, payload)?),
            other => return Err(format!("Unknown step kind '{}' for step '{}'", other, id)),
        };

        Ok(Step {
            id,
            name: raw.name,
            kind,
            next: raw.next,
        })
    }
}

impl StepKind {
    /// Payload in wire form. `start` carries none.
    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Self::Start => Ok(Value::Null),
            Self::SendEmail(p) => serde_json::to_value(p),
            Self::ChangeStatus(p) => serde_json::to_value(p),
            Self::SwapWorkflow(p) => serde_json::to_value(p),
            Self::Interaction(p) => serde_json::to_value(p),
            Self::Conditional(p) => serde_json::to_value(p),
            Self::WebRequest(p) => serde_json::to_value(p),
            Self::Script(p) => serde_json::to_value(p),
            Self::NewTicket(p) => serde_json::to_value(p),
            Self::ESign(p) => serde_json::to_value(p),
        }
    }
}

impl Serialize for Step {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = self.kind.payload().map_err(|e| {
            serde::ser::Error::custom(format!("Invalid payload for step '{}': {}", self.id, e))
        })?;

        RawStep {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.name().to_string(),
            payload,
            next: self.next.clone(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_wire_format() {
        let step: Step = serde_json::from_value(json!({
            "id": "check",
            "kind": "conditional",
            "payload": {
                "form_id": "form-1",
                "conditions": [{"field": "age", "operator": ">", "value": "18"}],
                "ifNotExists": "fallback"
            },
            "next": {"default": "adult", "alternative": "minor"}
        }))
        .unwrap();

        match &step.kind {
            StepKind::Conditional(p) => {
                assert_eq!(p.form_id, "form-1");
                assert_eq!(p.conditions.len(), 1);
                assert_eq!(p.if_not_exists.as_deref(), Some("fallback"));
                assert_eq!(p.match_mode, MatchMode::All);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(step.next.alternative.as_deref(), Some("minor"));
    }

    #[test]
    fn test_original_kind_names() {
        let start: Step =
            serde_json::from_value(json!({"id": "start", "type": "circle", "next": {"default-source": "a"}}))
                .unwrap();
        assert_eq!(start.kind, StepKind::Start);
        assert_eq!(start.next.default.as_deref(), Some("a"));

        let sign: Step = serde_json::from_value(json!({
            "id": "sign",
            "kind": "clicksign",
            "payload": {"documentKey": "doc-1", "signers": [{"name": "A", "email": "a@x.io"}]}
        }))
        .unwrap();
        match sign.kind {
            StepKind::ESign(p) => {
                assert_eq!(p.document_key, "doc-1");
                assert!(p.wait_for_signatures);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_step_survives_storage_round_trip() {
        let original = Step {
            id: "ask".into(),
            name: Some("Ask manager".into()),
            kind: StepKind::Interaction(InteractionPayload {
                form_id: "approval".into(),
                to: vec!["${{activity.#users.email}}".into()],
                wait_type: Some(WaitType::All),
                ..Default::default()
            }),
            next: Next {
                default: Some("approved".into()),
                alternative: Some("rejected".into()),
            },
        };

        let text = serde_json::to_string(&original).unwrap();
        let restored: Step = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_start_step_serializes_without_payload() {
        let start = Step::new(
            START_STEP_ID,
            StepKind::Start,
            Next {
                default: Some("check".into()),
                alternative: None,
            },
        );

        let value = serde_json::to_value(&start).unwrap();
        assert_eq!(value["kind"], "start");
        assert!(value["payload"].is_null());

        let restored: Step = serde_json::from_value(value).unwrap();
        assert_eq!(restored, start);
    }

    #[test]
    fn test_every_payload_kind_round_trips() {
        let steps: Vec<Step> = serde_json::from_value(json!([
            {"id": "mail", "kind": "send_email", "payload": {"to": ["users"], "subject": "Hi"}},
            {"id": "done", "kind": "change_status", "payload": {"status_id": "st-done"}},
            {"id": "swap", "kind": "swap_workflow", "payload": {"workflow_id": "wf-2"}},
            {"id": "call", "kind": "web_request", "payload": {"url": "https://x.io", "method": "POST"}},
            {"id": "calc", "kind": "script", "payload": {"script": "#{ total: 1 }"}},
            {"id": "child", "kind": "new_ticket", "payload": {"form_id": "f-2"}}
        ]))
        .unwrap();

        let text = serde_json::to_string(&steps).unwrap();
        let restored: Vec<Step> = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, steps);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: std::result::Result<Step, _> =
            serde_json::from_value(json!({"id": "x", "kind": "teleport"}));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("teleport"));
    }
}
