//! Read-only view of an activity as seen by templates.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::storage::{Activity, FormField};

/// Attributes with a fixed shape. Everything else is looked up in the
/// activity's dynamic field map.
const SCHEMA_ATTRIBUTES: &[&str] = &[
    "_id",
    "id",
    "name",
    "description",
    "protocol",
    "due_date",
    "parent",
    "status",
    "users",
];

const OPTION_FIELD_TYPES: &[&str] = &["select", "radio", "checkbox", "multiselect"];

/// Snapshot of an activity plus process-level variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Fixed-schema attributes, keyed by their template name.
    pub(crate) schema: Map<String, Value>,
    /// User-defined form fields by field id, option values replaced by labels.
    pub(crate) fields: Map<String, Value>,
    /// Stored field values as entered, for `&field` placeholders.
    pub(crate) raw_fields: Map<String, Value>,
    pub(crate) vars: HashMap<String, String>,
}

impl Snapshot {
    /// Build a snapshot from a stored activity.
    pub fn from_activity(activity: &Activity) -> Self {
        let users: Vec<Value> = activity
            .users
            .iter()
            .map(|user| {
                json!({
                    "_id": user.id,
                    "name": user.name,
                    "email": user.email,
                    "matriculation": user.matriculation,
                    "institutes": user.institute.as_ref().map(|i| json!({
                        "name": i.name,
                        "acronym": i.acronym,
                    })),
                })
            })
            .collect();

        let mut schema = Map::new();
        schema.insert("_id".into(), json!(activity.id));
        schema.insert("name".into(), json!(activity.name));
        schema.insert("description".into(), json!(activity.description));
        schema.insert("protocol".into(), json!(activity.protocol));
        schema.insert(
            "due_date".into(),
            json!(activity.due_date.map(|d| d.to_rfc3339())),
        );
        schema.insert("parent".into(), json!(activity.parent_id));
        schema.insert(
            "status".into(),
            json!({
                "_id": activity.status.id,
                "name": activity.status.name,
                "type": activity.status.kind,
            }),
        );
        schema.insert("users".into(), Value::Array(users));

        let mut fields = Map::new();
        let mut raw_fields = Map::new();
        for field in activity.fields.iter().filter(|f| !f.system) {
            fields.insert(field.id.clone(), display_value(field));
            raw_fields.insert(field.id.clone(), field.value.clone());
        }

        Self {
            schema,
            fields,
            raw_fields,
            vars: HashMap::new(),
        }
    }

    /// Build a snapshot straight from a JSON object. Known attribute names
    /// go to the fixed schema, every other key becomes a dynamic field.
    pub fn from_json(activity: &Value) -> Self {
        let mut snapshot = Self::default();
        if let Some(obj) = activity.as_object() {
            for (key, value) in obj {
                if is_schema_attribute(key) {
                    snapshot
                        .schema
                        .insert(canonical_attribute(key).to_string(), value.clone());
                } else {
                    snapshot.fields.insert(key.clone(), value.clone());
                    snapshot.raw_fields.insert(key.clone(), value.clone());
                }
            }
        }
        snapshot
    }

    /// Attach process-level variables (`vars.*`).
    pub fn with_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.vars = vars;
        self
    }

    /// Two-phase root lookup: fixed schema first, dynamic fields second.
    pub(crate) fn root(&self, name: &str) -> Option<&Value> {
        if is_schema_attribute(name) {
            self.schema.get(canonical_attribute(name))
        } else {
            self.fields.get(name)
        }
    }

    pub(crate) fn raw_field(&self, id: &str) -> Option<&Value> {
        self.raw_fields.get(id)
    }

    pub(crate) fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Emails of every user on the activity.
    pub fn user_emails(&self) -> Vec<String> {
        self.schema
            .get("users")
            .and_then(Value::as_array)
            .map(|users| {
                users
                    .iter()
                    .filter_map(|u| u.get("email").and_then(Value::as_str))
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The whole snapshot as one JSON object (schema and fields merged),
    /// handed to script steps.
    pub fn to_json(&self) -> Value {
        let mut merged = self.fields.clone();
        for (key, value) in &self.schema {
            merged.insert(key.clone(), value.clone());
        }
        Value::Object(merged)
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }
}

fn is_schema_attribute(name: &str) -> bool {
    SCHEMA_ATTRIBUTES.contains(&name)
}

fn canonical_attribute(name: &str) -> &str {
    if name == "id" {
        "_id"
    } else {
        name
    }
}

/// Option fields render their labels, multi-valued ones joined with ", ".
fn display_value(field: &FormField) -> Value {
    if !OPTION_FIELD_TYPES.contains(&field.field_type.as_str()) || field.options.is_empty() {
        return field.value.clone();
    }

    let label_for = |value: &Value| -> Value {
        field
            .options
            .iter()
            .find(|option| &option.value == value)
            .map(|option| Value::String(option.label.clone()))
            .unwrap_or_else(|| value.clone())
    };

    match &field.value {
        Value::Array(values) => {
            let labels: Vec<String> = values
                .iter()
                .map(|v| match label_for(v) {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect();
            Value::String(labels.join(", "))
        }
        Value::Null => Value::Null,
        single => label_for(single),
    }
}
