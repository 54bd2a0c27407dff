//! Workflow definition parser.
//!
//! Accepts YAML or JSON, either a bare list of steps or an object with a
//! `steps` list.

use std::path::Path;

use serde::Deserialize;

use super::types::{Next, Step, StepKind, WorkflowDefinition, START_STEP_ID};
use crate::error::{Error, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionDocument {
    Steps(Vec<Step>),
    Definition(WorkflowDefinition),
}

/// Parse a definition from a YAML or JSON string.
///
/// When no step has id `start`, one is inserted pointing at the first
/// listed step.
pub fn parse_definition(text: &str) -> Result<WorkflowDefinition> {
    if text.trim().is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    let document: DefinitionDocument = serde_yaml::from_str(text).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Parse(format!("Missing required field: {}", field))
        } else {
            Error::Parse(format!("Invalid definition: {}", msg))
        }
    })?;

    let mut definition = match document {
        DefinitionDocument::Steps(steps) => WorkflowDefinition {
            id: String::new(),
            workflow_id: String::new(),
            version: 1,
            status: Default::default(),
            steps,
        },
        DefinitionDocument::Definition(definition) => definition,
    };

    if definition.steps.is_empty() {
        return Err(Error::Parse(
            "Workflow definition has no steps".to_string(),
        ));
    }

    if definition.step(START_STEP_ID).is_none() {
        let first = definition.steps[0].id.clone();
        definition.steps.insert(
            0,
            Step::new(
                START_STEP_ID,
                StepKind::Start,
                Next {
                    default: Some(first),
                    alternative: None,
                },
            ),
        );
    }

    Ok(definition)
}

/// Parse a definition from a file path.
pub fn parse_definition_file(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}
