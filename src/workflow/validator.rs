//! Workflow validation.
//!
//! `validate` checks one step's required fields. `validate_definition`
//! adds the structural checks and runs `validate` over every step
//! reachable from `start`. Publishing requires an empty result.

use std::fmt;

use serde::Serialize;

use super::graph::StepGraph;
use super::types::{
    Condition, Operator, Step, StepKind, WaitType, WorkflowDefinition, START_STEP_ID,
};
use crate::error::{Error, Result};

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

/// One problem found in a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub step_id: String,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(step_id: &str, field: &str, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' {}: {}", self.step_id, self.field, self.message)
    }
}

/// Per-kind required field rules for a single step.
pub fn validate(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let id = step.id.as_str();

    match &step.kind {
        StepKind::Start => {}
        StepKind::SendEmail(p) => {
            require(&mut errors, id, "subject", &p.subject);
            if blank_list(&p.to) {
                errors.push(ValidationError::new(id, "to", "needs at least one recipient"));
            }
        }
        StepKind::ChangeStatus(p) => require(&mut errors, id, "status_id", &p.status_id),
        StepKind::SwapWorkflow(p) => require(&mut errors, id, "workflow_id", &p.workflow_id),
        StepKind::Interaction(p) => {
            require(&mut errors, id, "form_id", &p.form_id);
            if blank_list(&p.to) {
                errors.push(ValidationError::new(id, "to", "needs a recipient template"));
            }
            if p.wait_type == Some(WaitType::Custom)
                && p.wait_value.unwrap_or(0) == 0
            {
                errors.push(ValidationError::new(
                    id,
                    "wait_value",
                    "must be at least 1 for custom wait",
                ));
            }
            check_conditions(id, &p.conditions, &mut errors);
        }
        StepKind::Conditional(p) => {
            require(&mut errors, id, "form_id", &p.form_id);
            if p.conditions.is_empty() {
                errors.push(ValidationError::new(id, "conditions", "must not be empty"));
            }
            check_conditions(id, &p.conditions, &mut errors);
        }
        StepKind::WebRequest(p) => {
            require(&mut errors, id, "method", &p.method);
            require(&mut errors, id, "url", &p.url);
            if !p.method.trim().is_empty()
                && !HTTP_METHODS.contains(&p.method.trim().to_uppercase().as_str())
            {
                errors.push(ValidationError::new(
                    id,
                    "method",
                    format!("unsupported method '{}'", p.method),
                ));
            }
            let url = p.url.trim();
            if !url.is_empty()
                && !url.contains("{{")
                && !(url.starts_with("http://") || url.starts_with("https://"))
            {
                errors.push(ValidationError::new(id, "url", "must be an http or https URL"));
            }
        }
        StepKind::Script(p) => require(&mut errors, id, "script", &p.script),
        StepKind::NewTicket(p) => require(&mut errors, id, "form_id", &p.form_id),
        StepKind::ESign(p) => {
            require(&mut errors, id, "document_key", &p.document_key);
            if p.signers.is_empty() {
                errors.push(ValidationError::new(id, "signers", "needs at least one signer"));
            }
            for (i, signer) in p.signers.iter().enumerate() {
                if signer.email.trim().is_empty() {
                    errors.push(ValidationError::new(
                        id,
                        &format!("signers[{}].email", i),
                        "is required",
                    ));
                }
            }
        }
    }

    errors
}

/// Structural checks plus `validate` for every step reachable from `start`.
pub fn validate_definition(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let graph = StepGraph::new(definition.clone());
    let mut errors = Vec::new();

    for id in graph.duplicate_ids() {
        errors.push(ValidationError::new(id, "id", "is declared more than once"));
    }

    match graph.step(START_STEP_ID) {
        None => errors.push(ValidationError::new(START_STEP_ID, "id", "start step is missing")),
        Some(start) if start.kind != StepKind::Start => errors.push(ValidationError::new(
            START_STEP_ID,
            "kind",
            "must be a start step",
        )),
        Some(_) => {}
    }

    for step in &definition.steps {
        if step.kind == StepKind::Start && step.id != START_STEP_ID {
            errors.push(ValidationError::new(
                &step.id,
                "kind",
                "only the step with id 'start' may be a start step",
            ));
        }
        if step.next.alternative.is_some() && !step.kind.is_branching() {
            errors.push(ValidationError::new(
                &step.id,
                "next.alternative",
                format!("not allowed on {} steps", step.kind.name()),
            ));
        }
        for target in graph.successors(step) {
            if !graph.contains(target) {
                errors.push(ValidationError::new(
                    &step.id,
                    "next",
                    format!("points to unknown step '{}'", target),
                ));
            }
        }
    }

    for step in graph.reachable_from_start() {
        errors.extend(validate(step));
    }

    errors
}

/// Fail with `Error::Validation` unless the definition may be published.
pub fn ensure_publishable(definition: &WorkflowDefinition) -> Result<()> {
    let errors = validate_definition(definition);
    if errors.is_empty() {
        return Ok(());
    }
    let summary: Vec<String> = errors.iter().map(ToString::to_string).collect();
    Err(Error::Validation(summary.join("; ")))
}

fn require(errors: &mut Vec<ValidationError>, step_id: &str, field: &str, value: &str) {
    if value.trim().is_empty() {
        errors.push(ValidationError::new(step_id, field, "is required"));
    }
}

fn blank_list(values: &[String]) -> bool {
    values.iter().all(|v| v.trim().is_empty())
}

fn check_conditions(step_id: &str, conditions: &[Condition], errors: &mut Vec<ValidationError>) {
    for (i, condition) in conditions.iter().enumerate() {
        if condition.field.trim().is_empty() {
            errors.push(ValidationError::new(
                step_id,
                &format!("conditions[{}].field", i),
                "is required",
            ));
        }
        if let Err(message) = condition.operator.parse::<Operator>() {
            errors.push(ValidationError::new(
                step_id,
                &format!("conditions[{}].operator", i),
                message,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_definition;
    use crate::workflow::types::*;

    fn step(kind: StepKind) -> Step {
        Step::new("s1", kind, Next::default())
    }

    fn fields(errors: &[ValidationError]) -> Vec<&str> {
        errors.iter().map(|e| e.field.as_str()).collect()
    }

    #[test]
    fn test_interaction_requires_form_and_recipients() {
        let errors = validate(&step(StepKind::Interaction(InteractionPayload::default())));
        assert_eq!(fields(&errors), vec!["form_id", "to"]);

        let ok = validate(&step(StepKind::Interaction(InteractionPayload {
            form_id: "f".into(),
            to: vec!["${{activity.#users.email}}".into()],
            ..Default::default()
        })));
        assert!(ok.is_empty());
    }

    #[test]
    fn test_conditional_requires_form_and_conditions() {
        let errors = validate(&step(StepKind::Conditional(ConditionalPayload::default())));
        assert_eq!(fields(&errors), vec!["form_id", "conditions"]);

        let bad_operator = validate(&step(StepKind::Conditional(ConditionalPayload {
            form_id: "f".into(),
            conditions: vec![Condition {
                field: "age".into(),
                operator: "~=".into(),
                value: "1".into(),
            }],
            ..Default::default()
        })));
        assert_eq!(fields(&bad_operator), vec!["conditions[0].operator"]);
    }

    #[test]
    fn test_web_request_requires_method_and_url() {
        let errors = validate(&step(StepKind::WebRequest(WebRequestPayload::default())));
        assert_eq!(fields(&errors), vec!["method", "url"]);

        let ftp = validate(&step(StepKind::WebRequest(WebRequestPayload {
            method: "GET".into(),
            url: "ftp://example.com".into(),
            ..Default::default()
        })));
        assert_eq!(fields(&ftp), vec!["url"]);

        let templated = validate(&step(StepKind::WebRequest(WebRequestPayload {
            method: "post".into(),
            url: "${{vars.API}}/hook".into(),
            ..Default::default()
        })));
        assert!(templated.is_empty());
    }

    #[test]
    fn test_esign_requires_document_and_signer() {
        let errors = validate(&step(StepKind::ESign(ESignPayload::default())));
        assert_eq!(fields(&errors), vec!["document_key", "signers"]);
    }

    #[test]
    fn test_definition_structure() {
        let definition = parse_definition(
            r#"
- id: start
  kind: start
  next: { default: mail, alternative: other }
- id: mail
  kind: send_email
  payload: { to: [users], subject: "Hi" }
  next: { default: missing }
"#,
        )
        .unwrap();

        let errors = validate_definition(&definition);
        assert!(errors
            .iter()
            .any(|e| e.step_id == "start" && e.field == "next.alternative"));
        assert!(errors
            .iter()
            .any(|e| e.step_id == "mail" && e.message.contains("missing")));
        assert!(ensure_publishable(&definition).is_err());
    }

    #[test]
    fn test_unreachable_steps_do_not_block_publishing() {
        let definition = parse_definition(
            r#"
- id: start
  kind: start
  next: { default: run }
- id: run
  kind: script
  payload: { script: "1 + 1" }
- id: draft-leftover
  kind: web_request
"#,
        )
        .unwrap();

        assert!(validate_definition(&definition).is_empty());
        assert!(ensure_publishable(&definition).is_ok());
    }

    #[test]
    fn test_reachable_invalid_step_blocks_publishing() {
        let definition = parse_definition(
            r#"
- id: start
  kind: start
  next: { default: call }
- id: call
  kind: web_request
  payload: { method: GET }
"#,
        )
        .unwrap();

        let err = ensure_publishable(&definition).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("url"));
    }
}
