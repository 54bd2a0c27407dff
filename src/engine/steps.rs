//! Per-kind step semantics.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::conditions::{evaluate_answers, render_operands, value_at_path};
use super::executor::{Executor, StepOutcome, Turn};
use super::wait;
use crate::collaborators::{HttpRequest, RequestBody, ResolvedSigner, SignatureRequest};
use crate::error::{Error, Result};
use crate::smart_values::{resolve, resolve_recipients, Snapshot};
use crate::storage::{Activity, Instance, Interaction, InteractionKind};
use crate::workflow::{
    ChangeStatusPayload, ConditionalPayload, ESignPayload, InteractionPayload, NewTicketPayload,
    ScriptPayload, SendEmailPayload, Step, StepKind, SwapWorkflowPayload, WebRequestPayload,
};

impl Executor {
    /// Run one step. Errors are fatal for the instance.
    pub(super) async fn execute_step(&self, step: &Step, turn: &mut Turn) -> Result<StepOutcome> {
        let default = step.next.default.clone();
        match &step.kind {
            StepKind::Start => Ok(StepOutcome::Next(default)),
            StepKind::SendEmail(payload) => {
                self.send_email(payload, turn).await;
                Ok(StepOutcome::Next(default))
            }
            StepKind::ChangeStatus(payload) => {
                self.change_status(payload, turn).await?;
                Ok(StepOutcome::Next(default))
            }
            StepKind::SwapWorkflow(payload) => self.swap_workflow(payload, turn).await,
            StepKind::Interaction(payload) => self.open_interaction(step, payload, turn).await,
            StepKind::Conditional(payload) => self.branch(step, payload, turn).await,
            StepKind::WebRequest(payload) => {
                self.web_request(payload, turn).await?;
                Ok(StepOutcome::Next(default))
            }
            StepKind::Script(payload) => {
                self.run_script(payload, turn).await?;
                Ok(StepOutcome::Next(default))
            }
            StepKind::NewTicket(payload) => {
                self.new_ticket(payload, turn).await?;
                Ok(StepOutcome::Next(default))
            }
            StepKind::ESign(payload) => self.request_signatures(step, payload, turn).await,
        }
    }

    async fn send_email(&self, payload: &SendEmailPayload, turn: &Turn) {
        let snapshot = turn.snapshot();
        let recipients = resolve_recipients(&payload.to, &snapshot);
        self.notify(&recipients, &payload.subject, &payload.body, &snapshot)
            .await;
    }

    /// Render and send an email. Delivery problems never block the instance.
    async fn notify(&self, recipients: &[String], subject: &str, body: &str, snapshot: &Snapshot) {
        if recipients.is_empty() {
            warn!(subject = %subject, "No resolvable recipients; email skipped");
            return;
        }

        let subject = resolve(subject, snapshot);
        let body = resolve(body, snapshot);
        if let Err(e) = self.collaborators.email.send(recipients, &subject, &body).await {
            warn!(
                error = %e,
                recipients = recipients.len(),
                "Email delivery failed"
            );
        }
    }

    async fn change_status(&self, payload: &ChangeStatusPayload, turn: &mut Turn) -> Result<()> {
        let status = self
            .storage
            .get_status(&payload.status_id)
            .await?
            .ok_or_else(|| Error::Step(format!("Unknown status '{}'", payload.status_id)))?;
        self.apply_status(&mut turn.activity, status).await?;

        if let Some(subject) = &payload.subject {
            let snapshot = turn.snapshot();
            let recipients = snapshot.user_emails();
            let body = payload.body.as_deref().unwrap_or_default();
            self.notify(&recipients, subject, body, &snapshot).await;
        }
        Ok(())
    }

    async fn swap_workflow(
        &self,
        payload: &SwapWorkflowPayload,
        turn: &Turn,
    ) -> Result<StepOutcome> {
        let definition = self
            .storage
            .latest_published(&payload.workflow_id)
            .await?
            .ok_or_else(|| {
                Error::Step(format!(
                    "Workflow '{}' has no published definition",
                    payload.workflow_id
                ))
            })?;

        let instance = Instance::new(&turn.activity.id, &definition.id);
        self.storage.create_instance(&instance).await?;
        info!(
            from = %turn.instance.id,
            to = %instance.id,
            definition_id = %definition.id,
            "Swapping workflow"
        );
        Ok(StepOutcome::Swap(instance.id))
    }

    async fn open_interaction(
        &self,
        step: &Step,
        payload: &InteractionPayload,
        turn: &Turn,
    ) -> Result<StepOutcome> {
        let snapshot = turn.snapshot();
        let recipients = resolve_recipients(&payload.to, &snapshot);
        if recipients.is_empty() {
            return Err(Error::Step(
                "Interaction has no resolvable recipients".to_string(),
            ));
        }

        let quorum = wait::quorum(payload, recipients.len());
        let mut interaction = Interaction::new(
            &turn.instance,
            &step.id,
            InteractionKind::Interaction,
            recipients,
            quorum,
        );
        interaction.form_id = Some(payload.form_id.clone());
        interaction.due_at = payload
            .due_in_hours
            .map(|hours| interaction.created_at + chrono::Duration::hours(i64::from(hours)));
        self.storage.create_interaction(&interaction).await?;

        if let Some(subject) = &payload.subject {
            let body = payload.body.as_deref().unwrap_or_default();
            self.notify(&interaction.recipients, subject, body, &snapshot)
                .await;
        }

        info!(
            interaction_id = %interaction.id,
            recipients = interaction.recipients.len(),
            quorum,
            "Interaction opened"
        );
        Ok(StepOutcome::Suspend(interaction.id))
    }

    async fn branch(
        &self,
        step: &Step,
        payload: &ConditionalPayload,
        turn: &Turn,
    ) -> Result<StepOutcome> {
        let answers = if payload.form_id.is_empty() || payload.form_id == turn.activity.form_id {
            vec![turn.activity.field_map()]
        } else {
            self.storage
                .form_answers(&turn.activity.id, &payload.form_id)
                .await?
                .into_iter()
                .filter_map(|answer| match answer {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()
        };

        let conditions = render_operands(&payload.conditions, &turn.snapshot());
        let evaluation = evaluate_answers(&conditions, payload.match_mode, &answers)?;

        let next = if evaluation.passed {
            step.next.default.clone()
        } else if evaluation.unresolved && payload.if_not_exists.is_some() {
            payload.if_not_exists.clone()
        } else {
            step.next.alternative.clone()
        };
        debug!(
            step_id = %step.id,
            passed = evaluation.passed,
            unresolved = evaluation.unresolved,
            next = ?next,
            "Conditional evaluated"
        );
        Ok(StepOutcome::Next(next))
    }

    async fn web_request(&self, payload: &WebRequestPayload, turn: &mut Turn) -> Result<()> {
        let request = build_request(payload, &turn.snapshot());

        if payload.is_async {
            let http = Arc::clone(&self.collaborators.http);
            tokio::spawn(async move {
                let url = request.url.clone();
                if let Err(e) = http.send(request).await {
                    warn!(url = %url, error = %e, "Async web request failed");
                }
            });
            return Ok(());
        }

        let limit = payload
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.http_timeout());
        let response = tokio::time::timeout(limit, self.collaborators.http.send(request))
            .await
            .map_err(|_| {
                Error::Timeout(format!("Web request exceeded {}ms", limit.as_millis()))
            })??;

        if payload.field_populate.is_empty() {
            return Ok(());
        }
        for mapping in &payload.field_populate {
            match response_value(&response.body, &mapping.value) {
                Some(value) => turn.activity.upsert_field(&mapping.key, value.clone()),
                None => debug!(
                    field = %mapping.key,
                    path = %mapping.value,
                    "Response path not found; field left unchanged"
                ),
            }
        }
        self.save_fields(&mut turn.activity).await
    }

    async fn run_script(&self, payload: &ScriptPayload, turn: &mut Turn) -> Result<()> {
        let budget = self.config.script_budget();
        let snapshot = turn.snapshot();
        let evaluation = self.collaborators.scripts.evaluate(
            &payload.script,
            snapshot.to_json(),
            turn.vars.clone(),
            budget,
        );
        let result = tokio::time::timeout(budget, evaluation)
            .await
            .map_err(|_| Error::Timeout("Script exceeded its time budget".to_string()))??;

        if let Value::Object(fields) = result {
            for (id, value) in fields {
                turn.activity.upsert_field(&id, value);
            }
            self.save_fields(&mut turn.activity).await?;
        }
        Ok(())
    }

    async fn new_ticket(&self, payload: &NewTicketPayload, turn: &mut Turn) -> Result<()> {
        let snapshot = turn.snapshot();
        let name = payload
            .name
            .as_deref()
            .map(|template| resolve(template, &snapshot))
            .unwrap_or_else(|| turn.activity.name.clone());
        let status = self.storage.initial_status().await?.unwrap_or_default();

        let mut ticket = Activity::new(&payload.form_id, &name, status);
        ticket.parent_id = Some(turn.activity.id.clone());
        ticket.users = turn.activity.users.clone();
        for (field_id, template) in &payload.fields {
            ticket.upsert_field(field_id, Value::String(resolve(template, &snapshot)));
        }
        self.storage.save_activity(&ticket).await?;
        info!(
            ticket_id = %ticket.id,
            parent_id = %turn.activity.id,
            form_id = %payload.form_id,
            "Ticket created"
        );

        if let Some(instance) = self.bind_workflow(&ticket).await? {
            turn.follow_ups.push(instance.id);
        }
        Ok(())
    }

    async fn request_signatures(
        &self,
        step: &Step,
        payload: &ESignPayload,
        turn: &Turn,
    ) -> Result<StepOutcome> {
        let snapshot = turn.snapshot();
        let mut signers: Vec<ResolvedSigner> = Vec::with_capacity(payload.signers.len());
        for signer in &payload.signers {
            let email = resolve(&signer.email, &snapshot).trim().to_lowercase();
            if !email.contains('@') || signers.iter().any(|s| s.email == email) {
                continue;
            }
            signers.push(ResolvedSigner {
                name: resolve(&signer.name, &snapshot),
                email,
                role: signer.role.clone(),
            });
        }
        if signers.is_empty() {
            return Err(Error::Step(
                "E-sign step has no resolvable signer emails".to_string(),
            ));
        }

        let document_key = resolve(&payload.document_key, &snapshot);
        let fields = payload
            .fields
            .iter()
            .map(|(key, template)| (key.clone(), resolve(template, &snapshot)))
            .collect();

        if !payload.wait_for_signatures {
            let request = SignatureRequest {
                reference: format!("{}:{}", turn.instance.id, step.id),
                document_key,
                signers,
                fields,
            };
            let envelope_id = self
                .collaborators
                .signatures
                .request_signatures(&request)
                .await?;
            info!(envelope_id = %envelope_id, "Signature envelope sent; not waiting");
            return Ok(StepOutcome::Next(step.next.default.clone()));
        }

        let recipients: Vec<String> = signers.iter().map(|s| s.email.clone()).collect();
        let quorum = recipients.len() as u32;
        let interaction = Interaction::new(
            &turn.instance,
            &step.id,
            InteractionKind::Signature,
            recipients,
            quorum,
        );
        self.storage.create_interaction(&interaction).await?;

        let request = SignatureRequest {
            reference: interaction.id.clone(),
            document_key,
            signers,
            fields,
        };
        let envelope_id = self
            .collaborators
            .signatures
            .request_signatures(&request)
            .await?;
        self.storage
            .set_envelope_id(&interaction.id, &envelope_id)
            .await?;

        info!(
            interaction_id = %interaction.id,
            envelope_id = %envelope_id,
            signers = quorum,
            "Waiting for signatures"
        );
        Ok(StepOutcome::Suspend(interaction.id))
    }
}

fn build_request(payload: &WebRequestPayload, snapshot: &Snapshot) -> HttpRequest {
    let headers = payload
        .headers
        .iter()
        .map(|header| (header.key.clone(), resolve(&header.value, snapshot)))
        .collect();

    let body = match payload.body.trim() {
        "" => None,
        template => {
            let rendered = resolve(template, snapshot);
            Some(match serde_json::from_str::<Value>(&rendered) {
                Ok(json) => RequestBody::Json(json),
                Err(_) => RequestBody::Text(rendered),
            })
        }
    };

    HttpRequest {
        method: payload.method.trim().to_uppercase(),
        url: resolve(payload.url.trim(), snapshot),
        headers,
        body,
    }
}

/// `response`, `response.a.b` or `a.b` into the response body.
fn response_value<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    match path {
        "" | "response" => Some(body),
        _ => value_at_path(body, path.strip_prefix("response.").unwrap_or(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::KeyValue;
    use serde_json::json;

    #[test]
    fn test_build_request_renders_templates() {
        let snapshot = Snapshot::from_json(&json!({"name": "Order 7", "amount": 42}));
        let payload = WebRequestPayload {
            url: "https://api.example.com/orders?name={{activity.name}}".into(),
            method: "post".into(),
            headers: vec![KeyValue {
                key: "X-Amount".into(),
                value: "${{activity.amount}}".into(),
            }],
            body: r#"{"amount": {{activity.amount}}}"#.into(),
            ..Default::default()
        };

        let request = build_request(&payload, &snapshot);
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "https://api.example.com/orders?name=Order 7");
        assert_eq!(request.headers, vec![("X-Amount".into(), "42".into())]);
        assert_eq!(request.body, Some(RequestBody::Json(json!({"amount": 42}))));
    }

    #[test]
    fn test_non_json_body_is_sent_as_text() {
        let payload = WebRequestPayload {
            url: "https://example.com".into(),
            method: "POST".into(),
            body: "plain {{activity.missing}}".into(),
            ..Default::default()
        };
        let request = build_request(&payload, &Snapshot::default());
        assert_eq!(request.body, Some(RequestBody::Text("plain -".into())));
    }

    #[test]
    fn test_response_paths() {
        let body = json!({"data": {"id": 9, "tags": ["a", "b"]}});
        assert_eq!(response_value(&body, "response.data.id"), Some(&json!(9)));
        assert_eq!(response_value(&body, "data.tags.1"), Some(&json!("b")));
        assert_eq!(response_value(&body, "response"), Some(&body));
        assert_eq!(response_value(&body, "data.nope"), None);
    }
}
