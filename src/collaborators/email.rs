//! Email dispatchers.
//!
//! Supported providers:
//! - `log` - writes the message to the log, sends nothing
//! - `resend` - Resend HTTP API
//! - `sendgrid` - SendGrid v3 HTTP API

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::EmailDispatcher;
use crate::config::EmailConfig;
use crate::error::{Error, Result};

/// Pick a dispatcher for the configured provider.
pub fn email_dispatcher_from_config(config: &EmailConfig) -> Result<Arc<dyn EmailDispatcher>> {
    match config.provider.to_lowercase().as_str() {
        "log" => Ok(Arc::new(LogEmailDispatcher)),
        "resend" => {
            let api_key = require_api_key(config, "Resend")?;
            Ok(Arc::new(ResendDispatcher::new(&config.from, api_key)))
        }
        "sendgrid" => {
            let api_key = require_api_key(config, "SendGrid")?;
            Ok(Arc::new(SendGridDispatcher::new(&config.from, api_key)))
        }
        other => Err(Error::Config(format!(
            "Unknown email provider '{}'. Use log, resend or sendgrid",
            other
        ))),
    }
}

fn require_api_key(config: &EmailConfig, provider: &str) -> Result<String> {
    config
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| Error::Config(format!("{} requires email.api_key", provider)))
}

/// Logs messages instead of sending them.
pub struct LogEmailDispatcher;

#[async_trait]
impl EmailDispatcher for LogEmailDispatcher {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        info!(
            recipients = %recipients.join(", "),
            subject = %subject,
            body_len = body.len(),
            "Email (log provider)"
        );
        Ok(())
    }
}

pub struct ResendDispatcher {
    client: Client,
    from: String,
    api_key: String,
}

impl ResendDispatcher {
    pub fn new(from: &str, api_key: String) -> Self {
        Self {
            client: Client::new(),
            from: from.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl EmailDispatcher for ResendDispatcher {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        let payload = json!({
            "from": self.from,
            "to": recipients,
            "subject": subject,
            "html": body,
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let response_body: Value = response.json().await.unwrap_or(json!({}));
        if status.is_success() {
            debug!(id = %response_body["id"], "Resend accepted email");
            Ok(())
        } else {
            Err(Error::Execution(format!(
                "Resend error {}: {}",
                status, response_body
            )))
        }
    }
}

pub struct SendGridDispatcher {
    client: Client,
    from: String,
    api_key: String,
}

impl SendGridDispatcher {
    pub fn new(from: &str, api_key: String) -> Self {
        Self {
            client: Client::new(),
            from: from.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl EmailDispatcher for SendGridDispatcher {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
        let to: Vec<Value> = recipients.iter().map(|e| json!({"email": e})).collect();
        let payload = json!({
            "personalizations": [{"to": to}],
            "from": {"email": self.from},
            "subject": subject,
            "content": [{"type": "text/html", "value": body}],
        });

        let response = self
            .client
            .post("https://api.sendgrid.com/v3/mail/send")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let error_body = response.text().await.unwrap_or_default();
            Err(Error::Execution(format!(
                "SendGrid error {}: {}",
                status, error_body
            )))
        }
    }
}
