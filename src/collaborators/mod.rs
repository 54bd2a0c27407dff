//! Side-effect collaborators used by step execution.
//!
//! Every external effect (email, HTTP, script evaluation, e-signature)
//! goes through one of these traits so the executor can be driven with
//! in-process stand-ins.

mod email;
mod http;
mod script;
mod signature;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::Result;

pub use email::{email_dispatcher_from_config, LogEmailDispatcher, ResendDispatcher, SendGridDispatcher};
pub use http::ReqwestHttpClient;
pub use script::RhaiScriptEvaluator;
pub use signature::{DisabledSignatureProvider, HttpSignatureProvider};

/// Sends rendered emails.
#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed JSON, or the raw text as a string value
    pub body: Value,
}

/// Performs web-request steps. Status codes >= 400 are errors.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Evaluates script steps against a read-only activity snapshot.
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        script: &str,
        activity: Value,
        vars: HashMap<String, String>,
        budget: Duration,
    ) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSigner {
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureRequest {
    /// Echoed back by the provider with each completion
    pub reference: String,
    pub document_key: String,
    pub signers: Vec<ResolvedSigner>,
    pub fields: BTreeMap<String, String>,
}

/// Creates signature envelopes at an external provider.
#[async_trait]
pub trait SignatureProvider: Send + Sync {
    /// Returns the provider's envelope id.
    async fn request_signatures(&self, request: &SignatureRequest) -> Result<String>;
}

/// The full set of collaborators handed to the executor.
#[derive(Clone)]
pub struct Collaborators {
    pub email: Arc<dyn EmailDispatcher>,
    pub http: Arc<dyn HttpClient>,
    pub scripts: Arc<dyn ScriptEvaluator>,
    pub signatures: Arc<dyn SignatureProvider>,
}

impl Collaborators {
    /// Default implementations chosen by configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let signatures: Arc<dyn SignatureProvider> = match &config.esign.endpoint {
            Some(endpoint) => Arc::new(HttpSignatureProvider::new(
                endpoint,
                config.esign.api_key.clone(),
            )),
            None => Arc::new(DisabledSignatureProvider),
        };

        Ok(Self {
            email: email_dispatcher_from_config(&config.email)?,
            http: Arc::new(ReqwestHttpClient::new(config.engine.http_timeout())),
            scripts: Arc::new(RhaiScriptEvaluator::new()),
            signatures,
        })
    }
}
