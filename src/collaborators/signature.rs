//! E-signature providers.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::info;

use super::{SignatureProvider, SignatureRequest};
use crate::error::{Error, Result};

/// Posts envelopes as JSON to a configured endpoint.
///
/// The endpoint answers with `{"envelope_id": "..."}` (or `{"id": "..."}`)
/// and later reports each signer through a callback carrying the request
/// `reference`.
pub struct HttpSignatureProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSignatureProvider {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl SignatureProvider for HttpSignatureProvider {
    async fn request_signatures(&self, request: &SignatureRequest) -> Result<String> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(Error::Step(format!(
                "Signature provider error {}: {}",
                status, body
            )));
        }

        let envelope_id = body
            .get("envelope_id")
            .or_else(|| body.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::Step("Signature provider response has no envelope id".to_string())
            })?;

        info!(
            envelope_id = %envelope_id,
            signers = request.signers.len(),
            "Signature envelope created"
        );
        Ok(envelope_id.to_string())
    }
}

/// Used when no provider is configured; every request fails.
pub struct DisabledSignatureProvider;

#[async_trait]
impl SignatureProvider for DisabledSignatureProvider {
    async fn request_signatures(&self, _request: &SignatureRequest) -> Result<String> {
        Err(Error::Config(
            "No e-signature provider configured (esign.endpoint)".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_disabled_provider_fails() {
        let request = SignatureRequest {
            reference: "int-1".into(),
            document_key: "doc".into(),
            signers: vec![],
            fields: BTreeMap::new(),
        };
        let err = DisabledSignatureProvider
            .request_signatures(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
