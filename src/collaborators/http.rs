//! HTTP client for web-request steps.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{info, warn};

use super::{HttpClient, HttpRequest, HttpResponse, RequestBody};
use crate::error::{Error, Result};

const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout defaults: {}", e);
                Client::new()
            });
        Self { client }
    }
}

/// Only absolute http(s) URLs may be called.
pub(crate) fn validate_url(url: &str) -> Result<reqwest::Url> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Step(format!("Invalid URL '{}': {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Error::Step(format!(
            "Unsupported URL scheme '{}'. Only http and https are allowed.",
            scheme
        ))),
    }
}

fn parse_method(method: &str) -> Result<Method> {
    match method.trim().to_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => Err(Error::Step(format!("Unsupported HTTP method: {}", other))),
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = validate_url(&request.url)?;
        let method = parse_method(&request.method)?;

        let mut builder = self.client.request(method, url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder = match request.body {
            Some(RequestBody::Json(body)) => builder.json(&body),
            Some(RequestBody::Text(text)) => builder.body(text),
            None => builder,
        };

        let start = std::time::Instant::now();
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body_text = response.text().await?;

        info!(
            "HTTP {} {} -> {} ({}ms)",
            request.method,
            request.url,
            status,
            start.elapsed().as_millis()
        );

        if status >= 400 {
            return Err(Error::Step(format!(
                "HTTP {} {} -> {}: {}",
                request.method, request.url, status, body_text
            )));
        }

        let body = serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));
        Ok(HttpResponse { status, body })
    }
}
