//! HTTP utilities for GCP REST API calls

use anyhow::{Context, Result};
use reqwest::{Client, Method};
use serde_json::Value;

/// Maximum length of response body to log
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Truncate a response body and strip control characters before logging
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// HTTP client wrapper for GCP API calls
#[derive(Clone)]
pub struct GcpHttpClient {
    client: Client,
}

impl GcpHttpClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("resfilter/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    pub async fn get(&self, url: &str, token: &str) -> Result<Value> {
        self.send(Method::GET, url, token, None).await
    }

    pub async fn post(&self, url: &str, token: &str, body: Option<&Value>) -> Result<Value> {
        self.send(Method::POST, url, token, body).await
    }

    pub async fn patch(&self, url: &str, token: &str, body: &Value) -> Result<Value> {
        self.send(Method::PATCH, url, token, Some(body)).await
    }

    pub async fn delete(&self, url: &str, token: &str) -> Result<Value> {
        self.send(Method::DELETE, url, token, None).await
    }

    /// Send a request. Non-2xx statuses become `API request failed: <status>`.
    async fn send(&self, method: Method, url: &str, token: &str, body: Option<&Value>) -> Result<Value> {
        tracing::debug!("{} {}", method, url);

        let mut request = self.client.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.context("Failed to send request")?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            // Only a truncated body is logged
            tracing::error!("API error: {} - {}", status, sanitize_for_log(&response_body));
            return Err(anyhow::anyhow!("API request failed: {}", status));
        }

        if response_body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&response_body).context("Failed to parse response JSON")
    }
}
