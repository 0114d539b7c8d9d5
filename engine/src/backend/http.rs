//! HTTP Step Backend
//!
//! This module implements the StepBackend trait over a JSON HTTP endpoint.
//! The backend service receives the role, instruction, forwarded context,
//! and constraints, performs the step's reasoning work, and returns the
//! raw output together with token/cost usage and touched files.
//!
//! Key behaviors:
//! - Timeouts map to `BackendError::Timeout` (transient)
//! - Connection failures map to `BackendError::Unavailable` (transient)
//! - Malformed response bodies map to `BackendError::Parse` (fatal)

use async_trait::async_trait;
use reqwest::Client;
use sdk::types::{StepOutput, Usage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{BackendError, Result, StepBackend, StepRequest};

/// Step backend over a JSON HTTP API
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// Base URL for the backend API
    base_url: String,

    /// Model name forwarded with every request
    model: String,

    /// HTTP client for API requests
    client: Client,
}

impl HttpBackend {
    /// Create a new HTTP backend
    ///
    /// # Arguments
    /// * `base_url` - Base URL for the backend API (e.g., "http://localhost:11434")
    /// * `model` - Model name forwarded with every request
    /// * `timeout_secs` - Per-request timeout in seconds
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BackendError::InvalidRequest(format!("HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            model: model.into(),
            client,
        })
    }
}

#[async_trait]
impl StepBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, request: &StepRequest) -> Result<StepOutput> {
        let wire_request = ExecuteRequest {
            model: self.model.clone(),
            role: request.role.as_str().to_string(),
            instruction: request.instruction.clone(),
            context: request.context.clone(),
            constraints: request.constraints.clone(),
        };

        tracing::debug!(
            "Backend request: role={}, instruction_chars={}, context_chars={}",
            request.role,
            request.instruction.len(),
            request.context.as_deref().map(str::len).unwrap_or(0)
        );

        let url = format!("{}/api/execute", self.base_url);
        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&wire_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else if e.is_connect() {
                    BackendError::Unavailable(format!(
                        "Cannot connect to backend at {}. Is it running?",
                        self.base_url
                    ))
                } else {
                    BackendError::Network(e.to_string())
                }
            })?;

        tracing::debug!(
            "Backend response received in {:.1}s",
            start.elapsed().as_secs_f64()
        );

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::RateLimited);
        }
        if status.is_client_error() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::InvalidRequest(format!(
                "Backend rejected request ({}): {}",
                status, error_text
            )));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::Unavailable(format!(
                "Backend API error ({}): {}",
                status, error_text
            )));
        }

        let wire_response: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(format!("Failed to parse backend response: {}", e)))?;

        let usage = wire_response.usage.unwrap_or_default();
        Ok(StepOutput {
            raw_output: wire_response.output,
            usage: Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_tokens: usage.cache_tokens,
                cost: usage.cost,
            },
            touched_files: wire_response.files.unwrap_or_default(),
        })
    }
}

/// Backend API request format
#[derive(Debug, Serialize)]
struct ExecuteRequest {
    model: String,
    role: String,
    instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    constraints: Option<String>,
}

/// Backend API response format
#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    output: String,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    files: Option<Vec<String>>,
}

/// Usage block in the backend response
#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_tokens: u64,
    #[serde(default)]
    cost: f64,
}
