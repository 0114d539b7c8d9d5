//! Step Backend Abstraction Layer
//!
//! This module provides the interface to the external reasoning backend
//! that actually performs a step's work. The `StepBackend` trait defines
//! the contract: given a role, an instruction, and optional forwarded
//! context, produce raw output, resource usage, and touched files.
//!
//! The executor treats every backend call as potentially long-running and
//! distinguishes transient failures (retried once) from fatal ones.

use async_trait::async_trait;
use sdk::types::{Role, StepOutput};
use serde::{Deserialize, Serialize};

pub mod http;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur during a backend call
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    Parse(String),
}

impl BackendError {
    /// Whether the failure is transient and eligible for a single
    /// executor-level retry
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable(_)
            | BackendError::RateLimited
            | BackendError::Network(_)
            | BackendError::Timeout => true,
            BackendError::InvalidRequest(_) | BackendError::Parse(_) => false,
        }
    }
}

/// Request for one step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    /// Role the backend should assume for this step
    pub role: Role,

    /// Scoped instruction text
    pub instruction: String,

    /// Forwarded context from upstream steps, already compacted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Declarative constraints attached by the planner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
}

impl StepRequest {
    /// Create a request with no forwarded context or constraints
    pub fn new(role: Role, instruction: impl Into<String>) -> Self {
        Self {
            role,
            instruction: instruction.into(),
            context: None,
            constraints: None,
        }
    }

    /// Attach forwarded context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attach constraints
    pub fn with_constraints(mut self, constraints: impl Into<String>) -> Self {
        self.constraints = Some(constraints.into());
        self
    }
}

/// Step backend trait that all backends must implement
#[async_trait]
pub trait StepBackend: Send + Sync {
    /// Returns the name of the backend (e.g., "http")
    fn name(&self) -> &str;

    /// Execute one step and return its output
    ///
    /// # Arguments
    /// * `request` - Role, instruction, forwarded context, and constraints
    ///
    /// # Returns
    /// * `Ok(StepOutput)` - Raw output, usage, and touched files
    /// * `Err(BackendError)` - Transient or fatal failure
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput>;
}
