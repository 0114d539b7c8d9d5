//! Error types and handling
//!
//! This module provides the error taxonomy used throughout the Cadence
//! engine. All errors implement the `CadenceErrorExt` trait which provides
//! user-friendly hints and indicates whether errors are recoverable.
//!
//! Error messages shown to users name the failing step and its role, never
//! a stack trace or backend-internal detail.

use crate::types::Role;
use thiserror::Error;

/// Trait for Cadence error extensions
///
/// Provides additional context for errors: a hint safe to display to end
/// users, and whether the operation can be retried or worked around.
pub trait CadenceErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors require a corrected task or workflow.
    fn is_recoverable(&self) -> bool;
}

/// Main orchestrator error type
///
/// # Error Categories
///
/// - **Planning**: invalid task input, failed planning sub-calls
/// - **Workflow**: dependency cycles detected before execution
/// - **Execution**: step backend failures, transient or fatal
/// - **Ambient**: configuration, persistence, IO
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Task description or declared type could not produce a workflow
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Planning sub-call returned empty or unparseable output, even after
    /// the single stricter-format retry
    #[error("Planning backend error: {0}")]
    PlanningBackend(String),

    /// Workflow dependency graph contains a cycle
    #[error("Workflow dependency cycle involving step {step_id}")]
    CyclicWorkflow { step_id: String },

    /// A step's backend call failed
    #[error("Step {step_id} ({role}) failed: {message}")]
    StepExecution {
        step_id: String,
        role: Role,
        message: String,
        /// Transient failures are eligible for one executor-level retry
        transient: bool,
    },

    /// Task was cancelled before completion
    #[error("Task cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Persistence errors
    #[error("Database error: {0}")]
    Database(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceErrorExt for OrchestratorError {
    fn user_hint(&self) -> &str {
        match self {
            Self::InvalidTask(_) => "Provide a non-empty description and a known task type",
            Self::PlanningBackend(_) => {
                "The planning backend returned unusable output. Check the backend and try again"
            }
            Self::CyclicWorkflow { .. } => {
                "The workflow contains circular dependencies and cannot run"
            }
            Self::StepExecution { transient, .. } => {
                if *transient {
                    "A step failed transiently. Running the task again may succeed"
                } else {
                    "A step failed. Inspect the step's error and adjust the task"
                }
            }
            Self::Cancelled => "The task was cancelled before it finished",
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Persistence failed. Task execution is unaffected",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::InvalidTask(_) | Self::CyclicWorkflow { .. } => false,
            Self::StepExecution { transient, .. } => *transient,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
