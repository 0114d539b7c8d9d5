//! Role, usage, and step output types
//!
//! These types cross the boundary between the engine and step backend
//! implementations: the engine hands a role and instruction to a backend,
//! the backend hands back a `StepOutput`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role assigned to a workflow step
///
/// Roles form a closed set so that constraint lookup and template selection
/// stay exhaustiveness-checked. Unknown role names parse into `Custom`
/// rather than failing, since plans may come from a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Investigates the codebase or problem space before building
    Researcher,

    /// Produces a plan (used for the planning sub-call, never executed as
    /// part of a workflow)
    Planner,

    /// Implements the change
    Builder,

    /// Verifies the change
    Tester,

    /// Reviews the completed work
    Reviewer,

    /// Writes documentation for the change
    Documenter,

    /// Caller-defined role
    Custom(String),
}

impl Role {
    /// Stable string form used in persistence and event payloads
    pub fn as_str(&self) -> &str {
        match self {
            Role::Researcher => "researcher",
            Role::Planner => "planner",
            Role::Builder => "builder",
            Role::Tester => "tester",
            Role::Reviewer => "reviewer",
            Role::Documenter => "documenter",
            Role::Custom(name) => name,
        }
    }

    /// Parse a role name; unknown names become `Custom`
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "researcher" => Role::Researcher,
            "planner" => Role::Planner,
            "builder" => Role::Builder,
            "tester" => Role::Tester,
            "reviewer" => Role::Reviewer,
            "documenter" => Role::Documenter,
            other => Role::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resource usage for one step or one whole task
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    /// Input tokens consumed
    pub input_tokens: u64,

    /// Output tokens produced
    pub output_tokens: u64,

    /// Tokens served from cache
    pub cache_tokens: u64,

    /// Cost in USD
    pub cost: f64,
}

impl Usage {
    /// Accumulate another usage record into this one
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_tokens += other.cache_tokens;
        self.cost += other.cost;
    }

    /// Total token count across all categories
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_tokens
    }
}

/// Output produced by a backend for one executed step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    /// Raw free-form output text
    pub raw_output: String,

    /// Resource usage for the call
    pub usage: Usage,

    /// Files the backend reported reading or writing
    pub touched_files: Vec<String>,
}
