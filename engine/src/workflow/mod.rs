//! Workflow Orchestration
//!
//! Turns a task description into a role-graph of steps, executes the
//! steps against a step backend, and forwards compacted context between
//! them.

pub mod context;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod types;

pub use context::ContextCompactor;
pub use executor::{CancelHandle, ExecutionContext, Executor};
pub use planner::Planner;
pub use types::{
    Complexity, ExecutionMode, Step, StepContext, StepStatus, Task, TaskStatus, TaskType, Workflow,
};
