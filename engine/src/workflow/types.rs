//! Workflow data model
//!
//! Tasks, workflows, steps, and the compacted step context forwarded
//! between steps. The planner produces a `Workflow` once; the executor
//! mutates only per-step status and result fields.

use chrono::{DateTime, Utc};
use sdk::types::{Role, Usage};
use serde::{Deserialize, Serialize};

/// Declared type of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    BugFix,
    Review,
    Custom,
    /// Infer the type from the description
    Auto,
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Feature => "feature",
            TaskType::BugFix => "bug_fix",
            TaskType::Review => "review",
            TaskType::Custom => "custom",
            TaskType::Auto => "auto",
        }
    }

    /// Parse a declared type name. Unknown names are an error: the caller
    /// asked for something specific and we cannot honor it.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "feature" => Some(TaskType::Feature),
            "bug_fix" | "bugfix" => Some(TaskType::BugFix),
            "review" => Some(TaskType::Review),
            "custom" => Some(TaskType::Custom),
            "auto" => Some(TaskType::Auto),
            _ => None,
        }
    }
}

/// Complexity classification driving template and scoping decisions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Complex,
}

/// Concurrency mode for a workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Strict declared order; each step receives the previous step's context
    Sequential,
    /// All steps concurrent, no forwarded context
    Parallel,
    /// Dependency-driven eligibility with bounded concurrency
    DependencyGraph,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::DependencyGraph => "dependency_graph",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "sequential" => Some(ExecutionMode::Sequential),
            "parallel" => Some(ExecutionMode::Parallel),
            "dependency_graph" | "graph" => Some(ExecutionMode::DependencyGraph),
            _ => None,
        }
    }
}

/// Status of one step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never ran: a dependency failed or the task was cancelled
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Terminal states: the step will not change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// One unit of delegated work within a task's workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step id, unique within the workflow
    pub id: String,

    /// Assigned role
    pub role: Role,

    /// Scoped instruction text
    pub instruction: String,

    /// Declarative constraints (e.g. "basic validation only")
    pub constraints: Option<String>,

    /// Ids of steps that must complete before this one starts
    pub dependencies: Vec<String>,

    /// Steps sharing a group number may run concurrently
    pub group: u32,

    /// Optional steps may fail without failing the task
    pub optional: bool,

    /// Current status
    pub status: StepStatus,

    /// Resource usage once executed
    pub usage: Usage,

    /// Raw backend output once completed
    pub raw_output: Option<String>,

    /// Compacted context produced from the raw output
    pub context: Option<StepContext>,

    /// Error message once failed
    pub error: Option<String>,
}

impl Step {
    /// Create a pending step
    pub fn new(id: impl Into<String>, role: Role, instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            instruction: instruction.into(),
            constraints: None,
            dependencies: Vec::new(),
            group: 0,
            optional: false,
            status: StepStatus::Pending,
            usage: Usage::default(),
            raw_output: None,
            context: None,
            error: None,
        }
    }

    /// Attach constraints
    pub fn with_constraints(mut self, constraints: impl Into<String>) -> Self {
        self.constraints = Some(constraints.into());
        self
    }

    /// Declare dependencies
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Assign the execution group
    pub fn with_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// Mark the step optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Compacted representation of a completed step's output
///
/// Immutable once produced; referenced by every downstream step that
/// depends on the source step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepContext {
    /// Id of the step that produced this context
    pub source_step: String,

    /// Bounded summary text
    pub summary: String,

    /// Distinct file paths mentioned as read/written, in order of mention
    pub files: Vec<String>,

    /// Short bullet findings, in order of appearance
    pub findings: Vec<String>,
}

impl StepContext {
    /// An empty-but-valid context for a step
    pub fn empty(source_step: impl Into<String>) -> Self {
        Self {
            source_step: source_step.into(),
            summary: String::new(),
            files: Vec::new(),
            findings: Vec::new(),
        }
    }

    /// Serialized size in characters, matching `render()` output length
    pub fn serialized_len(&self) -> usize {
        self.render().len()
    }

    /// Render the forwarded text handed to downstream steps
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.summary.len() + 64);
        out.push_str(&self.summary);
        if !self.files.is_empty() {
            out.push_str("\nFiles: ");
            out.push_str(&self.files.join(", "));
        }
        for finding in &self.findings {
            out.push_str("\n- ");
            out.push_str(finding);
        }
        out
    }

    /// Whether the context carries no information at all
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty() && self.files.is_empty() && self.findings.is_empty()
    }
}

/// The resolved sequence/graph of steps for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow id
    pub id: String,

    /// Concurrency mode
    pub mode: ExecutionMode,

    /// Complexity classification that scoped the steps
    pub complexity: Complexity,

    /// Steps in declared order
    pub steps: Vec<Step>,
}

/// A unit of user work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task id
    pub id: String,

    /// User-supplied description
    pub description: String,

    /// Declared (or inferred) type
    pub task_type: TaskType,

    /// Current status
    pub status: TaskStatus,

    /// The resolved workflow
    pub workflow: Workflow,

    /// Final result: the designated final step's output
    pub result: Option<String>,

    /// Error of the originating failed step, preserved verbatim
    pub error: Option<String>,

    /// Aggregate resource usage across all steps that ran
    pub usage: Usage,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last mutation time
    pub updated_at: DateTime<Utc>,

    /// Completion time, set when terminal
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task around a resolved workflow
    pub fn new(description: impl Into<String>, task_type: TaskType, workflow: Workflow) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            task_type,
            status: TaskStatus::Pending,
            workflow,
            result: None,
            error: None,
            usage: Usage::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_parse() {
        assert_eq!(TaskType::parse("bug_fix"), Some(TaskType::BugFix));
        assert_eq!(TaskType::parse("bugfix"), Some(TaskType::BugFix));
        assert_eq!(TaskType::parse("Feature"), Some(TaskType::Feature));
        assert_eq!(TaskType::parse("deploy"), None);
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!(ExecutionMode::parse("graph"), Some(ExecutionMode::DependencyGraph));
        assert_eq!(ExecutionMode::parse("sequential"), Some(ExecutionMode::Sequential));
        assert_eq!(ExecutionMode::parse("chaotic"), None);
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn test_step_builder() {
        let step = Step::new("step_2", Role::Tester, "Run checks")
            .with_constraints("basic validation only")
            .with_dependencies(vec!["step_1".to_string()])
            .with_group(1)
            .optional();

        assert_eq!(step.id, "step_2");
        assert_eq!(step.dependencies, vec!["step_1"]);
        assert_eq!(step.group, 1);
        assert!(step.optional);
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn test_context_render_and_len() {
        let ctx = StepContext {
            source_step: "step_1".to_string(),
            summary: "Looked at the login form.".to_string(),
            files: vec!["src/login.rs".to_string(), "src/form.rs".to_string()],
            findings: vec!["validation missing".to_string()],
        };

        let rendered = ctx.render();
        assert!(rendered.starts_with("Looked at the login form."));
        assert!(rendered.contains("Files: src/login.rs, src/form.rs"));
        assert!(rendered.contains("\n- validation missing"));
        assert_eq!(ctx.serialized_len(), rendered.len());
    }

    #[test]
    fn test_empty_context() {
        let ctx = StepContext::empty("step_1");
        assert!(ctx.is_empty());
        assert_eq!(ctx.serialized_len(), 0);
    }
}
