//! Workflow Planner
//!
//! Turns `(description, declared type, optional mode override)` into a
//! `Workflow`. Complexity is estimated first and drives which optional
//! roles are included and how verification steps are scoped. A backend
//! can optionally be attached to delegate planning to a model-proposed
//! graph; that planning call is billed on the task but is never one of
//! the workflow's execution steps.

use crate::backend::{StepBackend, StepRequest};
use crate::workflow::graph::StepGraph;
use crate::workflow::types::{
    Complexity, ExecutionMode, Step, Task, TaskType, Workflow,
};
use sdk::errors::OrchestratorError;
use sdk::types::{Role, Usage};
use serde::Deserialize;
use std::sync::Arc;

/// Descriptions at or above this length are treated as complex
const COMPLEX_DESCRIPTION_CHARS: usize = 200;

/// Keywords that flag multi-file or structural work
const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "migrate",
    "migration",
    "architecture",
    "redesign",
    "rewrite",
    "across",
    "multiple",
    "system-wide",
    "concurrency",
    "protocol",
    "integrate",
];

pub struct Planner {
    /// Optional backend for model-assisted planning
    backend: Option<Arc<dyn StepBackend>>,
}

/// Intermediate deserialization type for model-proposed plan steps
#[derive(Debug, Deserialize)]
struct RawPlannedStep {
    id: Option<String>,
    role: Option<String>,
    instruction: String,
    #[serde(default)]
    dependencies: Vec<String>,
    group: Option<u32>,
    #[serde(default)]
    optional: bool,
    constraints: Option<String>,
}

impl Planner {
    /// Create a heuristic-only planner
    pub fn new() -> Self {
        Self { backend: None }
    }

    /// Create a planner that delegates a planning sub-call to a backend
    pub fn with_backend(backend: Arc<dyn StepBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Produce a task with a resolved workflow.
    ///
    /// Fails with `InvalidTask` when the description is empty. When a
    /// backend is attached, planning is delegated to it with one stricter
    /// retry before `PlanningBackend` is surfaced; without one, the
    /// heuristic templates are used.
    pub async fn plan(
        &self,
        description: &str,
        declared_type: TaskType,
        mode_override: Option<ExecutionMode>,
    ) -> Result<Task, OrchestratorError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(OrchestratorError::InvalidTask(
                "Task description is empty".to_string(),
            ));
        }

        let task_type = resolve_task_type(description, declared_type);
        let complexity = estimate_complexity(description, task_type);

        let (mut steps, planning_usage) = match &self.backend {
            Some(backend) => {
                let (steps, usage) = self
                    .plan_with_backend(backend.as_ref(), description, task_type, complexity)
                    .await?;
                (steps, usage)
            }
            None => (template_steps(description, task_type, complexity), Usage::default()),
        };

        for step in &mut steps {
            if step.constraints.is_none() {
                step.constraints = default_constraints(&step.role).map(String::from);
            }
        }

        // Validate the dependency structure before handing the workflow out
        StepGraph::build(&steps)?;

        let mode = match mode_override {
            Some(ExecutionMode::Parallel) if steps.iter().any(|s| !s.dependencies.is_empty()) => {
                return Err(OrchestratorError::InvalidTask(
                    "Parallel mode requires a workflow without dependencies".to_string(),
                ));
            }
            Some(mode) => mode,
            None => resolve_mode(&steps),
        };

        let workflow = Workflow {
            id: uuid::Uuid::new_v4().to_string(),
            mode,
            complexity,
            steps,
        };

        let mut task = Task::new(description, task_type, workflow);
        task.usage.add(&planning_usage);

        tracing::info!(
            "Planned task {}: type={}, complexity={:?}, mode={}, steps={}",
            task.id,
            task.task_type.as_str(),
            complexity,
            task.workflow.mode.as_str(),
            task.workflow.steps.len()
        );

        Ok(task)
    }

    /// Delegate planning to the backend, retrying once with a stricter
    /// output-format instruction before surfacing `PlanningBackend`.
    async fn plan_with_backend(
        &self,
        backend: &dyn StepBackend,
        description: &str,
        task_type: TaskType,
        complexity: Complexity,
    ) -> Result<(Vec<Step>, Usage), OrchestratorError> {
        let mut usage = Usage::default();
        let mut last_problem = String::new();

        for attempt in 0..2 {
            let instruction = if attempt == 0 {
                planning_instruction(description, task_type, complexity)
            } else {
                strict_planning_instruction(description, task_type, complexity)
            };

            let request = StepRequest::new(Role::Planner, instruction);
            match backend.execute(&request).await {
                Ok(output) => {
                    usage.add(&output.usage);
                    match parse_planned_steps(&output.raw_output) {
                        Ok(steps) => return Ok((steps, usage)),
                        Err(problem) => {
                            tracing::warn!(
                                "Planning output unusable (attempt {}): {}",
                                attempt + 1,
                                problem
                            );
                            last_problem = problem;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Planning call failed (attempt {}): {}", attempt + 1, e);
                    last_problem = e.to_string();
                }
            }
        }

        Err(OrchestratorError::PlanningBackend(last_problem))
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a task as simple or complex.
///
/// This is a first-class output: callers and tests rely on it, not just
/// the planner internally. Any complexity signal flags the task complex;
/// when in doubt we prefer a more thorough workflow over under-scoping.
pub fn estimate_complexity(description: &str, task_type: TaskType) -> Complexity {
    let lowered = description.to_lowercase();

    if description.len() >= COMPLEX_DESCRIPTION_CHARS {
        return Complexity::Complex;
    }
    if COMPLEX_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        return Complexity::Complex;
    }
    // A review of everything is never simple
    if task_type == TaskType::Review
        && ["entire", "whole", "all ", "full "].iter().any(|kw| lowered.contains(kw))
    {
        return Complexity::Complex;
    }
    if description.split(['.', '!', '?']).filter(|s| !s.trim().is_empty()).count() >= 4 {
        return Complexity::Complex;
    }

    Complexity::Simple
}

/// Resolve `Auto` to a concrete type from description keywords; a
/// no-match falls back to `Custom`, which carries the generic
/// build -> verify -> review template.
fn resolve_task_type(description: &str, declared: TaskType) -> TaskType {
    if declared != TaskType::Auto {
        return declared;
    }
    let lowered = description.to_lowercase();
    if ["fix", "bug", "crash", "broken", "regression"]
        .iter()
        .any(|kw| lowered.contains(kw))
    {
        TaskType::BugFix
    } else if ["review", "audit", "inspect"].iter().any(|kw| lowered.contains(kw)) {
        TaskType::Review
    } else if ["add", "implement", "create", "build", "support"]
        .iter()
        .any(|kw| lowered.contains(kw))
    {
        TaskType::Feature
    } else {
        TaskType::Custom
    }
}

/// Constraint attached to verification steps, scoped by type and
/// complexity. A declarative annotation on the step, not a runtime
/// decision by the executor.
fn verification_constraints(task_type: TaskType, complexity: Complexity) -> &'static str {
    match (task_type, complexity) {
        (TaskType::BugFix, Complexity::Simple) => "basic validation only",
        (_, Complexity::Simple) => "minimal smoke checks",
        (_, Complexity::Complex) => "exhaustive edge-case coverage",
    }
}

/// Default constraints per role, applied to any step that carries none.
/// Verification roles get their constraints from the complexity scoping
/// instead.
fn default_constraints(role: &Role) -> Option<&'static str> {
    match role {
        Role::Researcher => Some("read-only investigation"),
        Role::Builder => Some("smallest change that satisfies the task"),
        Role::Documenter => Some("user-facing notes only"),
        Role::Planner | Role::Tester | Role::Reviewer | Role::Custom(_) => None,
    }
}

/// Base role set for a task type and complexity.
///
/// Invariant: investigative roles (researcher) and documentation are
/// optional and included only for complex tasks; build/verify roles are
/// always present.
fn template_steps(description: &str, task_type: TaskType, complexity: Complexity) -> Vec<Step> {
    let verify = verification_constraints(task_type, complexity);
    let mut steps = Vec::new();
    let mut next_id = {
        let mut counter = 0u32;
        move || {
            counter += 1;
            format!("step_{}", counter)
        }
    };

    match (task_type, complexity) {
        (TaskType::Review, Complexity::Simple) => {
            steps.push(
                Step::new(
                    next_id(),
                    Role::Reviewer,
                    format!("Review: {}", description),
                )
                .with_constraints(verify),
            );
        }
        (TaskType::Review, Complexity::Complex) => {
            let research = next_id();
            steps.push(
                Step::new(
                    research.clone(),
                    Role::Researcher,
                    format!("Investigate the code relevant to: {}", description),
                )
                .optional(),
            );
            steps.push(
                Step::new(next_id(), Role::Reviewer, format!("Review: {}", description))
                    .with_constraints(verify)
                    .with_dependencies(vec![research])
                    .with_group(1),
            );
        }
        (TaskType::BugFix, Complexity::Simple) => {
            let build = next_id();
            steps.push(Step::new(
                build.clone(),
                Role::Builder,
                format!("Implement a fix for: {}", description),
            ));
            steps.push(
                Step::new(
                    next_id(),
                    Role::Tester,
                    format!("Verify the fix for: {}", description),
                )
                .with_constraints(verify)
                .with_dependencies(vec![build])
                .with_group(1),
            );
        }
        (TaskType::BugFix, Complexity::Complex) => {
            let research = next_id();
            let build = next_id();
            let test = next_id();
            steps.push(
                Step::new(
                    research.clone(),
                    Role::Researcher,
                    format!("Investigate the root cause of: {}", description),
                )
                .optional(),
            );
            steps.push(
                Step::new(
                    build.clone(),
                    Role::Builder,
                    format!("Implement a fix for: {}", description),
                )
                .with_dependencies(vec![research])
                .with_group(1),
            );
            steps.push(
                Step::new(
                    test.clone(),
                    Role::Tester,
                    format!("Verify the fix for: {}", description),
                )
                .with_constraints(verify)
                .with_dependencies(vec![build])
                .with_group(2),
            );
            steps.push(
                Step::new(
                    next_id(),
                    Role::Reviewer,
                    format!("Review the fix for: {}", description),
                )
                .with_dependencies(vec![test])
                .with_group(3),
            );
        }
        (TaskType::Feature, Complexity::Complex) => {
            let research = next_id();
            let build = next_id();
            let test = next_id();
            let document = next_id();
            steps.push(
                Step::new(
                    research.clone(),
                    Role::Researcher,
                    format!("Investigate the code relevant to: {}", description),
                )
                .optional(),
            );
            steps.push(
                Step::new(
                    build.clone(),
                    Role::Builder,
                    format!("Implement: {}", description),
                )
                .with_dependencies(vec![research])
                .with_group(1),
            );
            // Test and documentation have no data dependency on each other
            // and share a group after the build
            steps.push(
                Step::new(
                    test.clone(),
                    Role::Tester,
                    format!("Verify the implementation of: {}", description),
                )
                .with_constraints(verify)
                .with_dependencies(vec![build.clone()])
                .with_group(2),
            );
            steps.push(
                Step::new(
                    document,
                    Role::Documenter,
                    format!("Document the changes for: {}", description),
                )
                .with_dependencies(vec![build])
                .with_group(2)
                .optional(),
            );
            steps.push(
                Step::new(
                    next_id(),
                    Role::Reviewer,
                    format!("Review the completed work for: {}", description),
                )
                .with_dependencies(vec![test])
                .with_group(3),
            );
        }
        // Simple features and custom tasks share the generic
        // build -> verify -> review shape
        (TaskType::Feature, Complexity::Simple)
        | (TaskType::Custom, _)
        | (TaskType::Auto, _) => {
            let build = next_id();
            let test = next_id();
            steps.push(Step::new(
                build.clone(),
                Role::Builder,
                format!("Implement: {}", description),
            ));
            steps.push(
                Step::new(
                    test.clone(),
                    Role::Tester,
                    format!("Verify the implementation of: {}", description),
                )
                .with_constraints(verify)
                .with_dependencies(vec![build])
                .with_group(1),
            );
            steps.push(
                Step::new(
                    next_id(),
                    Role::Reviewer,
                    format!("Review the completed work for: {}", description),
                )
                .with_dependencies(vec![test])
                .with_group(2),
            );
        }
    }

    steps
}

/// Pick the mode a step list implies: a plain chain runs sequentially,
/// anything with shared groups or non-chain dependencies needs the graph
/// scheduler.
fn resolve_mode(steps: &[Step]) -> ExecutionMode {
    if steps.len() <= 1 {
        return ExecutionMode::Sequential;
    }

    let mut seen_groups = std::collections::HashSet::new();
    for step in steps {
        if !seen_groups.insert(step.group) {
            return ExecutionMode::DependencyGraph;
        }
    }

    for (i, step) in steps.iter().enumerate() {
        let is_chain_link = match i {
            0 => step.dependencies.is_empty(),
            _ => step.dependencies == [steps[i - 1].id.clone()],
        };
        if !is_chain_link {
            return ExecutionMode::DependencyGraph;
        }
    }

    ExecutionMode::Sequential
}

fn planning_instruction(description: &str, task_type: TaskType, complexity: Complexity) -> String {
    format!(
        "Break down this {} task (complexity: {:?}) into discrete steps.\n\
        Task: {}\n\n\
        Output a JSON array of steps. Each step object must have:\n\
        - \"role\": one of \"researcher\", \"builder\", \"tester\", \"reviewer\", \"documenter\"\n\
        - \"instruction\": what the step should do\n\
        - \"dependencies\": array of step ids this depends on (empty for first step)\n\
        - \"optional\": true for steps the task can succeed without\n\
        Steps are named step_1, step_2, ... in order.",
        task_type.as_str(),
        complexity,
        description
    )
}

fn strict_planning_instruction(
    description: &str,
    task_type: TaskType,
    complexity: Complexity,
) -> String {
    format!(
        "{}\n\nOutput ONLY the JSON array. No markdown fences, no prose, \
        no explanation before or after the array.",
        planning_instruction(description, task_type, complexity)
    )
}

/// Parse model output into steps, tolerating markdown fences and prose
/// around the JSON array.
fn parse_planned_steps(content: &str) -> Result<Vec<Step>, String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err("empty planning output".to_string());
    }

    // Extract the outermost JSON array from the response
    let json_str = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err("no JSON array in planning output".to_string()),
    };

    let raw_steps: Vec<RawPlannedStep> = serde_json::from_str(json_str)
        .map_err(|e| format!("planning output is not a step array: {}", e))?;

    if raw_steps.is_empty() {
        return Err("planning output contained no steps".to_string());
    }

    let steps: Vec<Step> = raw_steps
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let id = raw.id.unwrap_or_else(|| format!("step_{}", i + 1));
            let role = raw
                .role
                .as_deref()
                .map(Role::parse)
                .unwrap_or(Role::Builder);

            let mut step = Step::new(id, role, raw.instruction)
                .with_dependencies(raw.dependencies)
                .with_group(raw.group.unwrap_or(i as u32));
            if raw.optional {
                step = step.optional();
            }
            if let Some(constraints) = raw.constraints {
                step = step.with_constraints(constraints);
            }
            step
        })
        .collect();

    // A model-proposed graph with unknown deps or cycles is unusable
    // output, handled by the caller's stricter retry
    StepGraph::build(&steps).map_err(|e| format!("unusable step graph: {}", e))?;

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_bug_fix_two_step_workflow() {
        let planner = Planner::new();
        let task = planner
            .plan(
                "Add input validation to the login form",
                TaskType::BugFix,
                None,
            )
            .await
            .unwrap();

        assert_eq!(task.workflow.complexity, Complexity::Simple);
        assert_eq!(task.workflow.mode, ExecutionMode::Sequential);
        assert_eq!(task.workflow.steps.len(), 2);
        assert_eq!(task.workflow.steps[0].role, Role::Builder);
        assert_eq!(task.workflow.steps[1].role, Role::Tester);
        assert_eq!(
            task.workflow.steps[1].constraints.as_deref(),
            Some("basic validation only")
        );
        assert!(task
            .workflow
            .steps
            .iter()
            .all(|s| s.role != Role::Researcher));
    }

    #[tokio::test]
    async fn test_complex_feature_includes_optional_roles() {
        let planner = Planner::new();
        let task = planner
            .plan(
                "Refactor the storage layer across multiple modules to support pluggable backends",
                TaskType::Feature,
                None,
            )
            .await
            .unwrap();

        assert_eq!(task.workflow.complexity, Complexity::Complex);
        assert_eq!(task.workflow.mode, ExecutionMode::DependencyGraph);

        let roles: Vec<&Role> = task.workflow.steps.iter().map(|s| &s.role).collect();
        assert!(roles.contains(&&Role::Researcher));
        assert!(roles.contains(&&Role::Documenter));

        // Researcher and documenter are the optional ones
        for step in &task.workflow.steps {
            let should_be_optional =
                step.role == Role::Researcher || step.role == Role::Documenter;
            assert_eq!(step.optional, should_be_optional, "role {:?}", step.role);
        }

        // Tester and documenter share a group after the build
        let tester = task
            .workflow
            .steps
            .iter()
            .find(|s| s.role == Role::Tester)
            .unwrap();
        let documenter = task
            .workflow
            .steps
            .iter()
            .find(|s| s.role == Role::Documenter)
            .unwrap();
        assert_eq!(tester.group, documenter.group);
    }

    #[tokio::test]
    async fn test_empty_description_rejected() {
        let planner = Planner::new();
        let err = planner.plan("   ", TaskType::Feature, None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn test_auto_type_inference() {
        let planner = Planner::new();

        let task = planner
            .plan("Fix the crash when saving", TaskType::Auto, None)
            .await
            .unwrap();
        assert_eq!(task.task_type, TaskType::BugFix);

        let task = planner
            .plan("Implement dark mode", TaskType::Auto, None)
            .await
            .unwrap();
        assert_eq!(task.task_type, TaskType::Feature);

        let task = planner
            .plan("Tidy the changelog", TaskType::Auto, None)
            .await
            .unwrap();
        // No keyword match falls back to the generic template
        assert_eq!(task.task_type, TaskType::Custom);
        let roles: Vec<&Role> = task.workflow.steps.iter().map(|s| &s.role).collect();
        assert_eq!(roles, vec![&Role::Builder, &Role::Tester, &Role::Reviewer]);
    }

    #[tokio::test]
    async fn test_parallel_override_rejected_with_dependencies() {
        let planner = Planner::new();
        let err = planner
            .plan(
                "Implement dark mode",
                TaskType::Feature,
                Some(ExecutionMode::Parallel),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn test_role_default_constraints_applied() {
        let planner = Planner::new();
        let task = planner
            .plan(
                "Refactor the storage layer across multiple modules to support pluggable backends",
                TaskType::Feature,
                None,
            )
            .await
            .unwrap();

        let by_role = |role: Role| {
            task.workflow
                .steps
                .iter()
                .find(|s| s.role == role)
                .unwrap()
        };
        assert_eq!(
            by_role(Role::Researcher).constraints.as_deref(),
            Some("read-only investigation")
        );
        assert_eq!(
            by_role(Role::Builder).constraints.as_deref(),
            Some("smallest change that satisfies the task")
        );
        // Verification scoping wins over role defaults
        assert_eq!(
            by_role(Role::Tester).constraints.as_deref(),
            Some("exhaustive edge-case coverage")
        );
    }

    #[test]
    fn test_complexity_signals() {
        assert_eq!(
            estimate_complexity("Add input validation to the login form", TaskType::BugFix),
            Complexity::Simple
        );
        assert_eq!(
            estimate_complexity("Migrate the database layer", TaskType::Feature),
            Complexity::Complex
        );
        assert_eq!(
            estimate_complexity(&"words ".repeat(50), TaskType::Feature),
            Complexity::Complex
        );
        assert_eq!(
            estimate_complexity("Review the entire authentication stack", TaskType::Review),
            Complexity::Complex
        );
    }

    #[test]
    fn test_parse_planned_steps_valid_json() {
        let json = r#"[
            {"role": "researcher", "instruction": "Read the config module", "dependencies": [], "optional": true},
            {"role": "builder", "instruction": "Apply the change", "dependencies": ["step_1"]},
            {"role": "tester", "instruction": "Verify", "dependencies": ["step_2"], "constraints": "smoke only"}
        ]"#;

        let steps = parse_planned_steps(json).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].id, "step_1");
        assert_eq!(steps[0].role, Role::Researcher);
        assert!(steps[0].optional);
        assert_eq!(steps[1].dependencies, vec!["step_1"]);
        assert_eq!(steps[2].constraints.as_deref(), Some("smoke only"));
    }

    #[test]
    fn test_parse_planned_steps_with_markdown_wrapper() {
        let content = r#"Here is the plan:
        ```json
        [{"role": "builder", "instruction": "Do the thing", "dependencies": []}]
        ```
        Hope this helps!"#;

        let steps = parse_planned_steps(content).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].instruction, "Do the thing");
    }

    #[test]
    fn test_parse_planned_steps_rejects_garbage() {
        assert!(parse_planned_steps("").is_err());
        assert!(parse_planned_steps("no json here").is_err());
        assert!(parse_planned_steps("[]").is_err());
        assert!(parse_planned_steps(r#"[{"role": "builder"}]"#).is_err());
    }

    #[test]
    fn test_parse_planned_steps_rejects_cyclic_plan() {
        let json = r#"[
            {"id": "a", "role": "builder", "instruction": "x", "dependencies": ["b"]},
            {"id": "b", "role": "tester", "instruction": "y", "dependencies": ["a"]}
        ]"#;
        let err = parse_planned_steps(json).unwrap_err();
        assert!(err.contains("unusable step graph"));
    }

    #[test]
    fn test_resolve_mode_chain_is_sequential() {
        let steps = template_steps("x", TaskType::BugFix, Complexity::Simple);
        // Groups 0 and 1, chain deps
        assert_eq!(resolve_mode(&steps), ExecutionMode::Sequential);
    }

    #[test]
    fn test_resolve_mode_shared_group_is_graph() {
        let steps = template_steps("x", TaskType::Feature, Complexity::Complex);
        assert_eq!(resolve_mode(&steps), ExecutionMode::DependencyGraph);
    }
}
