//! Workflow Executor
//!
//! Runs a `Workflow`'s steps to completion or fatal failure, respecting
//! dependency order and the declared concurrency mode. Between steps the
//! executor invokes the context compactor so downstream steps receive
//! bounded context instead of raw output.
//!
//! Concurrency model: spawned step workers emit their own `started`
//! events and send outcomes over a channel; the run loop is the single
//! writer for the task's usage counters, step states, and completed
//! contexts, so concurrent completions cannot lose updates. No lock is
//! held across a backend or compactor call.

use crate::backend::{BackendError, StepBackend, StepRequest};
use crate::db::TaskRepository;
use crate::events::{EventBus, StepEvent, StepEventKind};
use crate::workflow::context::ContextCompactor;
use crate::workflow::graph::StepGraph;
use crate::workflow::types::{
    ExecutionMode, StepContext, StepStatus, Task, TaskStatus,
};
use chrono::Utc;
use sdk::errors::OrchestratorError;
use sdk::types::{Role, StepOutput};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

/// Handle for cancelling a running task
///
/// Cancellation aborts in-flight backend calls best-effort and marks all
/// not-yet-started steps as skipped; completed steps keep their results.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Explicit execution state passed through executor calls
///
/// Holds the observability bus, concurrency ceiling, cancellation signal,
/// and the optional persistence collaborator. No package-level mutable
/// state exists.
pub struct ExecutionContext {
    /// Step lifecycle event bus
    pub events: EventBus,

    /// Maximum number of steps running concurrently
    pub max_concurrent_steps: usize,

    /// Optional persistence collaborator; save failures are logged, never
    /// fatal to the workflow
    pub repository: Option<Arc<TaskRepository>>,

    /// Cancellation signal
    cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    /// Create a context and its cancellation handle
    pub fn new(events: EventBus, max_concurrent_steps: usize) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                events,
                max_concurrent_steps: max_concurrent_steps.max(1),
                repository: None,
                cancel: rx,
            },
            CancelHandle { tx },
        )
    }

    /// Attach a persistence collaborator
    pub fn with_repository(mut self, repository: Arc<TaskRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Outcome of one step worker
enum StepOutcome {
    Completed {
        output: StepOutput,
        context: StepContext,
    },
    Failed {
        error: String,
    },
    Cancelled,
}

/// How a finished step affects scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepEnd {
    Completed,
    FailedOptional,
    FailedFatal,
    Cancelled,
}

/// Executes workflows against a step backend
pub struct Executor {
    backend: Arc<dyn StepBackend>,
    compactor: ContextCompactor,
    retry_transient: bool,
}

impl Executor {
    /// Create an executor
    pub fn new(backend: Arc<dyn StepBackend>, compactor: ContextCompactor) -> Self {
        Self {
            backend,
            compactor,
            retry_transient: true,
        }
    }

    /// Enable or disable the single transient retry per step
    pub fn with_retry_transient(mut self, retry: bool) -> Self {
        self.retry_transient = retry;
        self
    }

    /// Run a task's workflow to a terminal status.
    ///
    /// Pre-flight validation (unknown dependencies, duplicate ids,
    /// cycles) fails fast with an error before any step event is
    /// emitted. Everything after that is reported on the returned task:
    /// step failures mark the task failed, with the originating step's
    /// error preserved and completed partial results retained.
    pub async fn run(
        &self,
        mut task: Task,
        ctx: &ExecutionContext,
    ) -> Result<Task, OrchestratorError> {
        let graph = StepGraph::build(&task.workflow.steps)?;

        if task.workflow.mode == ExecutionMode::Parallel
            && task.workflow.steps.iter().any(|s| !s.dependencies.is_empty())
        {
            return Err(OrchestratorError::InvalidTask(
                "Parallel mode requires a workflow without dependencies".to_string(),
            ));
        }

        info!(
            "Executing task {} ({} steps, {} mode)",
            task.id,
            task.workflow.steps.len(),
            task.workflow.mode.as_str()
        );

        task.status = TaskStatus::InProgress;
        task.updated_at = Utc::now();
        self.persist_task(ctx, &task).await;

        for step in &task.workflow.steps {
            ctx.events
                .publish(StepEvent::now(
                    &task.id,
                    &step.id,
                    step.role.clone(),
                    StepEventKind::Created,
                ))
                .await;
        }

        match task.workflow.mode {
            ExecutionMode::Sequential => self.run_sequential(&mut task, ctx).await,
            ExecutionMode::Parallel => self.run_concurrent(&mut task, &graph, ctx).await,
            ExecutionMode::DependencyGraph => self.run_concurrent(&mut task, &graph, ctx).await,
        }

        self.finalize(&mut task, ctx).await;
        Ok(task)
    }

    /// Strict declared order; step i+1 receives step i's context as its
    /// sole forwarded context.
    async fn run_sequential(&self, task: &mut Task, ctx: &ExecutionContext) {
        let mut fatal = false;
        let mut previous_context: Option<StepContext> = None;

        for index in 0..task.workflow.steps.len() {
            if fatal || ctx.is_cancelled() {
                let step = &mut task.workflow.steps[index];
                step.status = StepStatus::Skipped;
                continue;
            }

            let forwarded = previous_context
                .as_ref()
                .filter(|c| !c.is_empty())
                .map(|c| c.render());

            let call = self.step_call(task, index, forwarded);
            let outcome = execute_call(
                Arc::clone(&self.backend),
                self.compactor.clone(),
                ctx.events.clone(),
                self.retry_transient,
                ctx.cancel.clone(),
                call,
            )
            .await;

            let end = self.finish_step(task, index, outcome, ctx).await;
            previous_context = match end {
                StepEnd::Completed => task.workflow.steps[index].context.clone(),
                // A failed optional step forwards nothing; dependents must
                // tolerate a missing upstream context
                StepEnd::FailedOptional => None,
                StepEnd::FailedFatal => {
                    fatal = true;
                    None
                }
                StepEnd::Cancelled => None,
            };
        }
    }

    /// Parallel and dependency-graph scheduling.
    ///
    /// A step becomes eligible once every dependency is terminal; eligible
    /// steps run concurrently up to the configured ceiling. Steps behind a
    /// fatally-failed or skipped dependency are skipped; independent
    /// branches keep running.
    async fn run_concurrent(&self, task: &mut Task, graph: &StepGraph, ctx: &ExecutionContext) {
        let step_count = task.workflow.steps.len();
        if step_count == 0 {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(ctx.max_concurrent_steps));
        let (tx, mut rx) = mpsc::channel::<(usize, StepOutcome)>(step_count);

        let mut pending_deps: Vec<usize> = (0..step_count)
            .map(|i| graph.deps_of(i).len())
            .collect();
        let mut blocked: Vec<bool> = vec![false; step_count];
        let mut contexts: Vec<Option<StepContext>> = vec![None; step_count];
        let mut in_flight = 0usize;

        // Seed: steps with no dependencies
        for index in 0..step_count {
            if pending_deps[index] == 0 {
                self.spawn_step(task, index, &contexts, graph, ctx, &semaphore, &tx);
                in_flight += 1;
            }
        }

        while in_flight > 0 {
            let Some((index, outcome)) = rx.recv().await else {
                break;
            };
            in_flight -= 1;

            let end = self.finish_step(task, index, outcome, ctx).await;
            if end == StepEnd::Completed {
                contexts[index] = task.workflow.steps[index].context.clone();
            }

            // Unblock or skip dependents
            let mut to_skip: Vec<usize> = Vec::new();
            for &dependent in graph.dependents_of(index) {
                if matches!(end, StepEnd::FailedFatal | StepEnd::Cancelled) {
                    blocked[dependent] = true;
                }
                pending_deps[dependent] -= 1;
                if pending_deps[dependent] == 0 {
                    if blocked[dependent] || ctx.is_cancelled() {
                        to_skip.push(dependent);
                    } else {
                        self.spawn_step(task, dependent, &contexts, graph, ctx, &semaphore, &tx);
                        in_flight += 1;
                    }
                }
            }

            // Cascade skips through the graph without ever starting them
            while let Some(skipped) = to_skip.pop() {
                task.workflow.steps[skipped].status = StepStatus::Skipped;
                debug!("Step {} skipped", task.workflow.steps[skipped].id);
                for &dependent in graph.dependents_of(skipped) {
                    blocked[dependent] = true;
                    pending_deps[dependent] -= 1;
                    if pending_deps[dependent] == 0 {
                        to_skip.push(dependent);
                    }
                }
            }
        }

        // Cancellation can leave seeded-but-never-spawned steps pending
        for step in &mut task.workflow.steps {
            if step.status == StepStatus::Pending || step.status == StepStatus::Running {
                step.status = StepStatus::Skipped;
            }
        }
    }

    /// Spawn one step worker. The worker acquires a concurrency permit,
    /// emits its own `started` event, and reports back over the channel.
    #[allow(clippy::too_many_arguments)]
    fn spawn_step(
        &self,
        task: &mut Task,
        index: usize,
        contexts: &[Option<StepContext>],
        graph: &StepGraph,
        ctx: &ExecutionContext,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::Sender<(usize, StepOutcome)>,
    ) {
        // Forwarded context: the direct dependencies' contexts in declared
        // order, merged within the budget. Parallel workflows have no
        // dependencies and forward nothing.
        let dep_contexts: Vec<&StepContext> = graph
            .deps_of(index)
            .iter()
            .filter_map(|&dep| contexts[dep].as_ref())
            .collect();
        let forwarded = if dep_contexts.is_empty() {
            None
        } else {
            let merged = self.compactor.merge(&dep_contexts);
            (!merged.is_empty()).then_some(merged)
        };

        task.workflow.steps[index].status = StepStatus::Running;

        let call = self.step_call(task, index, forwarded);
        let backend = Arc::clone(&self.backend);
        let compactor = self.compactor.clone();
        let events = ctx.events.clone();
        let retry = self.retry_transient;
        let cancel = ctx.cancel.clone();
        let semaphore = Arc::clone(semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            // Closed semaphore cannot happen; treat it like cancellation
            let Ok(_permit) = semaphore.acquire().await else {
                let _ = tx.send((index, StepOutcome::Cancelled)).await;
                return;
            };
            let outcome = execute_call(backend, compactor, events, retry, cancel, call).await;
            let _ = tx.send((index, outcome)).await;
        });
    }

    /// Snapshot the immutable step data a worker needs
    fn step_call(&self, task: &Task, index: usize, forwarded: Option<String>) -> StepCall {
        let step = &task.workflow.steps[index];
        StepCall {
            task_id: task.id.clone(),
            step_id: step.id.clone(),
            role: step.role.clone(),
            instruction: step.instruction.clone(),
            constraints: step.constraints.clone(),
            forwarded,
        }
    }

    /// Apply a worker outcome to the task. Runs on the single-writer run
    /// loop: usage aggregation and context storage cannot race.
    async fn finish_step(
        &self,
        task: &mut Task,
        index: usize,
        outcome: StepOutcome,
        ctx: &ExecutionContext,
    ) -> StepEnd {
        let step_id = task.workflow.steps[index].id.clone();
        let role = task.workflow.steps[index].role.clone();

        let end = match outcome {
            StepOutcome::Completed { output, context } => {
                let step = &mut task.workflow.steps[index];
                step.status = StepStatus::Completed;
                step.usage = output.usage.clone();
                step.raw_output = Some(output.raw_output);
                step.context = Some(context);
                task.usage.add(&output.usage);

                ctx.events
                    .publish(
                        StepEvent::now(&task.id, &step_id, role.clone(), StepEventKind::Completed)
                            .with_usage(output.usage),
                    )
                    .await;
                info!("Step {} ({}) completed", step_id, role);
                StepEnd::Completed
            }
            StepOutcome::Failed { error } => {
                let optional = task.workflow.steps[index].optional;
                let step = &mut task.workflow.steps[index];
                step.status = StepStatus::Failed;
                step.error = Some(error.clone());

                ctx.events
                    .publish(
                        StepEvent::now(&task.id, &step_id, role.clone(), StepEventKind::Failed)
                            .with_error(error.clone()),
                    )
                    .await;

                if optional {
                    warn!("Optional step {} ({}) failed: {}", step_id, role, error);
                    StepEnd::FailedOptional
                } else {
                    warn!("Step {} ({}) failed: {}", step_id, role, error);
                    if task.error.is_none() {
                        task.error = Some(
                            OrchestratorError::StepExecution {
                                step_id: step_id.clone(),
                                role: role.clone(),
                                message: error,
                                transient: false,
                            }
                            .to_string(),
                        );
                    }
                    StepEnd::FailedFatal
                }
            }
            StepOutcome::Cancelled => {
                // No partial result is treated as the step's output
                task.workflow.steps[index].status = StepStatus::Skipped;
                debug!("Step {} cancelled", step_id);
                StepEnd::Cancelled
            }
        };

        task.updated_at = Utc::now();
        self.persist_step(ctx, task, index).await;
        end
    }

    /// Resolve the terminal task status, result, and counters
    async fn finalize(&self, task: &mut Task, ctx: &ExecutionContext) {
        let any_fatal = task
            .workflow
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Failed && !s.optional);

        if ctx.is_cancelled() {
            task.status = TaskStatus::Failed;
            task.error
                .get_or_insert_with(|| OrchestratorError::Cancelled.to_string());
        } else if any_fatal {
            task.status = TaskStatus::Failed;
        } else {
            task.status = TaskStatus::Completed;
            // The final step in declared order designates the task result
            task.result = task
                .workflow
                .steps
                .last()
                .and_then(|s| s.raw_output.clone());
        }

        let now = Utc::now();
        task.updated_at = now;
        task.completed_at = Some(now);
        self.persist_task(ctx, task).await;

        info!(
            "Task {} {}: {} tokens, ${:.4}",
            task.id,
            task.status.as_str(),
            task.usage.total_tokens(),
            task.usage.cost
        );
    }

    /// Save-hook: persistence failures are logged, never fatal
    async fn persist_task(&self, ctx: &ExecutionContext, task: &Task) {
        if let Some(repository) = &ctx.repository {
            if let Err(e) = repository.upsert_task(task).await {
                warn!("Failed to persist task {}: {}", task.id, e);
            }
        }
    }

    /// Save-hook for one step's terminal state
    async fn persist_step(&self, ctx: &ExecutionContext, task: &Task, index: usize) {
        if let Some(repository) = &ctx.repository {
            let step = &task.workflow.steps[index];
            if let Err(e) = repository.record_step(&task.id, index as i64, step).await {
                warn!("Failed to persist step {}: {}", step.id, e);
            }
        }
    }
}

/// Immutable data a step worker needs
struct StepCall {
    task_id: String,
    step_id: String,
    role: Role,
    instruction: String,
    constraints: Option<String>,
    forwarded: Option<String>,
}

/// Run one step against the backend: emit `started`, call with a single
/// transient retry, compact the output.
async fn execute_call(
    backend: Arc<dyn StepBackend>,
    compactor: ContextCompactor,
    events: EventBus,
    retry_transient: bool,
    cancel: watch::Receiver<bool>,
    call: StepCall,
) -> StepOutcome {
    if *cancel.borrow() {
        return StepOutcome::Cancelled;
    }

    events
        .publish(StepEvent::now(
            &call.task_id,
            &call.step_id,
            call.role.clone(),
            StepEventKind::Started,
        ))
        .await;

    let mut request = StepRequest::new(call.role.clone(), call.instruction);
    if let Some(forwarded) = call.forwarded {
        request = request.with_context(forwarded);
    }
    if let Some(constraints) = call.constraints {
        request = request.with_constraints(constraints);
    }

    let result = tokio::select! {
        _ = wait_cancelled(cancel) => return StepOutcome::Cancelled,
        result = call_with_retry(backend.as_ref(), &request, retry_transient) => result,
    };

    match result {
        Ok(output) => {
            let context = compactor.compact(&call.step_id, &output.raw_output);
            StepOutcome::Completed { output, context }
        }
        Err(e) => StepOutcome::Failed {
            error: e.to_string(),
        },
    }
}

/// Call the backend, retrying exactly once on a transient failure
async fn call_with_retry(
    backend: &dyn StepBackend,
    request: &StepRequest,
    retry_transient: bool,
) -> Result<StepOutput, BackendError> {
    match backend.execute(request).await {
        Err(e) if retry_transient && e.is_transient() => {
            warn!("Transient backend failure, retrying once: {}", e);
            backend.execute(request).await
        }
        other => other,
    }
}

/// Resolve when cancellation is signalled; never resolves otherwise
async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    while cancel.changed().await.is_ok() {
        if *cancel.borrow() {
            return;
        }
    }
    // Handle dropped without cancelling: stay pending
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Complexity, Step, Workflow};
    use async_trait::async_trait;
    use sdk::types::Usage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that echoes the instruction and counts calls
    struct EchoBackend {
        calls: AtomicUsize,
    }

    impl EchoBackend {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StepBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            request: &StepRequest,
        ) -> Result<StepOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput {
                raw_output: format!("done: {}", request.instruction),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    cache_tokens: 0,
                    cost: 0.001,
                },
                touched_files: vec![],
            })
        }
    }

    fn make_task(steps: Vec<Step>, mode: ExecutionMode) -> Task {
        let workflow = Workflow {
            id: "wf".to_string(),
            mode,
            complexity: Complexity::Simple,
            steps,
        };
        Task::new("test task", crate::workflow::types::TaskType::Custom, workflow)
    }

    #[tokio::test]
    async fn test_sequential_run_completes_and_aggregates() {
        let backend = Arc::new(EchoBackend::new());
        let executor = Executor::new(backend.clone(), ContextCompactor::new(2000));
        let (ctx, _cancel) = ExecutionContext::new(EventBus::new(), 4);

        let steps = vec![
            Step::new("step_1", Role::Builder, "build it"),
            Step::new("step_2", Role::Tester, "test it")
                .with_dependencies(vec!["step_1".to_string()]),
        ];
        let task = make_task(steps, ExecutionMode::Sequential);
        let task = executor.run(task, &ctx).await.unwrap();

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done: test it"));
        assert_eq!(task.usage.input_tokens, 20);
        assert_eq!(task.usage.output_tokens, 10);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert!(task
            .workflow
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_cyclic_workflow_refused_before_any_event() {
        let backend = Arc::new(EchoBackend::new());
        let executor = Executor::new(backend.clone(), ContextCompactor::new(2000));
        let bus = EventBus::new();
        let mut rx = bus.subscribe().await;
        let (ctx, _cancel) = ExecutionContext::new(bus, 4);

        let steps = vec![
            Step::new("a", Role::Builder, "x").with_dependencies(vec!["b".to_string()]),
            Step::new("b", Role::Tester, "y").with_dependencies(vec!["a".to_string()]),
        ];
        let task = make_task(steps, ExecutionMode::DependencyGraph);
        let err = executor.run(task, &ctx).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::CyclicWorkflow { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_parallel_mode_with_dependencies_rejected() {
        let backend = Arc::new(EchoBackend::new());
        let executor = Executor::new(backend, ContextCompactor::new(2000));
        let (ctx, _cancel) = ExecutionContext::new(EventBus::new(), 4);

        let steps = vec![
            Step::new("a", Role::Builder, "x"),
            Step::new("b", Role::Tester, "y").with_dependencies(vec!["a".to_string()]),
        ];
        let task = make_task(steps, ExecutionMode::Parallel);
        let err = executor.run(task, &ctx).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn test_empty_workflow_completes() {
        let backend = Arc::new(EchoBackend::new());
        let executor = Executor::new(backend, ContextCompactor::new(2000));
        let (ctx, _cancel) = ExecutionContext::new(EventBus::new(), 4);

        let task = make_task(vec![], ExecutionMode::Sequential);
        let task = executor.run(task, &ctx).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.result.is_none());
    }
}
