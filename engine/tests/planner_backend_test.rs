//! Integration tests for model-assisted planning
//!
//! The planner delegates a planning sub-call to the backend, retries
//! exactly once with a stricter output-format instruction on unusable
//! output, and bills the planning usage on the task without adding an
//! execution step for it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use cadence_engine::backend::{BackendError, StepBackend, StepRequest};
use cadence_engine::workflow::types::{ExecutionMode, TaskType};
use cadence_engine::workflow::Planner;
use sdk::errors::OrchestratorError;
use sdk::types::{Role, StepOutput, Usage};

/// Backend that replies with a fixed sequence of planning responses
struct SequenceBackend {
    responses: Vec<Result<String, BackendError>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<StepRequest>>,
}

impl SequenceBackend {
    fn new(responses: Vec<Result<String, BackendError>>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepBackend for SequenceBackend {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, BackendError> {
        self.requests.lock().await.push(request.clone());
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.get(call) {
            Some(Ok(text)) => Ok(StepOutput {
                raw_output: text.clone(),
                usage: Usage {
                    input_tokens: 100,
                    output_tokens: 40,
                    cache_tokens: 0,
                    cost: 0.002,
                },
                touched_files: vec![],
            }),
            Some(Err(_)) => Err(BackendError::Network("scripted planning failure".into())),
            None => panic!("backend called more often than scripted"),
        }
    }
}

const VALID_PLAN: &str = r#"[
    {"role": "builder", "instruction": "Apply the change", "dependencies": []},
    {"role": "tester", "instruction": "Verify it", "dependencies": ["step_1"], "constraints": "smoke only"}
]"#;

#[tokio::test]
async fn test_model_plan_accepted_first_try() {
    let backend = SequenceBackend::new(vec![Ok(VALID_PLAN.to_string())]);
    let planner = Planner::with_backend(backend.clone());

    let task = planner
        .plan("Adjust the retry policy", TaskType::Feature, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 1);
    assert_eq!(task.workflow.steps.len(), 2);
    assert_eq!(task.workflow.steps[0].role, Role::Builder);
    assert_eq!(task.workflow.steps[1].role, Role::Tester);
    assert_eq!(task.workflow.mode, ExecutionMode::Sequential);

    // The planning call's usage is billed on the task, with no extra
    // execution step for it
    assert_eq!(task.usage.input_tokens, 100);
    assert_eq!(task.usage.output_tokens, 40);

    // The planning call used the dedicated planning role
    let requests = backend.requests.lock().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].role, Role::Planner);
}

#[tokio::test]
async fn test_unparseable_output_retried_with_stricter_instruction() {
    let backend = SequenceBackend::new(vec![
        Ok("I would suggest doing it carefully, step by step.".to_string()),
        Ok(VALID_PLAN.to_string()),
    ]);
    let planner = Planner::with_backend(backend.clone());

    let task = planner
        .plan("Adjust the retry policy", TaskType::Feature, None)
        .await
        .unwrap();

    assert_eq!(backend.calls(), 2);
    assert_eq!(task.workflow.steps.len(), 2);

    // Both attempts are billed
    assert_eq!(task.usage.input_tokens, 200);

    let requests = backend.requests.lock().await;
    assert!(requests[1].instruction.contains("ONLY the JSON array"));
    assert!(!requests[0].instruction.contains("ONLY the JSON array"));
}

#[tokio::test]
async fn test_planning_fails_after_second_unusable_output() {
    let backend = SequenceBackend::new(vec![
        Ok("garbage".to_string()),
        Ok("more garbage".to_string()),
    ]);
    let planner = Planner::with_backend(backend.clone());

    let err = planner
        .plan("Adjust the retry policy", TaskType::Feature, None)
        .await
        .unwrap_err();

    assert_eq!(backend.calls(), 2);
    assert!(matches!(err, OrchestratorError::PlanningBackend(_)));
}

#[tokio::test]
async fn test_planning_backend_transport_failure_retried_then_fatal() {
    let backend = SequenceBackend::new(vec![
        Err(BackendError::Network("down".into())),
        Err(BackendError::Network("down".into())),
    ]);
    let planner = Planner::with_backend(backend.clone());

    let err = planner
        .plan("Adjust the retry policy", TaskType::Feature, None)
        .await
        .unwrap_err();

    assert_eq!(backend.calls(), 2);
    assert!(matches!(err, OrchestratorError::PlanningBackend(_)));
}

#[tokio::test]
async fn test_cyclic_model_plan_rejected() {
    let cyclic = r#"[
        {"id": "a", "role": "builder", "instruction": "x", "dependencies": ["b"]},
        {"id": "b", "role": "tester", "instruction": "y", "dependencies": ["a"]}
    ]"#;
    let backend = SequenceBackend::new(vec![
        Ok(cyclic.to_string()),
        Ok(cyclic.to_string()),
    ]);
    let planner = Planner::with_backend(backend.clone());

    let err = planner
        .plan("Adjust the retry policy", TaskType::Feature, None)
        .await
        .unwrap_err();

    // An unusable graph is treated like unparseable output: one stricter
    // retry, then fatal
    assert_eq!(backend.calls(), 2);
    assert!(matches!(err, OrchestratorError::PlanningBackend(_)));
}
