use async_trait::async_trait;
use devflow::event::{WorkflowEvent, WorkflowListener};
use devflow::workflow::{
    Action, Condition, RunStatus, Step, StepResult, Trigger, TriggerEvent, TriggerType, Workflow,
    WorkflowContext, WorkflowError,
};
use devflow::workflow_executor::{ActionExecutor, WorkflowExecutor};
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

/// Succeeds on every step except the ids listed in `fail_steps`.
struct MockExecutor {
    fail_steps: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl MockExecutor {
    fn new() -> Self {
        Self {
            fail_steps: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(steps: &[&str]) -> Self {
        Self {
            fail_steps: steps.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn execute(
        &self,
        action: Action,
        step: &Step,
        _context: &mut WorkflowContext,
    ) -> Result<StepResult, Box<dyn Error + Send + Sync>> {
        self.calls.lock().unwrap().push(step.id.clone());
        if self.fail_steps.contains(&step.id) {
            return Err(format!("step {} exploded", step.id).into());
        }
        Ok(StepResult::success(&step.id, action, format!("ok:{}", step.id)))
    }
}

/// Writes a variable into the context, like a real executor propagating data.
struct VariableSettingExecutor;

#[async_trait]
impl ActionExecutor for VariableSettingExecutor {
    async fn execute(
        &self,
        action: Action,
        step: &Step,
        context: &mut WorkflowContext,
    ) -> Result<StepResult, Box<dyn Error + Send + Sync>> {
        context.set_variable("touched_by", step.id.clone());
        Ok(StepResult::success(&step.id, action, "done"))
    }
}

struct Recorder {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, matcher: impl Fn(&WorkflowEvent) -> bool) -> usize {
        self.events().iter().filter(|e| matcher(e)).count()
    }
}

impl WorkflowListener for Recorder {
    fn on_workflow_event(&self, event: &WorkflowEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn linear_workflow() -> Workflow {
    Workflow::new("linear", "Linear")
        .with_step(Step::new("a", Action::Log).on_success("b"))
        .with_step(Step::new("b", Action::Log).on_success("c"))
        .with_step(Step::new("c", Action::Log))
}

fn engine_with(executor: Arc<dyn ActionExecutor>) -> (WorkflowExecutor, Arc<Recorder>) {
    let engine = WorkflowExecutor::new(executor);
    let recorder = Arc::new(Recorder::new());
    engine.add_listener(recorder.clone());
    (engine, recorder)
}

#[tokio::test]
async fn linear_workflow_runs_to_completion() {
    let executor = Arc::new(MockExecutor::new());
    let (engine, recorder) = engine_with(executor.clone());
    engine.register_workflow(linear_workflow()).unwrap();

    let run = engine.start_workflow("linear", HashMap::new()).unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.current_step.as_deref(), Some("a"));

    let finished = engine.execute_until_complete(&run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(executor.calls(), vec!["a", "b", "c"]);

    assert_eq!(recorder.count(|e| matches!(e, WorkflowEvent::WorkflowStarted { .. })), 1);
    assert_eq!(recorder.count(|e| matches!(e, WorkflowEvent::StepStarted { .. })), 3);
    assert_eq!(recorder.count(|e| matches!(e, WorkflowEvent::StepCompleted { .. })), 3);
    let completions: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            WorkflowEvent::WorkflowCompleted { success, steps_completed, .. } => {
                Some((success, steps_completed))
            }
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![(true, 3)]);

    // The run moved from the active table to the completed list, once.
    assert!(engine.active_runs().await.is_empty());
    let completed = engine.completed_runs();
    assert_eq!(completed.iter().filter(|r| r.id == run.id).count(), 1);
}

#[tokio::test]
async fn step_results_match_context_and_order() {
    let (engine, recorder) = engine_with(Arc::new(MockExecutor::new()));
    engine.register_workflow(linear_workflow()).unwrap();
    let run = engine.start_workflow("linear", HashMap::new()).unwrap();
    let finished = engine.execute_until_complete(&run.id).await.unwrap();

    assert_eq!(finished.completed_steps.len(), finished.context.results().len());
    let order: Vec<&str> = finished
        .completed_steps
        .iter()
        .map(|r| r.step_id.as_str())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    // WorkflowStarted is observed strictly before the first StepStarted.
    let events = recorder.events();
    let started_idx = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::WorkflowStarted { .. }))
        .unwrap();
    let first_step_idx = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::StepStarted { .. }))
        .unwrap();
    assert!(started_idx < first_step_idx);
}

#[tokio::test]
async fn conditional_step_is_skipped_without_step_started() {
    let (engine, recorder) = engine_with(Arc::new(MockExecutor::new()));
    let workflow = Workflow::new("cond", "Conditional")
        .with_step(
            Step::new("x", Action::RunTests)
                .with_condition(Condition::VariableSet("needed".into()))
                .on_success("y"),
        )
        .with_step(Step::new("y", Action::Log));
    engine.register_workflow(workflow).unwrap();

    let run = engine.start_workflow("cond", HashMap::new()).unwrap();
    let result = engine.execute_next_step(&run.id).await.unwrap();

    assert!(result.success);
    assert_eq!(result.output.as_deref(), Some("Skipped due to condition"));
    assert_eq!(
        recorder.count(|e| matches!(e, WorkflowEvent::StepStarted { step_id, .. } if step_id == "x")),
        0
    );

    let snapshot = engine.get_run(&run.id).await.unwrap();
    assert_eq!(snapshot.current_step.as_deref(), Some("y"));
}

#[tokio::test]
async fn condition_satisfied_executes_normally() {
    let executor = Arc::new(MockExecutor::new());
    let (engine, _) = engine_with(executor.clone());
    let workflow = Workflow::new("cond2", "Conditional")
        .with_step(
            Step::new("x", Action::RunTests).with_condition(Condition::VariableSet("needed".into())),
        );
    engine.register_workflow(workflow).unwrap();

    let mut vars = HashMap::new();
    vars.insert("needed".to_string(), "yes".to_string());
    let run = engine.start_workflow("cond2", vars).unwrap();
    let result = engine.execute_next_step(&run.id).await.unwrap();
    assert!(result.success);
    assert_eq!(executor.calls(), vec!["x"]);
}

#[tokio::test]
async fn user_checkpoint_suspends_and_decline_cancels() {
    let executor = Arc::new(MockExecutor::new());
    let (engine, recorder) = engine_with(executor.clone());
    let workflow = Workflow::new("ask", "Checkpoint").with_step(
        Step::new("u", Action::AskUser).with_config("prompt", serde_json::json!("Apply the fix?")),
    );
    engine.register_workflow(workflow).unwrap();

    let run = engine.start_workflow("ask", HashMap::new()).unwrap();
    let result = engine.execute_next_step(&run.id).await;
    assert!(result.is_none());
    assert!(executor.calls().is_empty());

    let snapshot = engine.get_run(&run.id).await.unwrap();
    assert_eq!(snapshot.status, RunStatus::WaitingUser);
    let prompts: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            WorkflowEvent::UserInputRequired { prompt, .. } => Some(prompt),
            _ => None,
        })
        .collect();
    assert_eq!(prompts, vec!["Apply the fix?"]);

    // Declining with no failure branch cancels the run.
    let cancelled = engine.continue_after_user_input(&run.id, false).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert!(engine.completed_runs().iter().any(|r| r.id == run.id));
}

#[tokio::test]
async fn user_checkpoint_proceed_advances_on_success_branch() {
    let executor = Arc::new(MockExecutor::new());
    let (engine, _) = engine_with(executor.clone());
    let workflow = Workflow::new("ask2", "Checkpoint")
        .with_step(Step::new("u", Action::AskUser).on_success("apply"))
        .with_step(Step::new("apply", Action::ApplyChanges));
    engine.register_workflow(workflow).unwrap();

    let run = engine.start_workflow("ask2", HashMap::new()).unwrap();
    engine.execute_next_step(&run.id).await;
    let resumed = engine.continue_after_user_input(&run.id, true).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Running);
    assert_eq!(resumed.current_step.as_deref(), Some("apply"));
    // The checkpoint recorded a synthetic success result.
    assert!(resumed.context.result("u").unwrap().success);

    let finished = engine.execute_until_complete(&run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(executor.calls(), vec!["apply"]);
}

#[tokio::test]
async fn executor_error_takes_failure_branch() {
    let executor = Arc::new(MockExecutor::failing_on(&["risky"]));
    let (engine, _) = engine_with(executor.clone());
    let workflow = Workflow::new("recover", "Recovering")
        .with_step(Step::new("risky", Action::RunCommand).on_success("done").on_failure("cleanup"))
        .with_step(Step::new("cleanup", Action::Log))
        .with_step(Step::new("done", Action::Log));
    engine.register_workflow(workflow).unwrap();

    let run = engine.start_workflow("recover", HashMap::new()).unwrap();
    let result = engine.execute_next_step(&run.id).await.unwrap();
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("exploded"));

    let finished = engine.execute_until_complete(&run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(executor.calls(), vec!["risky", "cleanup"]);
}

#[tokio::test]
async fn failure_without_branch_fails_the_run() {
    let (engine, recorder) = engine_with(Arc::new(MockExecutor::failing_on(&["only"])));
    let workflow =
        Workflow::new("fragile", "Fragile").with_step(Step::new("only", Action::RunTests));
    engine.register_workflow(workflow).unwrap();

    let run = engine.start_workflow("fragile", HashMap::new()).unwrap();
    let finished = engine.execute_until_complete(&run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Failed);
    assert!(finished.error.is_some());
    assert_eq!(recorder.count(|e| matches!(e, WorkflowEvent::WorkflowFailed { .. })), 1);
    assert_eq!(
        recorder.count(|e| matches!(e, WorkflowEvent::WorkflowCompleted { success: false, .. })),
        1
    );
    assert!(engine.completed_runs().iter().any(|r| r.id == run.id));
}

#[tokio::test]
async fn invalid_workflow_is_rejected_without_mutation() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    let invalid = Workflow::new("bad", "Bad")
        .with_step(Step::new("a", Action::Log).on_success("missing"));
    match engine.register_workflow(invalid) {
        Err(WorkflowError::InvalidWorkflow(reasons)) => assert!(reasons.contains("missing")),
        other => panic!("expected InvalidWorkflow, got {:?}", other),
    }
    assert!(engine.all_workflows().is_empty());
}

#[tokio::test]
async fn unknown_workflow_start_fails() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    assert!(matches!(
        engine.start_workflow("nope", HashMap::new()),
        Err(WorkflowError::UnknownWorkflow(_))
    ));
}

#[tokio::test]
async fn register_unregister_round_trips() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    engine.register_workflow(linear_workflow()).unwrap();
    assert_eq!(engine.all_workflows().len(), 1);
    assert!(engine.unregister_workflow("linear").is_some());
    assert!(engine.all_workflows().is_empty());
    assert!(engine.get_workflow("linear").is_none());
}

#[tokio::test]
async fn pause_resume_restores_running() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    engine.register_workflow(linear_workflow()).unwrap();
    let run = engine.start_workflow("linear", HashMap::new()).unwrap();

    let paused = engine.pause_workflow(&run.id).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    // A paused run does not advance.
    assert!(engine.execute_next_step(&run.id).await.is_none());

    let resumed = engine.resume_workflow(&run.id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Running);
    // Pausing a non-running run is a no-op.
    let cancelled = engine.cancel_workflow(&run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    let still_cancelled = engine.pause_workflow(&run.id).await;
    assert!(still_cancelled.is_none() || still_cancelled.unwrap().status == RunStatus::Cancelled);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    engine.register_workflow(linear_workflow()).unwrap();
    let run = engine.start_workflow("linear", HashMap::new()).unwrap();

    let first = engine.cancel_workflow(&run.id).await.unwrap();
    assert_eq!(first.status, RunStatus::Cancelled);
    let second = engine.cancel_workflow(&run.id).await.unwrap();
    assert_eq!(second.status, RunStatus::Cancelled);
    assert_eq!(
        engine.completed_runs().iter().filter(|r| r.id == run.id).count(),
        1
    );
    // A cancelled run no longer advances.
    assert!(engine.execute_next_step(&run.id).await.is_none());
}

#[tokio::test]
async fn trigger_processing_starts_matching_workflows() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    engine
        .register_workflow(
            Workflow::new("on-save", "On Save")
                .with_step(Step::new("lint", Action::AnalyzeCode))
                .with_trigger(Trigger::new(TriggerType::FileSave).with_pattern(r".*\.rs$")),
        )
        .unwrap();
    engine
        .register_workflow(
            Workflow::new("on-error", "On Error")
                .with_step(Step::new("diagnose", Action::AnalyzeCode))
                .with_trigger(Trigger::new(TriggerType::ErrorDetected)),
        )
        .unwrap();

    let runs = engine.process_trigger(&TriggerEvent::new(TriggerType::FileSave, Some("src/lib.rs")));
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].workflow_id, "on-save");

    let none = engine.process_trigger(&TriggerEvent::new(TriggerType::FileSave, Some("README.md")));
    assert!(none.is_empty());

    assert_eq!(engine.workflows_for_trigger(TriggerType::ErrorDetected).len(), 1);
    assert_eq!(engine.workflows_for_trigger(TriggerType::GitHook).len(), 0);
}

#[tokio::test]
async fn step_cap_stops_looping_workflows() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    let workflow = Workflow::new("loop", "Loop")
        .with_step(Step::new("again", Action::Wait).on_success("again"))
        .with_config("max_steps", serde_json::json!(5));
    engine.register_workflow(workflow).unwrap();

    let run = engine.start_workflow("loop", HashMap::new()).unwrap();
    let stopped = engine.execute_until_complete(&run.id).await.unwrap();
    assert_eq!(stopped.status, RunStatus::Running);
    assert_eq!(stopped.completed_steps.len(), 5);
    // Calling again executes no further steps.
    let still = engine.execute_until_complete(&run.id).await.unwrap();
    assert_eq!(still.completed_steps.len(), 5);
}

#[tokio::test]
async fn executor_writes_propagate_through_context() {
    let (engine, _) = engine_with(Arc::new(VariableSettingExecutor));
    engine
        .register_workflow(
            Workflow::new("vars", "Vars").with_step(Step::new("seed", Action::SetVariable)),
        )
        .unwrap();
    let run = engine.start_workflow("vars", HashMap::new()).unwrap();
    let finished = engine.execute_until_complete(&run.id).await.unwrap();
    assert_eq!(finished.context.variable("touched_by"), Some("seed"));
}

#[tokio::test]
async fn unknown_run_operations_are_absent() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    assert!(engine.execute_next_step("ghost").await.is_none());
    assert!(engine.get_run("ghost").await.is_none());
    assert!(engine.pause_workflow("ghost").await.is_none());
    assert!(engine.cancel_workflow("ghost").await.is_none());
    assert!(engine.continue_after_user_input("ghost", true).await.is_none());
}

#[tokio::test]
async fn stats_track_registry_and_runs() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    engine.register_workflow(linear_workflow()).unwrap();
    let run = engine.start_workflow("linear", HashMap::new()).unwrap();
    let stats = engine.stats();
    assert_eq!(stats.registered_workflows, 1);
    assert_eq!(stats.active_runs, 1);
    assert_eq!(stats.completed_runs, 0);

    engine.execute_until_complete(&run.id).await.unwrap();
    let stats = engine.stats();
    assert_eq!(stats.active_runs, 0);
    assert_eq!(stats.completed_runs, 1);
}

#[tokio::test]
async fn panicking_listener_does_not_break_the_engine() {
    struct Bomb;
    impl WorkflowListener for Bomb {
        fn on_workflow_event(&self, _event: &WorkflowEvent) {
            panic!("listener bug");
        }
    }

    let (engine, recorder) = engine_with(Arc::new(MockExecutor::new()));
    engine.add_listener(Arc::new(Bomb));
    engine.register_workflow(linear_workflow()).unwrap();
    let run = engine.start_workflow("linear", HashMap::new()).unwrap();
    let finished = engine.execute_until_complete(&run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    // The well-behaved listener still saw everything.
    assert!(recorder.count(|e| matches!(e, WorkflowEvent::WorkflowCompleted { .. })) == 1);
}

#[tokio::test]
async fn listener_removal_stops_delivery() {
    let (engine, _) = engine_with(Arc::new(MockExecutor::new()));
    let extra = Arc::new(Recorder::new());
    let as_listener: Arc<dyn WorkflowListener> = extra.clone();
    engine.add_listener(as_listener.clone());
    assert!(engine.remove_listener(&as_listener));
    engine.register_workflow(linear_workflow()).unwrap();
    engine.start_workflow("linear", HashMap::new()).unwrap();
    assert!(extra.events().is_empty());
}
