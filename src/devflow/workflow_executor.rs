//! The workflow engine.
//!
//! A [`WorkflowExecutor`] owns a registry of [`Workflow`] definitions and the
//! runs started from them. Runs advance one step at a time through the step
//! graph: each step's action is dispatched to the injected
//! [`ActionExecutor`], the result picks the success or failure branch, and
//! `AskUser` steps suspend the run at a user checkpoint until
//! [`continue_after_user_input`](WorkflowExecutor::continue_after_user_input).
//!
//! Runs are logically-independent state machines: different runs advance in
//! parallel, while two concurrent advancement calls on the *same* run are
//! serialized by a per-run lock, so the second caller always observes the
//! first one's result.
//!
//! # Example
//!
//! ```rust,no_run
//! use devflow::workflow::{Action, Step, Workflow};
//! use devflow::workflow_executor::{ActionExecutor, WorkflowExecutor};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn example(executor: Arc<dyn ActionExecutor>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WorkflowExecutor::new(executor);
//! engine.register_workflow(
//!     Workflow::new("greet", "Greeting")
//!         .with_step(Step::new("log", Action::Log)),
//! )?;
//!
//! let run = engine.start_workflow("greet", HashMap::new())?;
//! let finished = engine.execute_until_complete(&run.id).await.unwrap();
//! println!("run ended as {}", finished.status);
//! # Ok(())
//! # }
//! ```

use crate::devflow::event::{deliver, ListenerSet, WorkflowEvent, WorkflowListener};
use crate::devflow::workflow::{
    Action, Step, StepResult, RunStatus, TriggerEvent, TriggerType, Workflow, WorkflowContext,
    WorkflowError, WorkflowRun,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;
use tokio::sync::Mutex as TokioMutex;

/// How many finished runs are retained for inspection.
const COMPLETED_RUN_RETENTION: usize = 50;

/// Executes one workflow step against the environment.
///
/// Implementations may block, suspend, and take unbounded time; the engine
/// converts returned errors into failure [`StepResult`]s and routes the run
/// down the failure branch. The step is passed verbatim, so declared
/// timeouts and retry counts are the executor's to enforce. The context is
/// an exclusive reference: write through
/// [`set_variable`](WorkflowContext::set_variable) /
/// [`record_result`](WorkflowContext::record_result) to hand data to later
/// steps.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: Action,
        step: &Step,
        context: &mut WorkflowContext,
    ) -> Result<StepResult, Box<dyn Error + Send + Sync>>;
}

/// Per-run state shared between the registry and in-flight advancement
/// calls.
///
/// The status lives outside the body lock so cancellation can take effect
/// immediately even while a step is executing; the in-flight call observes
/// the terminal status when it returns and discards its result.
struct RunHandle {
    status: StdMutex<RunStatus>,
    body: TokioMutex<WorkflowRun>,
}

impl RunHandle {
    fn status(&self) -> RunStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: RunStatus) {
        *self.status.lock().unwrap() = status;
    }
}

/// Summary counters for a [`WorkflowExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowStats {
    pub registered_workflows: usize,
    pub active_runs: usize,
    pub completed_runs: usize,
}

/// The engine. See the module docs for the execution model.
pub struct WorkflowExecutor {
    action_executor: Arc<dyn ActionExecutor>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    active_runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    completed_runs: RwLock<VecDeque<WorkflowRun>>,
    listeners: ListenerSet<dyn WorkflowListener>,
    project_path: String,
    max_steps: usize,
}

impl WorkflowExecutor {
    pub fn new(action_executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            action_executor,
            workflows: RwLock::new(HashMap::new()),
            active_runs: RwLock::new(HashMap::new()),
            completed_runs: RwLock::new(VecDeque::new()),
            listeners: ListenerSet::new(),
            project_path: ".".to_string(),
            max_steps: 100,
        }
    }

    /// Project path handed to every run context (builder pattern).
    pub fn with_project_path(mut self, project_path: impl Into<String>) -> Self {
        self.project_path = project_path.into();
        self
    }

    /// Default step cap for
    /// [`execute_until_complete`](WorkflowExecutor::execute_until_complete);
    /// a workflow's `"max_steps"` config entry overrides it (builder
    /// pattern).
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    // ── Registry ─────────────────────────────────────────────────────────

    /// Validate and register a workflow, replacing any previous definition
    /// with the same id. A failed validation leaves the registry unchanged.
    pub fn register_workflow(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        workflow.validate()?;
        log::info!("registered workflow '{}' ({})", workflow.name, workflow.id);
        self.workflows
            .write()
            .unwrap()
            .insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub fn unregister_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.write().unwrap().remove(workflow_id)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().unwrap().get(workflow_id).cloned()
    }

    pub fn all_workflows(&self) -> Vec<Arc<Workflow>> {
        self.workflows.read().unwrap().values().cloned().collect()
    }

    /// Workflows declaring at least one trigger of the given type.
    pub fn workflows_for_trigger(&self, trigger_type: TriggerType) -> Vec<Arc<Workflow>> {
        self.all_workflows()
            .into_iter()
            .filter(|w| w.triggers.iter().any(|t| t.trigger_type == trigger_type))
            .collect()
    }

    // ── Run lifecycle ────────────────────────────────────────────────────

    /// Create a run for a registered workflow and emit `WorkflowStarted`.
    ///
    /// The run starts in `Running` with the workflow's first step current
    /// and the given variables seeded into a fresh context.
    pub fn start_workflow(
        &self,
        workflow_id: &str,
        variables: HashMap<String, String>,
    ) -> Result<WorkflowRun, WorkflowError> {
        let workflow = self
            .get_workflow(workflow_id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;

        let mut context = WorkflowContext::new(&workflow.id, &self.project_path, variables);
        context.current_step = workflow.first_step().map(|s| s.id.clone());
        let run = WorkflowRun::new(&workflow, context);

        let handle = Arc::new(RunHandle {
            status: StdMutex::new(RunStatus::Running),
            body: TokioMutex::new(run.clone()),
        });
        self.active_runs
            .write()
            .unwrap()
            .insert(run.id.clone(), handle);

        log::info!("started run {} of workflow '{}'", run.id, workflow.name);
        self.emit(WorkflowEvent::WorkflowStarted {
            run_id: run.id.clone(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
        });
        Ok(run)
    }

    /// Advance the run by one step.
    ///
    /// Returns the step's result, or `None` when the run is unknown, not
    /// `Running`, suspended at a user checkpoint by this call, or was
    /// cancelled while the step was in flight (the in-flight result is
    /// discarded).
    pub async fn execute_next_step(&self, run_id: &str) -> Option<StepResult> {
        let handle = self.active_runs.read().unwrap().get(run_id).cloned()?;
        if handle.status() != RunStatus::Running {
            return None;
        }
        let mut body = handle.body.lock().await;
        // The status may have moved while we waited for the run lock.
        if handle.status() != RunStatus::Running {
            return None;
        }

        let workflow = self.get_workflow(&body.workflow_id)?;
        let step_id = body.current_step.clone()?;
        let step = workflow.step(&step_id)?.clone();

        // Condition gate: skip without StepStarted, advance on success.
        if let Some(condition) = &step.condition {
            if !condition.evaluate(&body.context) {
                let result = StepResult::success(&step.id, step.action, "Skipped due to condition");
                self.record_and_advance(&handle, &mut body, &step, result.clone());
                return Some(result);
            }
        }

        if step.action.requires_user_interaction() {
            handle.set_status(RunStatus::WaitingUser);
            body.status = RunStatus::WaitingUser;
            let prompt = step
                .config
                .get("prompt")
                .and_then(|v| v.as_str())
                .unwrap_or("Continue?")
                .to_string();
            self.emit(WorkflowEvent::UserInputRequired {
                run_id: body.id.clone(),
                step_id: step.id.clone(),
                prompt,
            });
            return None;
        }

        self.emit(WorkflowEvent::StepStarted {
            run_id: body.id.clone(),
            step_id: step.id.clone(),
            action: step.action,
        });

        let started = Instant::now();
        let outcome = self
            .action_executor
            .execute(step.action, &step, &mut body.context)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                log::warn!("step '{}' of run {} failed: {}", step.id, body.id, e);
                StepResult::failure(&step.id, step.action, e.to_string())
            }
        };
        result.duration_ms = duration_ms;

        if handle.status().is_terminal() {
            // Cancelled mid-flight; the result is discarded.
            body.status = handle.status();
            self.finalize(&mut body);
            return None;
        }

        self.record_and_advance(&handle, &mut body, &step, result.clone());
        Some(result)
    }

    /// Drive the run until it leaves `Running` (terminal, paused, or waiting
    /// for the user) or the step cap is reached. Returns the final snapshot.
    pub async fn execute_until_complete(&self, run_id: &str) -> Option<WorkflowRun> {
        let cap = self
            .get_run(run_id)
            .await
            .and_then(|run| self.get_workflow(&run.workflow_id))
            .and_then(|w| w.config.get("max_steps").and_then(|v| v.as_u64()))
            .map(|v| v as usize)
            .unwrap_or(self.max_steps);

        loop {
            let run = self.get_run(run_id).await?;
            if run.status != RunStatus::Running || run.completed_steps.len() >= cap {
                return Some(run);
            }
            if self.execute_next_step(run_id).await.is_none() {
                // Checkpoint, cancellation, or a broken pointer; either way
                // the run can no longer advance here.
                return self.get_run(run_id).await;
            }
        }
    }

    /// Answer a pending `AskUser` checkpoint.
    ///
    /// Only effective while the run is `WaitingUser`; otherwise the current
    /// snapshot is returned unchanged. Records a synthetic result for the
    /// checkpoint step (success iff `proceed`) and advances along the
    /// corresponding branch. Declining with no failure branch cancels the
    /// run.
    pub async fn continue_after_user_input(&self, run_id: &str, proceed: bool) -> Option<WorkflowRun> {
        let handle = self.active_runs.read().unwrap().get(run_id).cloned();
        let handle = match handle {
            Some(handle) => handle,
            None => return self.completed_run(run_id),
        };
        if handle.status() != RunStatus::WaitingUser {
            return Some(self.snapshot(&handle).await);
        }
        let mut body = handle.body.lock().await;
        if handle.status() != RunStatus::WaitingUser {
            body.status = handle.status();
            return Some(body.clone());
        }

        let workflow = self.get_workflow(&body.workflow_id)?;
        let step_id = body.current_step.clone()?;
        let step = workflow.step(&step_id)?.clone();

        let result = if proceed {
            StepResult::success(&step.id, step.action, "User approved")
        } else {
            StepResult::failure(&step.id, step.action, "User declined")
        };

        handle.set_status(RunStatus::Running);
        body.status = RunStatus::Running;

        if !proceed && step.on_failure.is_none() {
            body.context.record_result(result.clone());
            body.completed_steps.push(result.clone());
            self.emit(WorkflowEvent::StepCompleted {
                run_id: body.id.clone(),
                step_id: step.id.clone(),
                result,
            });
            handle.set_status(RunStatus::Cancelled);
            body.status = RunStatus::Cancelled;
            self.finalize(&mut body);
            return Some(body.clone());
        }

        self.record_and_advance(&handle, &mut body, &step, result);
        Some(body.clone())
    }

    /// Running → Paused. A no-op in any other state.
    pub async fn pause_workflow(&self, run_id: &str) -> Option<WorkflowRun> {
        let handle = self.active_runs.read().unwrap().get(run_id).cloned()?;
        {
            let mut status = handle.status.lock().unwrap();
            if *status == RunStatus::Running {
                *status = RunStatus::Paused;
            }
        }
        Some(self.snapshot(&handle).await)
    }

    /// Paused → Running. A no-op in any other state.
    pub async fn resume_workflow(&self, run_id: &str) -> Option<WorkflowRun> {
        let handle = self.active_runs.read().unwrap().get(run_id).cloned()?;
        {
            let mut status = handle.status.lock().unwrap();
            if *status == RunStatus::Paused {
                *status = RunStatus::Running;
            }
        }
        Some(self.snapshot(&handle).await)
    }

    /// Cancel an active or paused run. Idempotent: cancelling a terminal run
    /// returns its snapshot unchanged. The transition is immediate; an
    /// in-flight step keeps executing but its result is discarded.
    pub async fn cancel_workflow(&self, run_id: &str) -> Option<WorkflowRun> {
        let handle = self.active_runs.read().unwrap().get(run_id).cloned();
        let handle = match handle {
            Some(handle) => handle,
            None => return self.completed_run(run_id),
        };
        {
            let mut status = handle.status.lock().unwrap();
            if !status.is_terminal() {
                *status = RunStatus::Cancelled;
            }
        }
        let mut body = handle.body.lock().await;
        body.status = handle.status();
        // An in-flight step may have finalized the run while we waited.
        if self.active_runs.read().unwrap().contains_key(run_id) {
            self.finalize(&mut body);
        }
        log::info!("cancelled run {}", run_id);
        Some(body.clone())
    }

    /// Start every registered workflow with a trigger matching the event.
    pub fn process_trigger(&self, event: &TriggerEvent) -> Vec<WorkflowRun> {
        let matching: Vec<Arc<Workflow>> = self
            .all_workflows()
            .into_iter()
            .filter(|w| w.triggers.iter().any(|t| t.matches(event)))
            .collect();
        matching
            .iter()
            .filter_map(|w| match self.start_workflow(&w.id, HashMap::new()) {
                Ok(run) => Some(run),
                Err(e) => {
                    log::warn!("trigger start of '{}' failed: {}", w.id, e);
                    None
                }
            })
            .collect()
    }

    // ── Inspection ───────────────────────────────────────────────────────

    /// Snapshot a run, active or completed.
    pub async fn get_run(&self, run_id: &str) -> Option<WorkflowRun> {
        let handle = self.active_runs.read().unwrap().get(run_id).cloned();
        match handle {
            Some(handle) => Some(self.snapshot(&handle).await),
            None => self.completed_run(run_id),
        }
    }

    pub async fn active_runs(&self) -> Vec<WorkflowRun> {
        let handles: Vec<Arc<RunHandle>> =
            self.active_runs.read().unwrap().values().cloned().collect();
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            runs.push(self.snapshot(&handle).await);
        }
        runs
    }

    pub fn completed_runs(&self) -> Vec<WorkflowRun> {
        self.completed_runs.read().unwrap().iter().cloned().collect()
    }

    pub fn stats(&self) -> WorkflowStats {
        WorkflowStats {
            registered_workflows: self.workflows.read().unwrap().len(),
            active_runs: self.active_runs.read().unwrap().len(),
            completed_runs: self.completed_runs.read().unwrap().len(),
        }
    }

    // ── Listeners ────────────────────────────────────────────────────────

    pub fn add_listener(&self, listener: Arc<dyn WorkflowListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn WorkflowListener>) -> bool {
        self.listeners.remove(listener)
    }

    fn emit(&self, event: WorkflowEvent) {
        for listener in self.listeners.snapshot() {
            deliver(|| listener.on_workflow_event(&event));
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Record a step result, emit `StepCompleted`, and move the run to the
    /// branch the result selects. A missing branch pointer ends the run:
    /// `Completed` on success, `Failed` otherwise.
    fn record_and_advance(
        &self,
        handle: &RunHandle,
        body: &mut WorkflowRun,
        step: &Step,
        result: StepResult,
    ) {
        body.context.record_result(result.clone());
        body.completed_steps.push(result.clone());
        self.emit(WorkflowEvent::StepCompleted {
            run_id: body.id.clone(),
            step_id: step.id.clone(),
            result: result.clone(),
        });

        let next = if result.success {
            step.on_success.clone()
        } else {
            step.on_failure.clone()
        };
        body.context.last_step_success = result.success;

        match next {
            Some(next_id) => {
                body.current_step = Some(next_id.clone());
                body.context.current_step = Some(next_id);
            }
            None => {
                let status = if result.success {
                    RunStatus::Completed
                } else {
                    RunStatus::Failed
                };
                handle.set_status(status);
                body.status = status;
                body.current_step = None;
                if !result.success {
                    body.error = result.error.clone();
                }
                self.finalize(body);
                self.emit(WorkflowEvent::WorkflowCompleted {
                    run_id: body.id.clone(),
                    success: result.success,
                    steps_completed: body.completed_steps.len(),
                    duration_ms: body.duration_ms(),
                });
                if !result.success {
                    self.emit(WorkflowEvent::WorkflowFailed {
                        run_id: body.id.clone(),
                        error: result.error.clone().unwrap_or_default(),
                        failed_step_id: Some(step.id.clone()),
                    });
                }
                log::info!("run {} ended as {}", body.id, body.status);
            }
        }
    }

    /// Move a terminal run from the active table to the bounded
    /// completed-run list. Idempotent per run id.
    fn finalize(&self, body: &mut WorkflowRun) {
        if body.ended_at.is_none() {
            body.ended_at = Some(Utc::now());
        }
        self.active_runs.write().unwrap().remove(&body.id);
        let mut completed = self.completed_runs.write().unwrap();
        if completed.iter().any(|r| r.id == body.id) {
            return;
        }
        completed.push_back(body.clone());
        while completed.len() > COMPLETED_RUN_RETENTION {
            completed.pop_front();
        }
    }

    async fn snapshot(&self, handle: &RunHandle) -> WorkflowRun {
        let mut body = handle.body.lock().await;
        body.status = handle.status();
        body.clone()
    }

    fn completed_run(&self, run_id: &str) -> Option<WorkflowRun> {
        self.completed_runs
            .read()
            .unwrap()
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
    }
}
