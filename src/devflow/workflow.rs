//! Workflow definitions and run state.
//!
//! A [`Workflow`] is an immutable directed graph of [`Step`]s connected by
//! per-step success/failure pointers. Starting a workflow produces a
//! [`WorkflowRun`] carrying a mutable [`WorkflowContext`]; the
//! [`WorkflowExecutor`](crate::WorkflowExecutor) advances the run one step at
//! a time, dispatching each step's [`Action`] to an external executor.
//!
//! # Example
//!
//! ```rust
//! use devflow::workflow::{Action, Step, Workflow};
//!
//! let workflow = Workflow::new("fix-todos", "Fix TODOs")
//!     .with_step(Step::new("scan", Action::SearchCodebase).on_success("report"))
//!     .with_step(Step::new("report", Action::Log));
//!
//! assert!(workflow.validate().is_ok());
//! assert_eq!(workflow.first_step().unwrap().id, "scan");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// The closed set of orchestration verbs a step can carry.
///
/// The engine does not interpret actions itself (apart from
/// [`AskUser`](Action::AskUser) checkpoints); it dispatches them to the
/// injected [`ActionExecutor`](crate::ActionExecutor) together with the step
/// and the run context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Pause the run and ask the user to confirm before continuing.
    AskUser,
    AnalyzeCode,
    GenerateCode,
    ApplyChanges,
    RunTests,
    SearchCodebase,
    CreateFile,
    ModifyFile,
    CommitChanges,
    RunCommand,
    Wait,
    Branch,
    SetVariable,
    Log,
    Notify,
}

impl Action {
    /// Whether dispatching this action must suspend the run at a user
    /// checkpoint instead of calling the action executor.
    ///
    /// # Example
    ///
    /// ```rust
    /// use devflow::workflow::Action;
    ///
    /// assert!(Action::AskUser.requires_user_interaction());
    /// assert!(!Action::RunTests.requires_user_interaction());
    /// ```
    pub fn requires_user_interaction(&self) -> bool {
        matches!(self, Action::AskUser)
    }

    /// Whether this action writes to the project's source tree.
    pub fn modifies_code(&self) -> bool {
        matches!(
            self,
            Action::ApplyChanges | Action::CreateFile | Action::ModifyFile | Action::CommitChanges
        )
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::AskUser => "ask_user",
            Action::AnalyzeCode => "analyze_code",
            Action::GenerateCode => "generate_code",
            Action::ApplyChanges => "apply_changes",
            Action::RunTests => "run_tests",
            Action::SearchCodebase => "search_codebase",
            Action::CreateFile => "create_file",
            Action::ModifyFile => "modify_file",
            Action::CommitChanges => "commit_changes",
            Action::RunCommand => "run_command",
            Action::Wait => "wait",
            Action::Branch => "branch",
            Action::SetVariable => "set_variable",
            Action::Log => "log",
            Action::Notify => "notify",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A guard evaluated against the run context before a step executes.
///
/// When the condition evaluates to `false` the step is skipped with a
/// synthetic success result and the run advances along the success branch.
///
/// # Example
///
/// ```rust
/// use devflow::workflow::{Condition, WorkflowContext};
/// use std::collections::HashMap;
///
/// let mut vars = HashMap::new();
/// vars.insert("mode".to_string(), "fast".to_string());
/// let ctx = WorkflowContext::new("wf", ".", vars);
///
/// assert!(Condition::VariableSet("mode".into()).evaluate(&ctx));
/// assert!(Condition::VariableEquals("mode=fast".into()).evaluate(&ctx));
/// assert!(!Condition::VariableEquals("mode=slow".into()).evaluate(&ctx));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// True when the named variable is present in the context.
    VariableSet(String),
    /// True when the variable named before the `=` equals the value after it.
    /// A string without `=` never matches.
    VariableEquals(String),
    /// True when the most recent step succeeded.
    PreviousSuccess,
    /// True when the most recent step failed.
    PreviousFailure,
    Always,
    Never,
}

impl Condition {
    pub fn evaluate(&self, context: &WorkflowContext) -> bool {
        match self {
            Condition::VariableSet(name) => context.variable(name).is_some(),
            Condition::VariableEquals(pair) => match pair.split_once('=') {
                Some((name, value)) => context.variable(name) == Some(value),
                None => false,
            },
            Condition::PreviousSuccess => context.last_step_success,
            Condition::PreviousFailure => !context.last_step_success,
            Condition::Always => true,
            Condition::Never => false,
        }
    }
}

/// The external event kinds a workflow can be triggered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    FileSave,
    ErrorDetected,
    Command,
    Schedule,
    Webhook,
    GitHook,
}

/// A trigger declaration on a workflow.
///
/// A trigger matches a [`TriggerEvent`] of the same type when its pattern is
/// absent, or when the event data matches the pattern: regex for
/// [`FileSave`](TriggerType::FileSave) and [`GitHook`](TriggerType::GitHook),
/// substring for [`ErrorDetected`](TriggerType::ErrorDetected), and exact
/// comparison otherwise.
///
/// # Example
///
/// ```rust
/// use devflow::workflow::{Trigger, TriggerEvent, TriggerType};
///
/// let trigger = Trigger::new(TriggerType::FileSave).with_pattern(r".*\.rs$");
/// assert!(trigger.matches(&TriggerEvent::new(TriggerType::FileSave, Some("src/main.rs"))));
/// assert!(!trigger.matches(&TriggerEvent::new(TriggerType::FileSave, Some("notes.md"))));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger_type: TriggerType,
    pub pattern: Option<String>,
}

impl Trigger {
    pub fn new(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            pattern: None,
        }
    }

    /// Attach a matching pattern (builder pattern).
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn matches(&self, event: &TriggerEvent) -> bool {
        if self.trigger_type != event.trigger_type {
            return false;
        }
        let pattern = match &self.pattern {
            Some(p) => p,
            None => return true,
        };
        let data = match &event.data {
            Some(d) => d,
            None => return false,
        };
        match self.trigger_type {
            TriggerType::FileSave | TriggerType::GitHook => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(data),
                Err(e) => {
                    log::warn!("invalid trigger pattern '{}': {}", pattern, e);
                    false
                }
            },
            TriggerType::ErrorDetected => data.contains(pattern.as_str()),
            TriggerType::Command
            | TriggerType::Webhook
            | TriggerType::Manual
            | TriggerType::Schedule => data == pattern,
        }
    }
}

/// An external event handed to
/// [`process_trigger`](crate::WorkflowExecutor::process_trigger).
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub trigger_type: TriggerType,
    pub data: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(trigger_type: TriggerType, data: Option<&str>) -> Self {
        Self {
            trigger_type,
            data: data.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

/// A node in a workflow graph.
///
/// `timeout_ms` and `retry_count` are declarative: the engine forwards the
/// step verbatim to the action executor, which is responsible for enforcing
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique within the owning workflow.
    pub id: String,
    pub action: Action,
    /// Opaque per-step configuration handed to the action executor. The
    /// engine itself only reads the `"prompt"` entry of `AskUser` steps.
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Next step when this step succeeds; `None` means the run completes.
    pub on_success: Option<String>,
    /// Next step when this step fails; `None` means the run aborts.
    pub on_failure: Option<String>,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub condition: Option<Condition>,
}

impl Step {
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action,
            config: HashMap::new(),
            on_success: None,
            on_failure: None,
            timeout_ms: 30_000,
            retry_count: 0,
            condition: None,
        }
    }

    pub fn on_success(mut self, step_id: impl Into<String>) -> Self {
        self.on_success = Some(step_id.into());
        self
    }

    pub fn on_failure(mut self, step_id: impl Into<String>) -> Self {
        self.on_failure = Some(step_id.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// An immutable workflow definition.
///
/// Register workflows on a [`WorkflowExecutor`](crate::WorkflowExecutor);
/// registration runs [`Workflow::validate`] and rejects definitions with
/// dangling branch pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Workflow-level configuration. The engine reads the optional
    /// `"max_steps"` entry as the `execute_until_complete` cap.
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    pub version: u32,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            triggers: Vec::new(),
            config: HashMap::new(),
            version: 1,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn first_step(&self) -> Option<&Step> {
        self.steps.first()
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Check the structural invariants required at registration time.
    ///
    /// Rejects the workflow unless the id and name are non-empty, at least
    /// one step exists, step ids are unique, and every `on_success` /
    /// `on_failure` pointer references a step in this workflow. All failed
    /// checks are reported together in a single
    /// [`WorkflowError::InvalidWorkflow`].
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut reasons = Vec::new();
        if self.id.is_empty() {
            reasons.push("workflow id must not be empty".to_string());
        }
        if self.name.is_empty() {
            reasons.push("workflow name must not be empty".to_string());
        }
        if self.steps.is_empty() {
            reasons.push("workflow must contain at least one step".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                reasons.push(format!("duplicate step id '{}'", step.id));
            }
        }
        for step in &self.steps {
            for (label, target) in [("on_success", &step.on_success), ("on_failure", &step.on_failure)] {
                if let Some(target) = target {
                    if self.step(target).is_none() {
                        reasons.push(format!(
                            "step '{}' {} references unknown step '{}'",
                            step.id, label, target
                        ));
                    }
                }
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::InvalidWorkflow(reasons.join("; ")))
        }
    }
}

/// The result of executing (or skipping) a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub action: Action,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Structured outputs the action executor wants to expose to later steps.
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

impl StepResult {
    pub fn success(step_id: impl Into<String>, action: Action, output: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            action,
            success: true,
            output: Some(output.into()),
            error: None,
            duration_ms: 0,
            outputs: HashMap::new(),
        }
    }

    pub fn failure(step_id: impl Into<String>, action: Action, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            action,
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms: 0,
            outputs: HashMap::new(),
        }
    }

    pub fn with_output_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// Run-scoped mutable state shared between the engine and the action
/// executor.
///
/// The executor receives the context by exclusive reference and may write
/// through [`set_variable`](WorkflowContext::set_variable) and
/// [`record_result`](WorkflowContext::record_result) to propagate data to
/// later steps. Advancement of a single run is serialized, so the executor
/// never races another step of the same run for this state.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub run_id: String,
    pub project_path: String,
    variables: HashMap<String, String>,
    results: HashMap<String, StepResult>,
    pub current_step: Option<String>,
    pub last_step_success: bool,
    pub started_at: DateTime<Utc>,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: impl Into<String>,
        project_path: impl Into<String>,
        variables: HashMap<String, String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: Uuid::new_v4().to_string(),
            project_path: project_path.into(),
            variables,
            results: HashMap::new(),
            current_step: None,
            last_step_success: true,
            started_at: Utc::now(),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn record_result(&mut self, result: StepResult) {
        self.results.insert(result.step_id.clone(), result);
    }

    pub fn results(&self) -> &HashMap<String, StepResult> {
        &self.results
    }
}

/// Lifecycle status of a [`WorkflowRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingUser,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunStatus {
    /// Active runs live in the executor's active-run table and may still
    /// advance.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::WaitingUser | RunStatus::Paused)
    }

    /// Terminal runs never advance again and move to the completed-run list.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled | RunStatus::Timeout
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::WaitingUser => "waiting_user",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// One execution of a workflow.
///
/// Instances handed to callers are value snapshots of the executor's
/// authoritative state; mutating a snapshot has no effect on the run.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub context: WorkflowContext,
    pub completed_steps: Vec<StepResult>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub(crate) fn new(workflow: &Workflow, context: WorkflowContext) -> Self {
        let current_step = workflow.first_step().map(|s| s.id.clone());
        Self {
            id: context.run_id.clone(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            status: RunStatus::Running,
            context,
            completed_steps: Vec::new(),
            current_step,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Wall-clock duration so far, or total duration once the run ended.
    pub fn duration_ms(&self) -> u64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Errors surfaced by workflow registration and start.
///
/// Unknown run/step ids during advancement are reported as absent optional
/// results instead, never as errors.
#[derive(Debug, Clone)]
pub enum WorkflowError {
    /// The definition failed validation; the message joins all reasons.
    InvalidWorkflow(String),
    /// `start_workflow` was called with an unregistered workflow id.
    UnknownWorkflow(String),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::InvalidWorkflow(reasons) => write!(f, "Invalid workflow: {}", reasons),
            WorkflowError::UnknownWorkflow(id) => write!(f, "Unknown workflow: {}", id),
        }
    }
}

impl Error for WorkflowError {}
