//! Workflow Engine Demo
//!
//! Drives a small branching workflow end to end with a local action executor:
//! - A conditional analysis step that is skipped unless `deep=true` is passed
//! - A user checkpoint before changes are applied
//! - A failure branch that cleans up when tests fail
//!
//! Run: cargo run --example workflow_demo

use async_trait::async_trait;
use devflow::event::{WorkflowEvent, WorkflowListener};
use devflow::workflow::{
    Action, Condition, Step, StepResult, Workflow, WorkflowContext,
};
use devflow::workflow_executor::{ActionExecutor, WorkflowExecutor};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// Pretends to do the work; real integrations call into the editor, the
/// test runner, and the VCS here.
struct DemoExecutor;

#[async_trait]
impl ActionExecutor for DemoExecutor {
    async fn execute(
        &self,
        action: Action,
        step: &Step,
        context: &mut WorkflowContext,
    ) -> Result<StepResult, Box<dyn Error + Send + Sync>> {
        println!("  [executor] {} ({})", step.id, action);
        if action == Action::RunTests {
            context.set_variable("tests_ran", "true");
        }
        Ok(StepResult::success(&step.id, action, format!("{} finished", step.id)))
    }
}

struct Printer;

impl WorkflowListener for Printer {
    fn on_workflow_event(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::WorkflowStarted { workflow_name, .. } => {
                println!("[event] started '{}'", workflow_name);
            }
            WorkflowEvent::StepCompleted { step_id, result, .. } => {
                println!("[event] step {} -> success={}", step_id, result.success);
            }
            WorkflowEvent::UserInputRequired { prompt, .. } => {
                println!("[event] waiting on user: {}", prompt);
            }
            WorkflowEvent::WorkflowCompleted { success, steps_completed, .. } => {
                println!("[event] done: success={} steps={}", success, steps_completed);
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let engine = WorkflowExecutor::new(Arc::new(DemoExecutor)).with_project_path(".");
    engine.add_listener(Arc::new(Printer));

    engine.register_workflow(
        Workflow::new("fix-and-test", "Fix and Test")
            .with_description("Analyze, generate a fix, confirm with the user, test it")
            .with_step(
                Step::new("analyze", Action::AnalyzeCode)
                    .with_condition(Condition::VariableSet("deep".into()))
                    .on_success("generate"),
            )
            .with_step(Step::new("generate", Action::GenerateCode).on_success("confirm"))
            .with_step(
                Step::new("confirm", Action::AskUser)
                    .with_config("prompt", serde_json::json!("Apply the generated fix?"))
                    .on_success("apply"),
            )
            .with_step(
                Step::new("apply", Action::ApplyChanges)
                    .on_success("test")
                    .on_failure("revert"),
            )
            .with_step(Step::new("test", Action::RunTests).on_failure("revert"))
            .with_step(Step::new("revert", Action::RunCommand)),
    )?;

    let mut variables = HashMap::new();
    variables.insert("deep".to_string(), "true".to_string());
    let run = engine.start_workflow("fix-and-test", variables)?;

    // Runs until the user checkpoint.
    engine.execute_until_complete(&run.id).await;

    // Approve the checkpoint and finish.
    engine.continue_after_user_input(&run.id, true).await;
    let finished = engine.execute_until_complete(&run.id).await.unwrap();

    println!(
        "\nrun {} ended as {} after {} steps ({} ms)",
        finished.id,
        finished.status,
        finished.completed_steps.len(),
        finished.duration_ms(),
    );
    println!("tests_ran = {:?}", finished.context.variable("tests_ran"));
    Ok(())
}
