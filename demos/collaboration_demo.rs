//! Collaboration Orchestrator Demo
//!
//! Runs a three-role review session under the round-robin protocol with a
//! canned agent invoker, then prints the final result. In production the
//! invoker funnels each turn through the provider manager.
//!
//! Run: cargo run --example collaboration_demo

use async_trait::async_trait;
use devflow::collaboration::{AgentHandle, AgentRole, Session};
use devflow::event::{CollaborationEvent, CollaborationListener};
use devflow::orchestrator::{AgentInvoker, CollaborationOrchestrator};
use std::error::Error;
use std::sync::Arc;

/// Answers every prompt with a short role-flavored line. Swap this for an
/// invoker that calls `ProviderManager::chat` to use real models.
struct CannedInvoker;

#[async_trait]
impl AgentInvoker for CannedInvoker {
    async fn invoke(
        &self,
        agent: &AgentHandle,
        _prompt: &str,
        session: &Session,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(match agent.role {
            AgentRole::Implementer => format!("Implementation plan for '{}'", session.goal),
            AgentRole::Reviewer => "The plan looks sound, watch the error paths".to_string(),
            AgentRole::Tester => "Needs a regression test for the empty-input case".to_string(),
            _ => format!("{} weighing in", agent.role),
        })
    }
}

struct Printer;

impl CollaborationListener for Printer {
    fn on_collaboration_event(&self, event: &CollaborationEvent) {
        match event {
            CollaborationEvent::SessionStarted { participant_count, protocol, .. } => {
                println!("[event] session started: {} participants, {}", participant_count, protocol);
            }
            CollaborationEvent::TurnAdvanced { new_turn, next_role, .. } => {
                println!("[event] turn {} done, next up: {}", new_turn, next_role);
            }
            CollaborationEvent::SessionCompleted { message_count, .. } => {
                println!("[event] session completed with {} messages", message_count);
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let orchestrator = CollaborationOrchestrator::new(Arc::new(CannedInvoker));
    orchestrator.add_listener(Arc::new(Printer));

    let session = orchestrator.create_review("Harden the config loader against bad input");
    orchestrator
        .add_fact(&session.id, "The loader currently panics on malformed TOML")
        .await;

    let result = orchestrator.execute_session(&session.id, 2).await?;

    println!("\ngoal:    {}", result.goal);
    println!("outcome: {}", result.outcome);
    println!("turns:   {}, messages: {}", result.total_turns, result.message_count);
    for (role, count) in &result.messages_by_role {
        println!("  {} spoke {} time(s)", role, count);
    }

    let transcript = orchestrator.get_session(&session.id).await.unwrap();
    println!("\ntranscript:");
    for message in &transcript.messages {
        println!("  [{}] {}", message.sender_role, message.content);
    }
    Ok(())
}
