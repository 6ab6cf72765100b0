//! Workflow and collaboration event system.
//!
//! Provides a callback-based observability layer for the two orchestration
//! engines. Implement [`WorkflowListener`] or [`CollaborationListener`] to
//! receive real-time notifications about:
//!
//! - **Workflow lifecycle**: run start/end, step boundaries, user checkpoints
//! - **Collaboration lifecycle**: session start/end, message flow, turn
//!   advancement, decisions, consensus
//!
//! # Architecture
//!
//! Each engine owns an independent list of subscribers. Events are emitted
//! synchronously in the caller's context by iterating over a snapshot of the
//! subscriber list, so listeners never have to hold a lock while being
//! invoked, and a listener added or removed mid-emission does not disturb the
//! in-flight delivery. A panicking listener is caught and logged; it cannot
//! corrupt engine state.
//!
//! # Example
//!
//! ```rust
//! use devflow::event::{WorkflowEvent, WorkflowListener};
//!
//! struct Printer;
//!
//! impl WorkflowListener for Printer {
//!     fn on_workflow_event(&self, event: &WorkflowEvent) {
//!         match event {
//!             WorkflowEvent::StepCompleted { run_id, step_id, .. } => {
//!                 println!("{}: step {} done", run_id, step_id);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

use crate::devflow::collaboration::{AgentRole, MessageType, Protocol};
use crate::devflow::workflow::{Action, StepResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

/// Events emitted by a [`WorkflowExecutor`](crate::WorkflowExecutor) while a
/// run advances through its step graph.
///
/// Every variant carries the `run_id` so handlers can identify the source run
/// without external state. For a single run the events follow the causal
/// order of the operations that produced them: `WorkflowStarted` strictly
/// precedes any `StepStarted` for that run.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A run was created and entered the `Running` state.
    WorkflowStarted {
        run_id: String,
        workflow_id: String,
        workflow_name: String,
    },

    /// A step is about to be dispatched to the action executor.
    ///
    /// Not emitted for steps skipped by their condition, nor for `AskUser`
    /// checkpoints (those emit [`UserInputRequired`](WorkflowEvent::UserInputRequired)).
    StepStarted {
        run_id: String,
        step_id: String,
        action: Action,
    },

    /// A step produced a result (including synthetic skip and checkpoint
    /// results). The result is a read-only snapshot.
    StepCompleted {
        run_id: String,
        step_id: String,
        result: StepResult,
    },

    /// The run hit an `AskUser` checkpoint and is now `WaitingUser`.
    ///
    /// The `prompt` is taken from the step's `"prompt"` config entry. Resume
    /// the run with
    /// [`continue_after_user_input`](crate::WorkflowExecutor::continue_after_user_input).
    UserInputRequired {
        run_id: String,
        step_id: String,
        prompt: String,
    },

    /// The run reached a terminal step. `success` reflects the final step
    /// result; a failed ending also emits [`WorkflowFailed`](WorkflowEvent::WorkflowFailed).
    WorkflowCompleted {
        run_id: String,
        success: bool,
        steps_completed: usize,
        duration_ms: u64,
    },

    /// The run ended on a failure with no remaining failure branch.
    WorkflowFailed {
        run_id: String,
        error: String,
        failed_step_id: Option<String>,
    },
}

/// Events emitted by a [`CollaborationOrchestrator`](crate::CollaborationOrchestrator)
/// as sessions advance turn by turn.
#[derive(Debug, Clone)]
pub enum CollaborationEvent {
    /// A session moved from `Created` to `Active` and all participants were
    /// bound to agents.
    SessionStarted {
        session_id: String,
        participant_count: usize,
        protocol: Protocol,
    },

    /// A message was appended to the session log.
    MessageSent {
        session_id: String,
        message_id: String,
        sender_role: AgentRole,
        message_type: MessageType,
    },

    /// The turn counter advanced. `next_role` is the participant who speaks
    /// next under the session's protocol.
    TurnAdvanced {
        session_id: String,
        new_turn: usize,
        next_role: AgentRole,
    },

    /// A decision was recorded in the shared context.
    DecisionMade {
        session_id: String,
        description: String,
        by_role: AgentRole,
    },

    /// A consensus proposal crossed the acceptance threshold.
    ConsensusReached {
        session_id: String,
        proposal: String,
        approval_pct: f64,
    },

    /// The session ended (successfully or not).
    SessionCompleted {
        session_id: String,
        total_turns: usize,
        message_count: usize,
        decision_count: usize,
    },
}

/// Trait for receiving workflow events.
///
/// Listeners are invoked synchronously; keep handlers short or hand the event
/// off to a channel. The `Send + Sync` bound allows a handler to be shared
/// across tasks via `Arc<dyn WorkflowListener>`.
pub trait WorkflowListener: Send + Sync {
    fn on_workflow_event(&self, event: &WorkflowEvent);
}

/// Trait for receiving collaboration events. Same delivery contract as
/// [`WorkflowListener`].
pub trait CollaborationListener: Send + Sync {
    fn on_collaboration_event(&self, event: &CollaborationEvent);
}

/// A concurrent list of subscribers.
///
/// Add/remove take a short write lock; emission clones the list under a read
/// lock and then invokes the subscribers lock-free. Removal matches by
/// `Arc::ptr_eq`, so callers keep the `Arc` they registered.
pub(crate) struct ListenerSet<L: ?Sized> {
    inner: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<L>) {
        self.inner.write().unwrap().push(listener);
    }

    pub(crate) fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.inner.write().unwrap();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.inner.read().unwrap().clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}

/// Invoke `f` for one listener, isolating panics so a misbehaving subscriber
/// cannot poison the emitting engine.
pub(crate) fn deliver<F: FnOnce()>(f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::warn!("event listener panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl WorkflowListener for Counter {
        fn on_workflow_event(&self, _event: &WorkflowEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn add_remove_round_trips() {
        let set: ListenerSet<dyn WorkflowListener> = ListenerSet::new();
        let listener: Arc<dyn WorkflowListener> = Arc::new(Counter(AtomicUsize::new(0)));
        set.add(listener.clone());
        assert_eq!(set.len(), 1);
        assert!(set.remove(&listener));
        assert_eq!(set.len(), 0);
        assert!(!set.remove(&listener));
    }

    #[test]
    fn delivery_survives_panicking_listener() {
        deliver(|| panic!("listener bug"));
        // Reaching this line is the assertion.
    }
}
