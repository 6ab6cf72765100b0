// src/lib.rs

// Import the top-level `devflow` module.
pub mod devflow;

// Expose the component modules at the crate root so callers write
// devflow::workflow::Workflow instead of devflow::devflow::workflow::Workflow.
pub use devflow::{
    collaboration, event, orchestrator, provider, provider_manager, providers, rate_limiter,
    state_store, workflow, workflow_executor,
};

// Re-exporting key items for easier external access.
pub use devflow::collaboration::{AgentRole, Protocol, Session, SessionStatus};
pub use devflow::event::{CollaborationEvent, CollaborationListener, WorkflowEvent, WorkflowListener};
pub use devflow::orchestrator::{AgentInvoker, CollaborationOrchestrator, SpecialistService};
pub use devflow::provider::{Provider, UnifiedChatRequest, UnifiedChatResponse};
pub use devflow::provider_manager::{ProviderManager, SelectionStrategy};
pub use devflow::rate_limiter::{RateLimitConfig, RateLimiter};
pub use devflow::workflow::{Action, RunStatus, Workflow, WorkflowRun};
pub use devflow::workflow_executor::{ActionExecutor, WorkflowExecutor};
