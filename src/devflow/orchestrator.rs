//! Multi-agent collaboration orchestrator.
//!
//! A [`CollaborationOrchestrator`] maintains [`Session`]s and advances them
//! turn by turn according to their [`Protocol`]. Agent output is produced by
//! the injected [`AgentInvoker`]; agents are bound to participants at session
//! start through the [`SpecialistService`] (with a synthesized default handle
//! when no specialist exists for a role).
//!
//! Sessions are logically-independent state machines: different sessions
//! advance in parallel while turns of a single session are serialized by a
//! per-session lock.
//!
//! # Example
//!
//! ```rust,no_run
//! use devflow::collaboration::{AgentRole, Protocol};
//! use devflow::orchestrator::{AgentInvoker, CollaborationOrchestrator};
//! use std::sync::Arc;
//!
//! # async fn example(invoker: Arc<dyn AgentInvoker>) {
//! let orchestrator = CollaborationOrchestrator::new(invoker);
//! let session = orchestrator.create_session(
//!     "API design",
//!     "Agree on the v2 REST surface",
//!     vec![AgentRole::Architect, AgentRole::Implementer, AgentRole::Reviewer],
//!     Protocol::RoundRobin,
//! );
//!
//! let result = orchestrator.execute_session(&session.id, 2).await.unwrap();
//! println!("{}", result.outcome);
//! # }
//! ```

use crate::devflow::collaboration::{
    AgentHandle, AgentRole, CollaborationError, CollaborationResult, ConsensusState,
    ConsensusStatus, Decision, MessageType, Participant, ParticipantStatus, Protocol, Session,
    SessionMessage, SessionStatus, TurnResult,
};
use crate::devflow::event::{deliver, CollaborationEvent, CollaborationListener, ListenerSet};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

/// Produces an agent's textual contribution for one turn.
///
/// The orchestrator supplies the bound agent handle, the assembled prompt,
/// and a read-only session snapshot. The call may suspend for as long as the
/// underlying model needs; errors are converted into failure
/// [`TurnResult`]s, never propagated.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent: &AgentHandle,
        prompt: &str,
        session: &Session,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Resolves a role to an agent handle at session start. Returning `None`
/// makes the orchestrator synthesize [`AgentHandle::default_for`] instead.
#[async_trait]
pub trait SpecialistService: Send + Sync {
    async fn get_specialist(&self, role: AgentRole) -> Option<AgentHandle>;
}

/// Default specialist service with no specialists; every participant gets a
/// synthesized handle.
pub struct NoSpecialists;

#[async_trait]
impl SpecialistService for NoSpecialists {
    async fn get_specialist(&self, _role: AgentRole) -> Option<AgentHandle> {
        None
    }
}

/// Summary counters for a [`CollaborationOrchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_messages: usize,
    pub total_decisions: usize,
}

/// Per-session state. The status lives outside the body lock so
/// cancellation takes effect immediately even while an agent invocation is
/// in flight; the in-flight turn observes the terminal status on return and
/// discards its result.
struct SessionHandle {
    status: StdMutex<SessionStatus>,
    body: TokioMutex<Session>,
}

impl SessionHandle {
    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap() = status;
    }
}

/// The orchestrator. See the module docs for the execution model.
pub struct CollaborationOrchestrator {
    invoker: Arc<dyn AgentInvoker>,
    specialists: Arc<dyn SpecialistService>,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    consensus: RwLock<HashMap<String, ConsensusState>>,
    listeners: ListenerSet<dyn CollaborationListener>,
    consensus_threshold: f64,
    default_max_turns: usize,
}

impl CollaborationOrchestrator {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self {
            invoker,
            specialists: Arc::new(NoSpecialists),
            sessions: RwLock::new(HashMap::new()),
            consensus: RwLock::new(HashMap::new()),
            listeners: ListenerSet::new(),
            consensus_threshold: 0.66,
            default_max_turns: 50,
        }
    }

    /// Inject a specialist service (builder pattern).
    pub fn with_specialists(mut self, specialists: Arc<dyn SpecialistService>) -> Self {
        self.specialists = specialists;
        self
    }

    /// Override the consensus acceptance threshold, default 0.66 (builder
    /// pattern).
    pub fn with_consensus_threshold(mut self, threshold: f64) -> Self {
        self.consensus_threshold = threshold;
        self
    }

    /// Override the per-session turn cap, default 50 (builder pattern).
    pub fn with_default_max_turns(mut self, max_turns: usize) -> Self {
        self.default_max_turns = max_turns;
        self
    }

    // ── Session construction ─────────────────────────────────────────────

    /// Create a session in `Created` with one participant per role, in the
    /// given order.
    pub fn create_session(
        &self,
        name: impl Into<String>,
        goal: impl Into<String>,
        roles: Vec<AgentRole>,
        protocol: Protocol,
    ) -> Session {
        let session = Session::new(name, goal, roles, protocol, self.default_max_turns);
        let handle = Arc::new(SessionHandle {
            status: StdMutex::new(SessionStatus::Created),
            body: TokioMutex::new(session.clone()),
        });
        self.sessions
            .write()
            .unwrap()
            .insert(session.id.clone(), handle);
        log::info!("created session '{}' ({})", session.name, session.id);
        session
    }

    /// A two-seat debate between the given roles.
    pub fn create_debate(&self, goal: impl Into<String>, first: AgentRole, second: AgentRole) -> Session {
        self.create_session("Debate", goal, vec![first, second], Protocol::Debate)
    }

    /// A standard review panel: implementer, reviewer, tester.
    pub fn create_review(&self, goal: impl Into<String>) -> Session {
        self.create_session(
            "Code Review",
            goal,
            vec![AgentRole::Implementer, AgentRole::Reviewer, AgentRole::Tester],
            Protocol::RoundRobin,
        )
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Bind an agent to every participant and activate the session. Only
    /// effective from `Created`; otherwise the current snapshot is returned
    /// unchanged.
    pub async fn start_session(&self, session_id: &str) -> Option<Session> {
        let handle = self.session_handle(session_id)?;
        let mut body = handle.body.lock().await;
        body.status = handle.status();
        if body.status != SessionStatus::Created {
            return Some(body.clone());
        }

        for index in 0..body.participants.len() {
            let role = body.participants[index].role;
            let agent = self
                .specialists
                .get_specialist(role)
                .await
                .unwrap_or_else(|| AgentHandle::default_for(role));
            body.participants[index].agent = Some(agent);
            body.participants[index].status = ParticipantStatus::Ready;
        }

        handle.set_status(SessionStatus::Active);
        body.status = SessionStatus::Active;
        log::info!(
            "session {} started with {} participants",
            body.id,
            body.participants.len()
        );
        self.emit(CollaborationEvent::SessionStarted {
            session_id: body.id.clone(),
            participant_count: body.participants.len(),
            protocol: body.protocol,
        });
        Some(body.clone())
    }

    /// Active → Paused. A no-op in any other state.
    pub async fn pause_session(&self, session_id: &str) -> Option<Session> {
        self.transition(session_id, SessionStatus::Active, SessionStatus::Paused)
            .await
    }

    /// Paused → Active. A no-op in any other state.
    pub async fn resume_session(&self, session_id: &str) -> Option<Session> {
        self.transition(session_id, SessionStatus::Paused, SessionStatus::Active)
            .await
    }

    /// Cancel a non-terminal session. Idempotent and immediate; an in-flight
    /// agent invocation continues but its result is discarded.
    pub async fn cancel_session(&self, session_id: &str) -> Option<Session> {
        let handle = self.session_handle(session_id)?;
        {
            let mut status = handle.status.lock().unwrap();
            if !status.is_terminal() {
                *status = SessionStatus::Cancelled;
            }
        }
        log::info!("cancelled session {}", session_id);
        Some(self.snapshot(&handle).await)
    }

    /// End the session and produce its [`CollaborationResult`].
    ///
    /// A session that already reached consensus keeps that status; otherwise
    /// it becomes `Completed`, or `Failed` when `success` is `Some(false)`.
    pub async fn end_session(
        &self,
        session_id: &str,
        success: Option<bool>,
    ) -> Option<CollaborationResult> {
        let handle = self.session_handle(session_id)?;
        let mut body = handle.body.lock().await;
        body.status = handle.status();

        let final_status = if body.status == SessionStatus::ConsensusReached {
            SessionStatus::ConsensusReached
        } else if success == Some(false) {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        handle.set_status(final_status);
        body.status = final_status;

        let outcome = if final_status == SessionStatus::ConsensusReached {
            "Consensus reached".to_string()
        } else if let Some(decision) = body.context.decisions.last() {
            format!("Decided: {}", decision.description)
        } else if let Some(message) = body.messages.last() {
            message.content.chars().take(200).collect()
        } else {
            "Session completed".to_string()
        };

        let result = CollaborationResult {
            session_id: body.id.clone(),
            goal: body.goal.clone(),
            success: matches!(
                final_status,
                SessionStatus::Completed | SessionStatus::ConsensusReached
            ),
            outcome,
            decisions: body.context.decisions.clone(),
            artifacts: body.context.artifacts.clone(),
            total_turns: body.current_turn,
            message_count: body.messages.len(),
            messages_by_role: body.messages_by_role(),
            duration_ms: (Utc::now() - body.created_at).num_milliseconds().max(0) as u64,
        };

        self.emit(CollaborationEvent::SessionCompleted {
            session_id: body.id.clone(),
            total_turns: body.current_turn,
            message_count: body.messages.len(),
            decision_count: body.context.decisions.len(),
        });
        log::info!("session {} ended as {:?}", body.id, final_status);
        Some(result)
    }

    // ── Turn execution ───────────────────────────────────────────────────

    /// Execute one turn for the participant whose turn it is.
    ///
    /// Fails with a stable reason string when the session is unknown, not
    /// active, at its turn cap, has no current participant, or the
    /// participant has no agent bound. On success the agent's contribution
    /// is appended, the turn counter advances, and `MessageSent` then
    /// `TurnAdvanced` are emitted.
    pub async fn execute_turn(&self, session_id: &str, user_prompt: Option<&str>) -> TurnResult {
        let handle = match self.session_handle(session_id) {
            Some(handle) => handle,
            None => return TurnResult::failure("Session not found"),
        };
        let mut body = handle.body.lock().await;
        body.status = handle.status();
        self.take_turn(&handle, &mut body, MessageType::Contribution, user_prompt, None, None)
            .await
    }

    /// Execute exactly one turn per participant, unconditionally.
    pub async fn run_round(&self, session_id: &str) -> Vec<TurnResult> {
        let count = match self.get_session(session_id).await {
            Some(session) => session.participants.len(),
            None => return vec![TurnResult::failure("Session not found")],
        };
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            results.push(self.execute_turn(session_id, None).await);
        }
        results
    }

    /// Execute turns until `max_turns` is reached, a turn fails, or the
    /// predicate fires after observing the latest message. Returns the
    /// number of successful turns.
    pub async fn run_until<F>(&self, session_id: &str, max_turns: usize, stop: F) -> usize
    where
        F: Fn(&Session, &SessionMessage) -> bool + Send,
    {
        let mut executed = 0;
        for _ in 0..max_turns {
            let result = self.execute_turn(session_id, None).await;
            if !result.success {
                break;
            }
            executed += 1;
            if let (Some(session), Some(message)) = (&result.session, &result.message) {
                if stop(session, message) {
                    break;
                }
            }
        }
        executed
    }

    /// Start the session, run the protocol-specific loop for `max_rounds`,
    /// end it, and return the final result.
    pub async fn execute_session(
        &self,
        session_id: &str,
        max_rounds: usize,
    ) -> Result<CollaborationResult, CollaborationError> {
        let protocol = self
            .get_session(session_id)
            .await
            .map(|s| s.protocol)
            .ok_or_else(|| CollaborationError::SessionNotFound(session_id.to_string()))?;
        self.start_session(session_id).await;

        match protocol {
            Protocol::RoundRobin | Protocol::FreeForm => {
                let participant_count = self.participant_count(session_id).await;
                self.run_until(session_id, max_rounds * participant_count, |_, _| false)
                    .await;
            }
            Protocol::Debate => {
                self.run_until(session_id, 2 * max_rounds, |session, message| {
                    message.content.to_lowercase().contains("agree")
                        && session.messages.len() >= 4
                })
                .await;
            }
            Protocol::Consensus => {
                self.execute_consensus(session_id, max_rounds).await;
            }
            Protocol::Broadcast => {
                self.execute_broadcast(session_id).await;
            }
            Protocol::LeaderFollower => {
                self.execute_leader_follower(session_id, max_rounds).await;
            }
            Protocol::Voting => {
                self.execute_voting(session_id).await;
            }
        }

        self.end_session(session_id, None)
            .await
            .ok_or_else(|| CollaborationError::SessionNotFound(session_id.to_string()))
    }

    // ── Messages, context, consensus ─────────────────────────────────────

    /// Append a message directly (external orchestration or user injection).
    /// When the sender is a participant its message count is bumped.
    pub async fn send_message(
        &self,
        session_id: &str,
        sender_id: &str,
        role: AgentRole,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Option<SessionMessage> {
        let handle = self.session_handle(session_id)?;
        let mut body = handle.body.lock().await;
        let message = SessionMessage::new(&body.id, sender_id, role, message_type, content);
        body.messages.push(message.clone());
        if let Some(participant) = body.participants.iter_mut().find(|p| p.id == sender_id) {
            participant.message_count += 1;
        }
        self.emit(CollaborationEvent::MessageSent {
            session_id: body.id.clone(),
            message_id: message.id.clone(),
            sender_role: role,
            message_type,
        });
        Some(message)
    }

    /// Record a decision in the shared context and emit `DecisionMade`.
    pub async fn record_decision(
        &self,
        session_id: &str,
        description: impl Into<String>,
        rationale: impl Into<String>,
        by_role: AgentRole,
    ) -> Option<Decision> {
        let handle = self.session_handle(session_id)?;
        let decision = Decision {
            description: description.into(),
            rationale: rationale.into(),
            decided_by: by_role,
            decided_at: Utc::now(),
        };
        {
            let mut body = handle.body.lock().await;
            body.context.decisions.push(decision.clone());
        }
        self.emit(CollaborationEvent::DecisionMade {
            session_id: session_id.to_string(),
            description: decision.description.clone(),
            by_role,
        });
        Some(decision)
    }

    /// Record one participant's vote on the session's proposal.
    ///
    /// Creates the consensus state on first vote if absent, seeding the
    /// proposal from the most recent proposal-typed message (falling back to
    /// the last message). Emits `ConsensusReached` when the vote crosses the
    /// acceptance threshold.
    pub async fn record_vote(
        &self,
        session_id: &str,
        participant_id: &str,
        approve: bool,
        reason: Option<String>,
    ) -> Option<ConsensusStatus> {
        let handle = self.session_handle(session_id)?;
        let (participant_count, seed) = {
            let body = handle.body.lock().await;
            let seed = body
                .messages
                .iter()
                .rev()
                .find(|m| m.message_type == MessageType::Proposal)
                .or_else(|| body.messages.last())
                .map(|m| (m.id.clone(), m.content.clone()));
            (body.participants.len(), seed)
        };

        let (status, crossed) = {
            let mut consensus = self.consensus.write().unwrap();
            let state = consensus.entry(session_id.to_string()).or_insert_with(|| {
                match seed {
                    Some((id, content)) => ConsensusState::new(id, content),
                    None => ConsensusState::new(Uuid::new_v4().to_string(), String::new()),
                }
            });
            let before = state.status;
            state.record_vote(participant_id, approve, reason);
            let after = state.evaluate(participant_count, self.consensus_threshold);
            let crossed = (after == ConsensusStatus::Accepted && before != ConsensusStatus::Accepted)
                .then(|| (state.proposal.clone(), state.approval_percentage()));
            (after, crossed)
        };

        if let Some((proposal, approval_pct)) = crossed {
            self.emit(CollaborationEvent::ConsensusReached {
                session_id: session_id.to_string(),
                proposal,
                approval_pct,
            });
        }
        Some(status)
    }

    pub async fn add_artifact(
        &self,
        session_id: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        match self.session_handle(session_id) {
            Some(handle) => {
                let mut body = handle.body.lock().await;
                body.context.artifacts.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    pub async fn add_fact(&self, session_id: &str, fact: impl Into<String>) -> bool {
        match self.session_handle(session_id) {
            Some(handle) => {
                let mut body = handle.body.lock().await;
                body.context.facts.push(fact.into());
                true
            }
            None => false,
        }
    }

    pub async fn add_open_question(&self, session_id: &str, question: impl Into<String>) -> bool {
        match self.session_handle(session_id) {
            Some(handle) => {
                let mut body = handle.body.lock().await;
                body.context.open_questions.push(question.into());
                true
            }
            None => false,
        }
    }

    // ── Inspection ───────────────────────────────────────────────────────

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        let handle = self.session_handle(session_id)?;
        Some(self.snapshot(&handle).await)
    }

    pub async fn sessions(&self) -> Vec<Session> {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().unwrap().values().cloned().collect();
        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(self.snapshot(&handle).await);
        }
        sessions
    }

    pub fn get_consensus(&self, session_id: &str) -> Option<ConsensusState> {
        self.consensus.read().unwrap().get(session_id).cloned()
    }

    pub async fn stats(&self) -> CollaborationStats {
        let sessions = self.sessions().await;
        CollaborationStats {
            total_sessions: sessions.len(),
            active_sessions: sessions.iter().filter(|s| s.status.is_active()).count(),
            total_messages: sessions.iter().map(|s| s.messages.len()).sum(),
            total_decisions: sessions.iter().map(|s| s.context.decisions.len()).sum(),
        }
    }

    /// Drop every session and consensus state.
    pub fn clear_sessions(&self) {
        self.sessions.write().unwrap().clear();
        self.consensus.write().unwrap().clear();
    }

    // ── Listeners ────────────────────────────────────────────────────────

    pub fn add_listener(&self, listener: Arc<dyn CollaborationListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CollaborationListener>) -> bool {
        self.listeners.remove(listener)
    }

    fn emit(&self, event: CollaborationEvent) {
        for listener in self.listeners.snapshot() {
            deliver(|| listener.on_collaboration_event(&event));
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn session_handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    async fn snapshot(&self, handle: &SessionHandle) -> Session {
        let mut body = handle.body.lock().await;
        body.status = handle.status();
        body.clone()
    }

    async fn participant_count(&self, session_id: &str) -> usize {
        self.get_session(session_id)
            .await
            .map(|s| s.participants.len())
            .unwrap_or(0)
    }

    async fn transition(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Option<Session> {
        let handle = self.session_handle(session_id)?;
        {
            let mut status = handle.status.lock().unwrap();
            if *status == from {
                *status = to;
            }
        }
        Some(self.snapshot(&handle).await)
    }

    /// One turn for one participant: assemble the prompt, invoke the agent,
    /// append the message, advance the turn counter. `participant_override`
    /// lets protocol loops speak out of rotation.
    async fn take_turn(
        &self,
        handle: &SessionHandle,
        body: &mut Session,
        message_type: MessageType,
        user_prompt: Option<&str>,
        extra_instruction: Option<&str>,
        participant_override: Option<usize>,
    ) -> TurnResult {
        if !body.status.is_active() {
            return TurnResult::failure("Session is not active");
        }
        if body.current_turn >= body.max_turns {
            return TurnResult::failure("Max turns reached");
        }
        if body.participants.is_empty() {
            return TurnResult::failure("No current participant");
        }
        let index = participant_override.unwrap_or(body.current_turn % body.participants.len());
        let participant = match body.participants.get(index) {
            Some(participant) => participant.clone(),
            None => return TurnResult::failure("No current participant"),
        };
        let agent = match &participant.agent {
            Some(agent) => agent.clone(),
            None => return TurnResult::failure("Participant has no agent assigned"),
        };

        let mut prompt = assemble_prompt(body, &participant, user_prompt);
        if let Some(extra) = extra_instruction {
            prompt.push('\n');
            prompt.push_str(extra);
        }

        body.participants[index].status = ParticipantStatus::Speaking;
        let session_snapshot = body.clone();
        let outcome = self.invoker.invoke(&agent, &prompt, &session_snapshot).await;
        body.participants[index].status = ParticipantStatus::Ready;

        let text = match outcome {
            Ok(text) => text,
            Err(e) => {
                log::error!("agent {} failed in session {}: {}", agent.id, body.id, e);
                return TurnResult::failure(e.to_string());
            }
        };

        if handle.status().is_terminal() {
            // Cancelled while the agent was working; discard the result.
            body.status = handle.status();
            return TurnResult::failure("Session is not active");
        }

        let message =
            SessionMessage::new(&body.id, &participant.id, participant.role, message_type, text);
        body.messages.push(message.clone());
        body.participants[index].message_count += 1;
        body.current_turn += 1;
        let next_role = body
            .current_participant()
            .map(|p| p.role)
            .unwrap_or(participant.role);

        self.emit(CollaborationEvent::MessageSent {
            session_id: body.id.clone(),
            message_id: message.id.clone(),
            sender_role: participant.role,
            message_type,
        });
        self.emit(CollaborationEvent::TurnAdvanced {
            session_id: body.id.clone(),
            new_turn: body.current_turn,
            next_role,
        });

        TurnResult::success(message, body.clone())
    }

    /// Speak as a specific participant, out of rotation.
    async fn speak(
        &self,
        session_id: &str,
        participant_index: usize,
        message_type: MessageType,
        extra_instruction: Option<&str>,
    ) -> TurnResult {
        let handle = match self.session_handle(session_id) {
            Some(handle) => handle,
            None => return TurnResult::failure("Session not found"),
        };
        let mut body = handle.body.lock().await;
        body.status = handle.status();
        self.take_turn(
            &handle,
            &mut body,
            message_type,
            None,
            extra_instruction,
            Some(participant_index),
        )
        .await
    }

    /// Consensus protocol: a proposal round, then voting rounds until the
    /// consensus state reports acceptance.
    async fn execute_consensus(&self, session_id: &str, max_rounds: usize) {
        self.run_round(session_id).await;

        // Seize the last message as the proposal.
        let seed = self
            .get_session(session_id)
            .await
            .and_then(|s| s.messages.last().map(|m| (m.id.clone(), m.content.clone())));
        if let Some((id, content)) = seed {
            self.consensus
                .write()
                .unwrap()
                .entry(session_id.to_string())
                .or_insert_with(|| ConsensusState::new(id, content));
        }

        for _ in 1..max_rounds {
            self.run_round(session_id).await;
            let accepted = self
                .get_consensus(session_id)
                .map(|c| (c.status, c.approval_percentage(), c.proposal));
            if let Some((ConsensusStatus::Accepted, approval_pct, proposal)) = accepted {
                if let Some(handle) = self.session_handle(session_id) {
                    handle.set_status(SessionStatus::ConsensusReached);
                }
                self.emit(CollaborationEvent::ConsensusReached {
                    session_id: session_id.to_string(),
                    proposal,
                    approval_pct,
                });
                break;
            }
        }
    }

    /// Broadcast protocol: every participant answers once, all within a
    /// single turn; the counter advances once at the end.
    async fn execute_broadcast(&self, session_id: &str) {
        let handle = match self.session_handle(session_id) {
            Some(handle) => handle,
            None => return,
        };
        let mut body = handle.body.lock().await;
        body.status = handle.status();
        if !body.status.is_active() || body.current_turn >= body.max_turns {
            return;
        }

        for index in 0..body.participants.len() {
            let participant = body.participants[index].clone();
            let agent = match &participant.agent {
                Some(agent) => agent.clone(),
                None => continue,
            };
            let prompt = assemble_prompt(&body, &participant, None);
            body.participants[index].status = ParticipantStatus::Speaking;
            let session_snapshot = body.clone();
            let outcome = self.invoker.invoke(&agent, &prompt, &session_snapshot).await;
            body.participants[index].status = ParticipantStatus::Ready;
            match outcome {
                Ok(text) => {
                    let message = SessionMessage::new(
                        &body.id,
                        &participant.id,
                        participant.role,
                        MessageType::Contribution,
                        text,
                    );
                    body.messages.push(message.clone());
                    body.participants[index].message_count += 1;
                    self.emit(CollaborationEvent::MessageSent {
                        session_id: body.id.clone(),
                        message_id: message.id,
                        sender_role: participant.role,
                        message_type: MessageType::Contribution,
                    });
                }
                Err(e) => {
                    log::error!("agent {} failed in session {}: {}", agent.id, body.id, e);
                }
            }
        }

        body.current_turn += 1;
        let next_role = body
            .current_participant()
            .map(|p| p.role)
            .unwrap_or(AgentRole::Generalist);
        self.emit(CollaborationEvent::TurnAdvanced {
            session_id: body.id.clone(),
            new_turn: body.current_turn,
            next_role,
        });
    }

    /// Leader-follower protocol: per round the leader (participant 0)
    /// directs, each follower responds, the leader summarizes. Breaks as
    /// soon as any turn fails.
    async fn execute_leader_follower(&self, session_id: &str, max_rounds: usize) {
        let follower_count = self.participant_count(session_id).await.saturating_sub(1);
        'rounds: for _ in 0..max_rounds {
            let lead = self
                .speak(
                    session_id,
                    0,
                    MessageType::Contribution,
                    Some("Direct the team: set the focus for this round."),
                )
                .await;
            if !lead.success {
                break;
            }
            for follower in 1..=follower_count {
                let turn = self
                    .speak(session_id, follower, MessageType::Contribution, None)
                    .await;
                if !turn.success {
                    break 'rounds;
                }
            }
            let summary = self
                .speak(
                    session_id,
                    0,
                    MessageType::Contribution,
                    Some("Summarize this round and the team's progress."),
                )
                .await;
            if !summary.success {
                break;
            }
        }
    }

    /// Voting protocol: a proposal round, then one approve vote per
    /// non-proposer referencing the first proposal.
    async fn execute_voting(&self, session_id: &str) {
        let count = self.participant_count(session_id).await;
        for index in 0..count {
            let turn = self
                .speak(
                    session_id,
                    index,
                    MessageType::Proposal,
                    Some("State your proposal for the goal."),
                )
                .await;
            if !turn.success {
                return;
            }
        }

        let proposal = self.get_session(session_id).await.and_then(|s| {
            s.messages
                .iter()
                .find(|m| m.message_type == MessageType::Proposal)
                .cloned()
        });
        let Some(proposal) = proposal else { return };

        self.consensus
            .write()
            .unwrap()
            .entry(session_id.to_string())
            .or_insert_with(|| ConsensusState::new(proposal.id.clone(), proposal.content.clone()));

        let voters: Vec<Participant> = match self.get_session(session_id).await {
            Some(session) => session
                .participants
                .iter()
                .filter(|p| p.id != proposal.sender_id)
                .cloned()
                .collect(),
            None => return,
        };
        for voter in voters {
            if let Some(handle) = self.session_handle(session_id) {
                let mut body = handle.body.lock().await;
                let message = SessionMessage::new(
                    &body.id,
                    &voter.id,
                    voter.role,
                    MessageType::Vote,
                    "approve",
                )
                .with_reply_to(&proposal.id);
                body.messages.push(message.clone());
                if let Some(p) = body.participants.iter_mut().find(|p| p.id == voter.id) {
                    p.message_count += 1;
                }
                self.emit(CollaborationEvent::MessageSent {
                    session_id: body.id.clone(),
                    message_id: message.id,
                    sender_role: voter.role,
                    message_type: MessageType::Vote,
                });
            }
            self.record_vote(session_id, &voter.id, true, None).await;
        }
    }
}

/// Deterministic turn prompt: session name, goal, the speaking role and the
/// protocol, the last five messages (sender role, first 500 chars), shared
/// facts, the optional user prompt, and a closing instruction.
fn assemble_prompt(session: &Session, participant: &Participant, user_prompt: Option<&str>) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Collaboration session: {}\n", session.name));
    prompt.push_str(&format!("Goal: {}\n", session.goal));
    prompt.push_str(&format!(
        "You are the {} participant. Protocol: {}.\n",
        participant.role, session.protocol
    ));

    let skip = session.messages.len().saturating_sub(5);
    let recent = &session.messages[skip..];
    if !recent.is_empty() {
        prompt.push_str("\nRecent discussion:\n");
        for message in recent {
            let content: String = message.content.chars().take(500).collect();
            prompt.push_str(&format!("[{}]: {}\n", message.sender_role, content));
        }
    }

    if !session.context.facts.is_empty() {
        prompt.push_str("\nKnown facts:\n");
        for fact in &session.context.facts {
            prompt.push_str(&format!("- {}\n", fact));
        }
    }

    if let Some(user_prompt) = user_prompt {
        prompt.push_str(&format!("\n{}\n", user_prompt));
    }

    prompt.push_str(&format!(
        "\nProvide your contribution as the {}.",
        participant.role
    ));
    prompt
}
