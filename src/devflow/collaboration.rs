//! Collaboration session data model.
//!
//! A [`Session`] groups role-bound [`Participant`]s around a goal and a
//! turn-taking [`Protocol`]. The
//! [`CollaborationOrchestrator`](crate::CollaborationOrchestrator) advances
//! sessions turn by turn, appending [`SessionMessage`]s and accumulating
//! [`SharedContext`] (artifacts, facts, decisions, open questions) plus a
//! per-session [`ConsensusState`] when proposals are voted on.
//!
//! Sessions handed to callers are value snapshots; the orchestrator owns the
//! authoritative state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use uuid::Uuid;

/// Turn-taking policy governing a session. Each protocol has a distinct
/// execution loop in
/// [`execute_session`](crate::CollaborationOrchestrator::execute_session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Participants speak in fixed rotation for a set number of rounds.
    RoundRobin,
    /// Two participants argue until one concedes ("agree") or rounds run out.
    Debate,
    /// A proposal round followed by voting rounds until consensus.
    Consensus,
    /// Every participant answers once, within a single turn.
    Broadcast,
    /// Participant 0 directs; followers respond; the leader summarizes.
    LeaderFollower,
    /// A proposal round followed by one vote message per non-proposer.
    Voting,
    /// Unstructured rotation, like round-robin without any stop condition.
    FreeForm,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::RoundRobin => "round_robin",
            Protocol::Debate => "debate",
            Protocol::Consensus => "consensus",
            Protocol::Broadcast => "broadcast",
            Protocol::LeaderFollower => "leader_follower",
            Protocol::Voting => "voting",
            Protocol::FreeForm => "free_form",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specialization of a participant's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Implementer,
    Reviewer,
    Tester,
    Security,
    Documentation,
    Generalist,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Architect => "architect",
            AgentRole::Implementer => "implementer",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Tester => "tester",
            AgentRole::Security => "security",
            AgentRole::Documentation => "documentation",
            AgentRole::Generalist => "generalist",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque handle to a role-specialized agent, bound to a participant when the
/// session starts. The handle is owned by the external specialist service;
/// the orchestrator only passes it back through the
/// [`AgentInvoker`](crate::AgentInvoker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHandle {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
}

impl AgentHandle {
    /// Default handle synthesized when the specialist service has no agent
    /// for a role.
    pub fn default_for(role: AgentRole) -> Self {
        Self {
            id: format!("agent-{}", role),
            name: format!("Default {}", role),
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    Ready,
    Speaking,
    Waiting,
    Blocked,
    Done,
}

/// A role-bound seat in a session. Exactly one agent may be bound at a time.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub role: AgentRole,
    pub agent: Option<AgentHandle>,
    pub status: ParticipantStatus,
    pub message_count: usize,
}

impl Participant {
    pub fn new(role: AgentRole) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            agent: None,
            status: ParticipantStatus::Ready,
            message_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Contribution,
    Proposal,
    Question,
    Answer,
    Critique,
    Vote,
    Decision,
    Info,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Contribution => "contribution",
            MessageType::Proposal => "proposal",
            MessageType::Question => "question",
            MessageType::Answer => "answer",
            MessageType::Critique => "critique",
            MessageType::Vote => "vote",
            MessageType::Decision => "decision",
            MessageType::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Code,
    Document,
    Result,
}

/// Auxiliary content carried by a message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub name: String,
    pub content: String,
    pub path: Option<String>,
}

/// A single entry in a session's message log.
#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    pub sender_role: AgentRole,
    pub message_type: MessageType,
    pub content: String,
    pub reply_to: Option<String>,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub mentions: Vec<AgentRole>,
}

impl SessionMessage {
    pub fn new(
        session_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_role: AgentRole,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            sender_id: sender_id.into(),
            sender_role,
            message_type,
            content: content.into(),
            reply_to: None,
            attachments: Vec::new(),
            created_at: Utc::now(),
            mentions: Vec::new(),
        }
    }

    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_mention(mut self, role: AgentRole) -> Self {
        self.mentions.push(role);
        self
    }
}

/// A recorded decision in the shared context.
#[derive(Debug, Clone)]
pub struct Decision {
    pub description: String,
    pub rationale: String,
    pub decided_by: AgentRole,
    pub decided_at: DateTime<Utc>,
}

/// Context accumulated across a session: named artifacts, flat facts,
/// decisions, and open questions.
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    pub artifacts: HashMap<String, String>,
    pub facts: Vec<String>,
    pub decisions: Vec<Decision>,
    pub open_questions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A single recorded vote.
#[derive(Debug, Clone)]
pub struct Vote {
    pub approve: bool,
    pub reason: Option<String>,
}

/// Voting state for one proposal.
///
/// The state is created either by the consensus protocol (seizing the last
/// proposal-round message as the proposal) or lazily on the first
/// [`record_vote`](crate::CollaborationOrchestrator::record_vote) for a
/// session.
#[derive(Debug, Clone)]
pub struct ConsensusState {
    pub proposal_id: String,
    pub proposal: String,
    votes: HashMap<String, Vote>,
    pub status: ConsensusStatus,
}

impl ConsensusState {
    pub fn new(proposal_id: impl Into<String>, proposal: impl Into<String>) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            proposal: proposal.into(),
            votes: HashMap::new(),
            status: ConsensusStatus::Pending,
        }
    }

    /// Record (or replace) one participant's vote.
    pub fn record_vote(&mut self, participant_id: impl Into<String>, approve: bool, reason: Option<String>) {
        self.votes.insert(participant_id.into(), Vote { approve, reason });
    }

    pub fn total_votes(&self) -> usize {
        self.votes.len()
    }

    pub fn approval_count(&self) -> usize {
        self.votes.values().filter(|v| v.approve).count()
    }

    pub fn rejection_count(&self) -> usize {
        self.votes.values().filter(|v| !v.approve).count()
    }

    /// Fraction of recorded votes that approve, 0 when nobody voted yet.
    pub fn approval_percentage(&self) -> f64 {
        if self.votes.is_empty() {
            0.0
        } else {
            self.approval_count() as f64 / self.total_votes() as f64
        }
    }

    pub fn votes(&self) -> &HashMap<String, Vote> {
        &self.votes
    }

    /// Recompute and store the status for the given electorate size and
    /// acceptance threshold.
    ///
    /// Accepted once everyone voted and the approval fraction reaches the
    /// threshold; rejected as soon as enough rejections arrive that
    /// acceptance has become arithmetically impossible; pending otherwise.
    pub fn evaluate(&mut self, participant_count: usize, threshold: f64) -> ConsensusStatus {
        let needed = (participant_count as f64 * threshold).ceil() as usize;
        let status = if self.total_votes() >= participant_count
            && self.approval_percentage() >= threshold
        {
            ConsensusStatus::Accepted
        } else if self.rejection_count() > participant_count.saturating_sub(needed) {
            ConsensusStatus::Rejected
        } else {
            ConsensusStatus::Pending
        };
        self.status = status;
        status
    }
}

/// Lifecycle status of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Paused,
    WaitingForResponse,
    ConsensusReached,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::WaitingForResponse)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

/// A collaboration session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub goal: String,
    pub protocol: Protocol,
    pub participants: Vec<Participant>,
    pub context: SharedContext,
    pub messages: Vec<SessionMessage>,
    pub status: SessionStatus,
    pub current_turn: usize,
    pub max_turns: usize,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        goal: impl Into<String>,
        roles: Vec<AgentRole>,
        protocol: Protocol,
        max_turns: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            goal: goal.into(),
            protocol,
            participants: roles.into_iter().map(Participant::new).collect(),
            context: SharedContext::default(),
            messages: Vec::new(),
            status: SessionStatus::Created,
            current_turn: 0,
            max_turns,
            created_at: Utc::now(),
        }
    }

    /// The participant whose turn it is, rotating through the seats in
    /// declaration order.
    pub fn current_participant(&self) -> Option<&Participant> {
        if self.participants.is_empty() {
            None
        } else {
            self.participants.get(self.current_turn % self.participants.len())
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn last_message(&self) -> Option<&SessionMessage> {
        self.messages.last()
    }

    /// Message counts keyed by role name.
    pub fn messages_by_role(&self) -> HashMap<String, usize> {
        self.participants
            .iter()
            .map(|p| (p.role.to_string(), p.message_count))
            .collect()
    }
}

/// Outcome of one [`execute_turn`](crate::CollaborationOrchestrator::execute_turn)
/// call. Failure reasons are stable strings callers can match on.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub success: bool,
    pub message: Option<SessionMessage>,
    pub session: Option<Session>,
    pub error: Option<String>,
}

impl TurnResult {
    pub fn success(message: SessionMessage, session: Session) -> Self {
        Self {
            success: true,
            message: Some(message),
            session: Some(session),
            error: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            session: None,
            error: Some(reason.into()),
        }
    }
}

/// Final summary produced by
/// [`end_session`](crate::CollaborationOrchestrator::end_session).
#[derive(Debug, Clone)]
pub struct CollaborationResult {
    pub session_id: String,
    pub goal: String,
    pub success: bool,
    pub outcome: String,
    pub decisions: Vec<Decision>,
    pub artifacts: HashMap<String, String>,
    pub total_turns: usize,
    pub message_count: usize,
    pub messages_by_role: HashMap<String, usize>,
    pub duration_ms: u64,
}

/// Errors surfaced by session orchestration. Per-turn problems are reported
/// through [`TurnResult`] instead.
#[derive(Debug, Clone)]
pub enum CollaborationError {
    SessionNotFound(String),
    ExecutionFailed(String),
}

impl fmt::Display for CollaborationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollaborationError::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            CollaborationError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
        }
    }
}

impl Error for CollaborationError {}
