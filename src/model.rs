//! Core data model shared by the scheduler, the propagation algorithm,
//! the dispatch queue, and the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schedule::AgentSchedule;

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub i64);

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing, globally unique message identifier.
///
/// This is the ordering key for propagation cursors, so it is a
/// sequence id rather than a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a dispatch queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The subset of an agent the core reads and mutates.
///
/// Agents are created and updated by the (out-of-scope) management
/// layer; the core only reads them, advances `last_checked_message_id`,
/// and stamps the bookkeeping timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Registered type identifier, resolved through the type registry.
    pub type_id: String,
    pub name: String,
    pub schedule: AgentSchedule,
    pub disabled: bool,
    pub deactivated: bool,
    /// Highest message id already dispatched to this agent for delivery.
    pub last_checked_message_id: Option<MessageId>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_receive_at: Option<DateTime<Utc>>,
    /// Opaque per-agent options, interpreted only by the agent handler.
    pub options: Value,
}

impl Agent {
    /// Whether the agent participates in scheduling and propagation.
    pub fn is_enabled(&self) -> bool {
        !self.disabled && !self.deactivated
    }
}

/// An immutable, ordered record produced by one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub agent_id: AgentId,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Directed subscription edge from a source agent to a receiver agent.
///
/// `message_id_at_creation` records the message-store cursor at the
/// moment the link was formed; only messages strictly after it are
/// eligible for delivery so pre-existing backlog is never replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub source_id: AgentId,
    pub receiver_id: AgentId,
    pub message_id_at_creation: MessageId,
}

/// What a dispatched job asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Run the agent's scheduled check.
    AgentCheck { agent_id: AgentId },
    /// Deliver one message to the agent.
    AgentReceive {
        agent_id: AgentId,
        message_id: MessageId,
    },
}

impl JobKind {
    pub fn agent_id(&self) -> AgentId {
        match self {
            JobKind::AgentCheck { agent_id } => *agent_id,
            JobKind::AgentReceive { agent_id, .. } => *agent_id,
        }
    }

    /// Queue name the job is enqueued on.
    ///
    /// Deliveries live on their own queue so the propagation tick can
    /// check for an in-flight batch without counting check jobs.
    pub fn queue(&self) -> &'static str {
        match self {
            JobKind::AgentCheck { .. } => queues::CHECKS,
            JobKind::AgentReceive { .. } => queues::PROPAGATION,
        }
    }
}

/// Dispatch queue names.
pub mod queues {
    pub const CHECKS: &str = "checks";
    pub const PROPAGATION: &str = "propagation";
}

/// A durable entry on the dispatch queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub queue: String,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Queue-level claim, distinct from the agent lock.
    pub locked_by: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A job is pending while it has not permanently failed.
    pub fn is_pending(&self) -> bool {
        self.failed_at.is_none()
    }
}
