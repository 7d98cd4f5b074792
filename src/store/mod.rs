//! Storage interfaces for the scheduler core.
//!
//! All coordination between the scheduler loop and the worker pool
//! happens through a shared durable store; there is no direct wire
//! protocol between processes. The interface is split by concern and
//! recombined in the [`Store`] supertrait, which also carries the two
//! propagation operations that join across concerns.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{Agent, AgentId, Job, JobId, JobKind, Link, Message, MessageId};
use crate::schedule::AgentSchedule;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One row of the propagation join: a message newly eligible for
/// delivery to a receiver. Carries both agent types so the caller can
/// skip rows whose types are not registered without extra lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryCandidate {
    pub source_id: AgentId,
    pub source_type: String,
    pub receiver_id: AgentId,
    pub receiver_type: String,
    pub message_id: MessageId,
}

/// Read/write access to the agent rows the core touches.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>>;

    /// Ids of enabled agents on the given named schedule.
    ///
    /// Disabled and deactivated agents are excluded here, at the
    /// source, so they never receive scheduled check jobs.
    async fn agents_due_for_schedule(&self, schedule: AgentSchedule) -> StoreResult<Vec<AgentId>>;

    /// Stamp the last scheduled-check attempt, success or failure.
    async fn mark_agent_checked(&self, id: AgentId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Stamp the last delivery attempt, success or failure.
    async fn mark_agent_received(&self, id: AgentId, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Append-only message log keyed by producing agent.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, returning its monotonically increasing id.
    ///
    /// Invoked by agent logic through the execution context, not by
    /// the core itself.
    async fn append_message(
        &self,
        agent_id: AgentId,
        payload: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<MessageId>;

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<Message>>;

    /// Delete up to `batch` messages whose expiry has passed.
    ///
    /// Returns the number deleted; callers loop until a short batch.
    /// Only already-expired rows are touched, so this is safe to run
    /// concurrently with propagation.
    async fn delete_expired_messages(&self, now: DateTime<Utc>, batch: i64) -> StoreResult<u64>;
}

/// Read access to the directed agent->agent subscription edges.
#[async_trait]
pub trait LinkGraph: Send + Sync {
    async fn links(&self) -> StoreResult<Vec<Link>>;
}

/// The agent lock table: at-most-one concurrent execution per agent.
#[async_trait]
pub trait AgentLockStore: Send + Sync {
    /// Atomically create-or-claim the lock row for the agent.
    ///
    /// Succeeds if the lock is free or the current hold is older than
    /// `stale_after` (crash recovery). Returns false if actively held.
    async fn try_acquire_lock(
        &self,
        agent_id: AgentId,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StoreResult<bool>;

    /// Clear the lock. Idempotent: releasing a free lock is a no-op.
    async fn release_lock(&self, agent_id: AgentId) -> StoreResult<()>;
}

/// Durable, retryable job queue decoupling scheduling from execution.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue_job(
        &self,
        kind: JobKind,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> StoreResult<JobId>;

    /// Optimistically claim the earliest due, unclaimed, unfailed job.
    ///
    /// A claim older than `claim_timeout` is treated as abandoned and
    /// may be re-claimed by another worker.
    async fn claim_next_job(
        &self,
        worker: Uuid,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> StoreResult<Option<Job>>;

    /// Delete a successfully handled job.
    async fn complete_job(&self, id: JobId) -> StoreResult<()>;

    /// Record a failed attempt and reschedule the job at `run_at`.
    async fn retry_job(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> StoreResult<()>;

    /// Record a final failed attempt; the job is retained with
    /// `failed_at` set for operator visibility and never retried.
    async fn mark_job_failed(&self, id: JobId, error: &str) -> StoreResult<()>;

    /// Put a claimed job back without counting an attempt, to run at
    /// `run_at`. Used when the agent lock is contended - a transient
    /// condition, not a handler failure.
    async fn release_job(&self, id: JobId, run_at: DateTime<Utc>) -> StoreResult<()>;

    /// Jobs on the queue that have not permanently failed (pending or
    /// claimed).
    async fn count_pending_jobs(&self, queue: &str) -> StoreResult<i64>;

    /// Delete all but the most recent `keep` failed jobs.
    async fn prune_failed_jobs(&self, keep: i64) -> StoreResult<u64>;
}

/// The full store surface, plus the propagation operations that join
/// agents, links, messages, cursors, and the queue.
#[async_trait]
pub trait Store:
    AgentRegistry + MessageStore + LinkGraph + AgentLockStore + DispatchQueue
{
    /// The propagation join: every (receiver, message) pair where the
    /// message's owner is the link's source, the message id is strictly
    /// greater than both the link's `message_id_at_creation` and the
    /// receiver's cursor (or the cursor is unset), and the receiver is
    /// enabled.
    async fn delivery_candidates(&self) -> StoreResult<Vec<DeliveryCandidate>>;

    /// Advance the receiver's cursor to `cursor` and enqueue one
    /// delivery job per message id, inside one transaction boundary.
    ///
    /// The cursor only ever moves forward; a smaller value is ignored.
    /// Cursor-advance is ordered before the enqueues, preserving the
    /// at-most-once delivery trade-off.
    async fn dispatch_deliveries(
        &self,
        receiver_id: AgentId,
        cursor: MessageId,
        message_ids: &[MessageId],
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> StoreResult<()>;
}
