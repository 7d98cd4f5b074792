//! In-memory store for tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{
    AgentLockStore, AgentRegistry, DeliveryCandidate, DispatchQueue, LinkGraph, MessageStore,
    Store, StoreError, StoreResult,
};
use crate::model::{queues, Agent, AgentId, Job, JobId, JobKind, Link, Message, MessageId};
use crate::schedule::AgentSchedule;

#[derive(Default)]
struct Inner {
    agents: HashMap<AgentId, Agent>,
    messages: BTreeMap<MessageId, Message>,
    links: Vec<Link>,
    locks: HashMap<AgentId, Option<DateTime<Utc>>>,
    jobs: BTreeMap<JobId, Job>,
    next_agent_id: i64,
    next_message_id: i64,
    next_job_id: i64,
}

/// Store backed by process memory. Single mutex over all tables, so
/// every trait operation is atomic the way a database transaction is.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }

    /// Insert a new agent row (stand-in for the out-of-scope
    /// management layer).
    pub fn create_agent(
        &self,
        type_id: &str,
        name: &str,
        schedule: AgentSchedule,
    ) -> Agent {
        let mut inner = self.lock();
        inner.next_agent_id += 1;
        let agent = Agent {
            id: AgentId(inner.next_agent_id),
            type_id: type_id.to_string(),
            name: name.to_string(),
            schedule,
            disabled: false,
            deactivated: false,
            last_checked_message_id: None,
            last_check_at: None,
            last_receive_at: None,
            options: Value::Object(Default::default()),
        };
        inner.agents.insert(agent.id, agent.clone());
        agent
    }

    /// Replace an agent row wholesale.
    pub fn update_agent(&self, agent: Agent) {
        self.lock().agents.insert(agent.id, agent);
    }

    /// Create a link, recording the message-store cursor at creation
    /// time so pre-existing backlog is never delivered.
    pub fn create_link(&self, source_id: AgentId, receiver_id: AgentId) -> Link {
        let mut inner = self.lock();
        let link = Link {
            source_id,
            receiver_id,
            message_id_at_creation: MessageId(inner.next_message_id),
        };
        inner.links.retain(|existing| {
            !(existing.source_id == source_id && existing.receiver_id == receiver_id)
        });
        inner.links.push(link);
        link
    }

    /// Create a link with an explicit creation cursor, for scenarios
    /// that need a specific backlog boundary.
    pub fn create_link_at(
        &self,
        source_id: AgentId,
        receiver_id: AgentId,
        message_id_at_creation: MessageId,
    ) -> Link {
        let mut inner = self.lock();
        let link = Link {
            source_id,
            receiver_id,
            message_id_at_creation,
        };
        inner.links.retain(|existing| {
            !(existing.source_id == source_id && existing.receiver_id == receiver_id)
        });
        inner.links.push(link);
        link
    }

    pub fn jobs_snapshot(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn lock_state(&self, agent_id: AgentId) -> Option<DateTime<Utc>> {
        self.lock().locks.get(&agent_id).copied().flatten()
    }
}

#[async_trait]
impl AgentRegistry for MemoryStore {
    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>> {
        Ok(self.lock().agents.get(&id).cloned())
    }

    async fn agents_due_for_schedule(&self, schedule: AgentSchedule) -> StoreResult<Vec<AgentId>> {
        let inner = self.lock();
        let mut ids: Vec<AgentId> = inner
            .agents
            .values()
            .filter(|agent| agent.schedule == schedule && agent.is_enabled())
            .map(|agent| agent.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn mark_agent_checked(&self, id: AgentId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let agent = inner
            .agents
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))?;
        agent.last_check_at = Some(at);
        Ok(())
    }

    async fn mark_agent_received(&self, id: AgentId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let agent = inner
            .agents
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {id}")))?;
        agent.last_receive_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(
        &self,
        agent_id: AgentId,
        payload: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<MessageId> {
        let mut inner = self.lock();
        inner.next_message_id += 1;
        let id = MessageId(inner.next_message_id);
        inner.messages.insert(
            id,
            Message {
                id,
                agent_id,
                payload,
                created_at: Utc::now(),
                expires_at,
            },
        );
        Ok(id)
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        Ok(self.lock().messages.get(&id).cloned())
    }

    async fn delete_expired_messages(&self, now: DateTime<Utc>, batch: i64) -> StoreResult<u64> {
        let mut inner = self.lock();
        let expired: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|message| message.expires_at.is_some_and(|at| at <= now))
            .map(|message| message.id)
            .take(batch.max(0) as usize)
            .collect();
        for id in &expired {
            inner.messages.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl LinkGraph for MemoryStore {
    async fn links(&self) -> StoreResult<Vec<Link>> {
        Ok(self.lock().links.clone())
    }
}

#[async_trait]
impl AgentLockStore for MemoryStore {
    async fn try_acquire_lock(
        &self,
        agent_id: AgentId,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let slot = inner.locks.entry(agent_id).or_insert(None);
        match *slot {
            None => {
                *slot = Some(now);
                Ok(true)
            }
            Some(locked_at) if now - locked_at > stale_after => {
                // Abandoned hold: forced reclaim.
                *slot = Some(now);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn release_lock(&self, agent_id: AgentId) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some(slot) = inner.locks.get_mut(&agent_id) {
            *slot = None;
        }
        Ok(())
    }
}

impl Inner {
    fn insert_job(&mut self, kind: JobKind, run_at: DateTime<Utc>, max_attempts: i32) -> JobId {
        self.next_job_id += 1;
        let id = JobId(self.next_job_id);
        self.jobs.insert(
            id,
            Job {
                id,
                kind,
                queue: kind.queue().to_string(),
                priority: 0,
                run_at,
                attempts: 0,
                max_attempts,
                last_error: None,
                failed_at: None,
                locked_by: None,
                locked_at: None,
                created_at: Utc::now(),
            },
        );
        id
    }
}

#[async_trait]
impl DispatchQueue for MemoryStore {
    async fn enqueue_job(
        &self,
        kind: JobKind,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> StoreResult<JobId> {
        Ok(self.lock().insert_job(kind, run_at, max_attempts))
    }

    async fn claim_next_job(
        &self,
        worker: Uuid,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> StoreResult<Option<Job>> {
        let mut inner = self.lock();
        let claimable = inner
            .jobs
            .values()
            .filter(|job| {
                job.is_pending()
                    && job.run_at <= now
                    && match job.locked_at {
                        None => true,
                        Some(locked_at) => now - locked_at > claim_timeout,
                    }
            })
            .min_by_key(|job| (job.priority, job.run_at, job.id))
            .map(|job| job.id);
        let Some(id) = claimable else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).expect("claimable job vanished");
        job.locked_by = Some(worker);
        job.locked_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, id: JobId) -> StoreResult<()> {
        self.lock().jobs.remove(&id);
        Ok(())
    }

    async fn retry_job(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.run_at = run_at;
        job.locked_by = None;
        job.locked_at = None;
        Ok(())
    }

    async fn mark_job_failed(&self, id: JobId, error: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        job.failed_at = Some(Utc::now());
        job.locked_by = None;
        job.locked_at = None;
        Ok(())
    }

    async fn release_job(&self, id: JobId, run_at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job.run_at = run_at;
        job.locked_by = None;
        job.locked_at = None;
        Ok(())
    }

    async fn count_pending_jobs(&self, queue: &str) -> StoreResult<i64> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_pending())
            .count() as i64)
    }

    async fn prune_failed_jobs(&self, keep: i64) -> StoreResult<u64> {
        let mut inner = self.lock();
        let mut failed: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter_map(|job| job.failed_at.map(|at| (at, job.id)))
            .collect();
        // Newest first; everything past `keep` goes.
        failed.sort_by(|a, b| b.cmp(a));
        let doomed: Vec<JobId> = failed
            .into_iter()
            .skip(keep.max(0) as usize)
            .map(|(_, id)| id)
            .collect();
        for id in &doomed {
            inner.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn delivery_candidates(&self) -> StoreResult<Vec<DeliveryCandidate>> {
        let inner = self.lock();
        let mut candidates = Vec::new();
        for link in &inner.links {
            let Some(source) = inner.agents.get(&link.source_id) else {
                continue;
            };
            let Some(receiver) = inner.agents.get(&link.receiver_id) else {
                continue;
            };
            if !receiver.is_enabled() {
                continue;
            }
            let floor = match receiver.last_checked_message_id {
                Some(cursor) => link.message_id_at_creation.max(cursor),
                None => link.message_id_at_creation,
            };
            for message in inner.messages.values() {
                if message.agent_id == link.source_id && message.id > floor {
                    candidates.push(DeliveryCandidate {
                        source_id: source.id,
                        source_type: source.type_id.clone(),
                        receiver_id: receiver.id,
                        receiver_type: receiver.type_id.clone(),
                        message_id: message.id,
                    });
                }
            }
        }
        Ok(candidates)
    }

    async fn dispatch_deliveries(
        &self,
        receiver_id: AgentId,
        cursor: MessageId,
        message_ids: &[MessageId],
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let receiver = inner
            .agents
            .get_mut(&receiver_id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {receiver_id}")))?;
        // Cursor advance first, then the enqueues, under one hold of
        // the store mutex (the memory analogue of one transaction).
        if receiver.last_checked_message_id.is_none_or(|current| cursor > current) {
            receiver.last_checked_message_id = Some(cursor);
        }
        for message_id in message_ids {
            inner.insert_job(
                JobKind::AgentReceive {
                    agent_id: receiver_id,
                    message_id: *message_id,
                },
                run_at,
                max_attempts,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_pair() -> (MemoryStore, Agent, Agent) {
        let store = MemoryStore::new();
        let source = store.create_agent("source", "s", AgentSchedule::Never);
        let receiver = store.create_agent("receiver", "r", AgentSchedule::Every5m);
        (store, source, receiver)
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let (store, source, _) = store_with_pair();
        let a = store
            .append_message(source.id, json!({"n": 1}), None)
            .await
            .unwrap();
        let b = store
            .append_message(source.id, json!({"n": 2}), None)
            .await
            .unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn link_creation_snapshots_cursor() {
        let (store, source, receiver) = store_with_pair();
        store
            .append_message(source.id, json!({}), None)
            .await
            .unwrap();
        let link = store.create_link(source.id, receiver.id);
        assert_eq!(link.message_id_at_creation, MessageId(1));
        assert_eq!(store.links().await.unwrap(), vec![link]);
        // Backlog before the link is not a candidate.
        assert!(store.delivery_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn candidates_exclude_disabled_receivers() {
        let (store, source, mut receiver) = store_with_pair();
        store.create_link(source.id, receiver.id);
        store
            .append_message(source.id, json!({}), None)
            .await
            .unwrap();
        assert_eq!(store.delivery_candidates().await.unwrap().len(), 1);

        receiver.disabled = true;
        store.update_agent(receiver.clone());
        assert!(store.delivery_candidates().await.unwrap().is_empty());

        receiver.disabled = false;
        receiver.deactivated = true;
        store.update_agent(receiver);
        assert!(store.delivery_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_deliveries_never_moves_cursor_backward() {
        let (store, _, receiver) = store_with_pair();
        store
            .dispatch_deliveries(receiver.id, MessageId(12), &[], Utc::now(), 3)
            .await
            .unwrap();
        store
            .dispatch_deliveries(receiver.id, MessageId(7), &[], Utc::now(), 3)
            .await
            .unwrap();
        let agent = store.get_agent(receiver.id).await.unwrap().unwrap();
        assert_eq!(agent.last_checked_message_id, Some(MessageId(12)));
    }

    #[tokio::test]
    async fn expired_messages_are_deleted_and_live_ones_kept() {
        let (store, source, _) = store_with_pair();
        let now = Utc::now();
        store
            .append_message(source.id, json!({}), Some(now - Duration::hours(1)))
            .await
            .unwrap();
        store
            .append_message(source.id, json!({}), Some(now + Duration::hours(1)))
            .await
            .unwrap();
        store.append_message(source.id, json!({}), None).await.unwrap();

        let deleted = store.delete_expired_messages(now, 100).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.message_count(), 2);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_timeout() {
        let (store, source, _) = store_with_pair();
        let now = Utc::now();
        store
            .enqueue_job(JobKind::AgentCheck { agent_id: source.id }, now, 3)
            .await
            .unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let timeout = Duration::minutes(5);
        assert!(store.claim_next_job(a, now, timeout).await.unwrap().is_some());
        assert!(store.claim_next_job(b, now, timeout).await.unwrap().is_none());

        // After the visibility timeout the claim is abandoned.
        let later = now + Duration::minutes(6);
        let reclaimed = store.claim_next_job(b, later, timeout).await.unwrap();
        assert_eq!(reclaimed.unwrap().locked_by, Some(b));
    }

    #[tokio::test]
    async fn prune_keeps_most_recent_failed_jobs() {
        let (store, source, _) = store_with_pair();
        let now = Utc::now();
        for _ in 0..5 {
            let id = store
                .enqueue_job(JobKind::AgentCheck { agent_id: source.id }, now, 1)
                .await
                .unwrap();
            store.mark_job_failed(id, "boom").await.unwrap();
        }
        let pruned = store.prune_failed_jobs(2).await.unwrap();
        assert_eq!(pruned, 3);
        let remaining = store.jobs_snapshot();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|job| job.failed_at.is_some()));
    }

    #[tokio::test]
    async fn pending_count_ignores_failed_jobs() {
        let (store, source, _) = store_with_pair();
        let now = Utc::now();
        let id = store
            .enqueue_job(
                JobKind::AgentReceive {
                    agent_id: source.id,
                    message_id: MessageId(1),
                },
                now,
                1,
            )
            .await
            .unwrap();
        assert_eq!(store.count_pending_jobs(queues::PROPAGATION).await.unwrap(), 1);
        store.mark_job_failed(id, "boom").await.unwrap();
        assert_eq!(store.count_pending_jobs(queues::PROPAGATION).await.unwrap(), 0);
    }
}
