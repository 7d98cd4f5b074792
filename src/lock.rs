//! Per-agent mutual exclusion across worker processes.
//!
//! One lock guards both scheduled check execution and message receipt
//! for an agent: the two mutate shared per-agent state, so they must
//! be mutually exclusive with each other, not just with themselves.
//! The lock is advisory and lives in the shared store because workers
//! run as separate OS processes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::model::AgentId;
use crate::store::{AgentLockStore, StoreResult};

/// Staleness-aware facade over the store's lock table.
#[derive(Clone)]
pub struct AgentLockTable {
    store: Arc<dyn AgentLockStore>,
    stale_after: chrono::Duration,
}

impl AgentLockTable {
    pub fn new(store: Arc<dyn AgentLockStore>, stale_after: Duration) -> Self {
        Self {
            store,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        }
    }

    /// Attempt to claim execution rights for the agent.
    ///
    /// Returns false while another worker actively holds the lock. A
    /// hold older than the staleness threshold is treated as abandoned
    /// by a crashed worker and reclaimed.
    pub async fn acquire(&self, agent_id: AgentId) -> StoreResult<bool> {
        let acquired = self
            .store
            .try_acquire_lock(agent_id, Utc::now(), self.stale_after)
            .await?;
        if !acquired {
            debug!(%agent_id, "agent lock contended");
        }
        Ok(acquired)
    }

    /// Release the lock. Safe to call on every exit path; releasing an
    /// already-free lock is a no-op.
    pub async fn release(&self, agent_id: AgentId) -> StoreResult<()> {
        self.store.release_lock(agent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::AgentSchedule;
    use crate::store::memory::MemoryStore;

    fn table(store: &Arc<MemoryStore>, stale_secs: u64) -> AgentLockTable {
        AgentLockTable::new(store.clone() as Arc<dyn AgentLockStore>, Duration::from_secs(stale_secs))
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("t", "x", AgentSchedule::Never);
        let locks = table(&store, 300);

        assert!(locks.acquire(agent.id).await.unwrap());
        assert!(!locks.acquire(agent.id).await.unwrap());

        locks.release(agent.id).await.unwrap();
        assert!(locks.acquire(agent.id).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("t", "x", AgentSchedule::Never);
        let locks = table(&store, 300);

        // Never acquired: still a no-op.
        locks.release(agent.id).await.unwrap();

        assert!(locks.acquire(agent.id).await.unwrap());
        locks.release(agent.id).await.unwrap();
        locks.release(agent.id).await.unwrap();
        assert!(locks.acquire(agent.id).await.unwrap());
    }

    #[tokio::test]
    async fn stale_hold_is_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let agent = store.create_agent("t", "x", AgentSchedule::Never);

        // Zero staleness threshold: any prior hold counts as abandoned.
        let locks = table(&store, 0);
        assert!(locks.acquire(agent.id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(locks.acquire(agent.id).await.unwrap());

        // A generous threshold keeps the hold exclusive.
        let strict = table(&store, 3600);
        assert!(!strict.acquire(agent.id).await.unwrap());
    }
}
