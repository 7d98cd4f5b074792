//! End-to-end tests over the in-memory store.
//!
//! These drive the real scheduler, propagation, and worker code paths
//! without a database, so they run in-process and deterministically
//! wherever possible. Queue draining is done by claiming jobs directly
//! rather than waiting on pool timers, except for the tests that
//! specifically exercise the spawned tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::time::sleep;

use crate::model::{Agent, JobKind};
use crate::propagation::propagate;
use crate::registry::testing::{descriptor, CountingHandler};
use crate::registry::{AgentHandler, ExecutionContext, TypeRegistry};
use crate::schedule::AgentSchedule;
use crate::scheduler::{spawn_scheduler, SchedulerConfig};
use crate::store::memory::MemoryStore;
use crate::store::{AgentRegistry, DispatchQueue, MessageStore};
use crate::worker::{run_job, WorkerConfig, WorkerContext, WorkerPool};

const MAX_ATTEMPTS: i32 = 3;

fn worker_context(store: &Arc<MemoryStore>, registry: &Arc<TypeRegistry>) -> WorkerContext {
    WorkerContext::new(store.clone(), registry.clone(), &WorkerConfig::default())
}

/// Claim and execute every currently-due job.
async fn drain_queue(store: &Arc<MemoryStore>, ctx: &WorkerContext) -> usize {
    let mut executed = 0;
    while let Some(job) = store
        .claim_next_job(ctx.worker_id, Utc::now(), chrono::Duration::minutes(5))
        .await
        .unwrap()
    {
        run_job(ctx, &job).await.unwrap();
        executed += 1;
    }
    executed
}

#[tokio::test]
async fn scheduled_check_flows_through_to_the_receiver() {
    let store = Arc::new(MemoryStore::new());
    let emitter = Arc::new(CountingHandler::default());
    let sink = Arc::new(CountingHandler::default());
    let mut registry = TypeRegistry::new();
    registry.register("emitter", descriptor(), emitter.clone());
    registry.register("sink", descriptor(), sink.clone());
    let registry = Arc::new(registry);
    let ctx = worker_context(&store, &registry);

    let source = store.create_agent("emitter", "source", AgentSchedule::Every5m);
    let receiver = store.create_agent("sink", "receiver", AgentSchedule::Never);
    store.create_link(source.id, receiver.id);

    // What the scheduler does when the source's schedule fires.
    store
        .enqueue_job(
            JobKind::AgentCheck {
                agent_id: source.id,
            },
            Utc::now(),
            MAX_ATTEMPTS,
        )
        .await
        .unwrap();

    // Check runs and emits one message.
    assert_eq!(drain_queue(&store, &ctx).await, 1);
    assert_eq!(emitter.checks.load(Ordering::SeqCst), 1);
    assert_eq!(store.message_count(), 1);

    // Propagation fans the message out, the worker delivers it.
    let report = propagate(store.as_ref(), registry.as_ref(), MAX_ATTEMPTS)
        .await
        .unwrap();
    assert_eq!(report.jobs_enqueued, 1);
    assert_eq!(drain_queue(&store, &ctx).await, 1);
    assert_eq!(sink.receives.load(Ordering::SeqCst), 1);

    // Cursor advanced past the delivered message; a second pass is a
    // no-op.
    let receiver = store.get_agent(receiver.id).await.unwrap().unwrap();
    assert!(receiver.last_checked_message_id.is_some());
    let report = propagate(store.as_ref(), registry.as_ref(), MAX_ATTEMPTS)
        .await
        .unwrap();
    assert_eq!(report.jobs_enqueued, 0);
    assert!(store.jobs_snapshot().is_empty());
}

#[tokio::test]
async fn messages_propagate_down_a_chain_of_agents() {
    let store = Arc::new(MemoryStore::new());
    let emitter = Arc::new(CountingHandler::default());
    let relay = Arc::new(CountingHandler {
        reemit: true,
        ..CountingHandler::default()
    });
    let sink = Arc::new(CountingHandler::default());
    let mut registry = TypeRegistry::new();
    registry.register("emitter", descriptor(), emitter.clone());
    registry.register("relay", descriptor(), relay.clone());
    registry.register("sink", descriptor(), sink.clone());
    let registry = Arc::new(registry);
    let ctx = worker_context(&store, &registry);

    let a = store.create_agent("emitter", "a", AgentSchedule::Every5m);
    let b = store.create_agent("relay", "b", AgentSchedule::Never);
    let c = store.create_agent("sink", "c", AgentSchedule::Never);
    store.create_link(a.id, b.id);
    store.create_link(b.id, c.id);

    store
        .enqueue_job(JobKind::AgentCheck { agent_id: a.id }, Utc::now(), MAX_ATTEMPTS)
        .await
        .unwrap();

    // Each round: propagate what exists, then execute the deliveries.
    // Two rounds move a message from a through b to c.
    drain_queue(&store, &ctx).await;
    for _ in 0..2 {
        propagate(store.as_ref(), registry.as_ref(), MAX_ATTEMPTS)
            .await
            .unwrap();
        drain_queue(&store, &ctx).await;
    }

    assert_eq!(relay.receives.load(Ordering::SeqCst), 1);
    assert_eq!(sink.receives.load(Ordering::SeqCst), 1);
    // a's original message plus b's re-emission.
    assert_eq!(store.message_count(), 2);
    assert!(store.jobs_snapshot().is_empty());
}

/// Tracks how many check invocations for one agent overlap in time.
#[derive(Default)]
struct SlowHandler {
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    completed: AtomicUsize,
}

#[async_trait]
impl AgentHandler for SlowHandler {
    async fn check(&self, _ctx: &ExecutionContext, _agent: &Agent) -> anyhow::Result<()> {
        let entered = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(entered, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(
        &self,
        _ctx: &ExecutionContext,
        _agent: &Agent,
        _message: &crate::model::Message,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn agent_lock_keeps_executions_for_one_agent_serial() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(SlowHandler::default());
    let mut registry = TypeRegistry::new();
    registry.register("slow", descriptor(), handler.clone());
    let registry = Arc::new(registry);

    let agent = store.create_agent("slow", "a", AgentSchedule::Every5m);
    for _ in 0..3 {
        store
            .enqueue_job(
                JobKind::AgentCheck { agent_id: agent.id },
                Utc::now(),
                MAX_ATTEMPTS,
            )
            .await
            .unwrap();
    }

    let pool = WorkerPool::start(
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            max_concurrent: 8,
            lock_retry_delay: Duration::from_millis(20),
            ..WorkerConfig::default()
        },
        store.clone(),
        registry,
    );

    // All three jobs complete, never two at once for the same agent.
    for _ in 0..400 {
        if handler.completed.load(Ordering::SeqCst) == 3 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    pool.shutdown().await.unwrap();

    assert_eq!(handler.completed.load(Ordering::SeqCst), 3);
    assert_eq!(handler.max_concurrent.load(Ordering::SeqCst), 1);
    assert!(store.jobs_snapshot().is_empty());
}

#[tokio::test]
async fn spawned_scheduler_and_pool_deliver_messages() {
    let store = Arc::new(MemoryStore::new());
    let emitter = Arc::new(CountingHandler::default());
    let sink = Arc::new(CountingHandler::default());
    let mut registry = TypeRegistry::new();
    registry.register("emitter", descriptor(), emitter.clone());
    registry.register("sink", descriptor(), sink.clone());
    let registry = Arc::new(registry);

    let source = store.create_agent("emitter", "source", AgentSchedule::Never);
    let receiver = store.create_agent("sink", "receiver", AgentSchedule::Never);
    store.create_link(source.id, receiver.id);

    let (scheduler_handle, shutdown_tx) = spawn_scheduler(
        SchedulerConfig {
            propagate_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        },
        store.clone(),
        registry.clone(),
    );
    let pool = WorkerPool::start(
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        },
        store.clone(),
        registry.clone(),
    );

    // A message appears (as if a check emitted it); the running
    // scheduler propagates it and the pool delivers it.
    store
        .append_message(source.id, json!({"n": 1}), None)
        .await
        .unwrap();

    for _ in 0..300 {
        if sink.receives.load(Ordering::SeqCst) >= 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    let _ = shutdown_tx.send(true);
    scheduler_handle.await.unwrap().unwrap();
    pool.shutdown().await.unwrap();

    assert_eq!(sink.receives.load(Ordering::SeqCst), 1);
    let receiver = store.get_agent(receiver.id).await.unwrap().unwrap();
    assert!(receiver.last_receive_at.is_some());
}

mod properties {
    use std::sync::Arc;

    use proptest::prelude::*;
    use serde_json::json;

    use crate::propagation::propagate;
    use crate::registry::testing::{registry_with, CountingHandler};
    use crate::retry::BackoffConfig;
    use crate::schedule::{AgentSchedule, ScheduleJitter};
    use crate::store::memory::MemoryStore;
    use crate::store::{AgentRegistry, DispatchQueue, MessageStore};

    proptest! {
        /// Random interleavings of message production, propagation
        /// ticks, and queue drains never move a receiver's cursor
        /// backward.
        #[test]
        fn receiver_cursor_never_moves_backward(ops in prop::collection::vec(0u8..=2, 1..60)) {
            let outcome: Result<(), TestCaseError> =
                futures::executor::block_on(async move {
                    let store = MemoryStore::new();
                    let registry = registry_with("t", Arc::new(CountingHandler::default()));
                    let source = store.create_agent("t", "s", AgentSchedule::Never);
                    let receiver = store.create_agent("t", "r", AgentSchedule::Never);
                    store.create_link(source.id, receiver.id);

                    let mut last_cursor = None;
                    for op in ops {
                        match op {
                            0 => {
                                store
                                    .append_message(source.id, json!({}), None)
                                    .await
                                    .unwrap();
                            }
                            1 => {
                                propagate(&store, &registry, 3).await.unwrap();
                            }
                            _ => {
                                if let Some(job) = store.jobs_snapshot().into_iter().next() {
                                    store.complete_job(job.id).await.unwrap();
                                }
                            }
                        }
                        let cursor = store
                            .get_agent(receiver.id)
                            .await
                            .unwrap()
                            .unwrap()
                            .last_checked_message_id;
                        prop_assert!(cursor >= last_cursor, "cursor moved backward");
                        last_cursor = cursor;
                    }
                    Ok(())
                });
            outcome?;
        }

        #[test]
        fn backoff_delay_is_bounded_and_monotonic(
            base in 1i32..10_000,
            multiplier in 1.0f64..4.0,
            attempt in 2i32..40,
        ) {
            let backoff = BackoffConfig::Exponential { base_delay_ms: base, multiplier };
            let current = backoff.calculate_delay_ms(attempt);
            let previous = backoff.calculate_delay_ms(attempt - 1);
            prop_assert!(current >= previous);
            prop_assert!(current <= crate::retry::MAX_DELAY_MS);
        }

        #[test]
        fn hour_of_day_fires_at_the_named_hour(hour in 0u8..24, minutes_past in 0u32..1440) {
            let after = chrono::DateTime::parse_from_rfc3339("2026-06-01T00:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc)
                + chrono::Duration::minutes(minutes_past as i64);
            let fire = AgentSchedule::HourOfDay(hour)
                .next_fire_after(after, ScheduleJitter::none())
                .unwrap();
            prop_assert!(fire > after);
            prop_assert_eq!(chrono::Timelike::hour(&fire), hour as u32);
            prop_assert_eq!(chrono::Timelike::minute(&fire), 0);
        }
    }
}
