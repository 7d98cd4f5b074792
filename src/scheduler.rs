//! Scheduler loop: the single periodic driver of the system.
//!
//! One instance should run per deployment. Each tick it fires any
//! named schedules whose cron expression has come due, enqueueing a
//! check job per matching agent, then runs a propagation pass. Two
//! slower tickers handle expired-message cleanup and failed-job
//! pruning. Every trigger is isolated: one failing step is logged and
//! the rest of the tick proceeds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::model::JobKind;
use crate::propagation::propagate;
use crate::registry::TypeRegistry;
use crate::schedule::{AgentSchedule, ScheduleJitter};
use crate::store::{AgentRegistry, DispatchQueue, MessageStore, Store};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Base tick period; drives both cron firing and propagation.
    pub propagate_interval: Duration,
    /// Expired-message cleanup period.
    pub expiry_interval: Duration,
    /// Failed-job pruning period.
    pub prune_interval: Duration,
    /// Rows to keep per pruning pass.
    pub failed_jobs_to_keep: i64,
    /// Expired messages deleted per round trip.
    pub expiry_batch_size: i64,
    /// Attempt budget stamped on enqueued jobs.
    pub max_job_attempts: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            propagate_interval: Duration::from_secs(1),
            expiry_interval: Duration::from_secs(6 * 3600),
            prune_interval: Duration::from_secs(3600),
            failed_jobs_to_keep: 100,
            expiry_batch_size: 1_000,
            max_job_attempts: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            propagate_interval: config.propagate_interval,
            expiry_interval: config.expiry_interval,
            prune_interval: config.prune_interval,
            failed_jobs_to_keep: config.failed_jobs_to_keep,
            expiry_batch_size: config.expiry_batch_size,
            max_job_attempts: config.max_job_attempts,
        }
    }
}

pub struct SchedulerLoop {
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    registry: Arc<TypeRegistry>,
    jitter: ScheduleJitter,
    // Serializes the tick body; a tick arriving while one is still
    // running is skipped, not queued.
    tick_guard: Mutex<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SchedulerLoop {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn Store>,
        registry: Arc<TypeRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            jitter: ScheduleJitter::from_rng(&mut rand::thread_rng()),
            tick_guard: Mutex::new(()),
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!(
            propagate_interval_ms = self.config.propagate_interval.as_millis(),
            jitter_minute = self.jitter.minute,
            "scheduler started",
        );

        let mut next_fire = initial_fire_times(Utc::now(), self.jitter);

        let mut base = interval(self.config.propagate_interval);
        base.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut expiry = interval(self.config.expiry_interval);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prune = interval(self.config.prune_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both slow tickers fire immediately on the first tick; that
        // is deliberate, cleanup should not wait hours after boot.

        loop {
            tokio::select! {
                _ = base.tick() => {
                    self.tick(&mut next_fire, Utc::now()).await;
                }
                _ = expiry.tick() => {
                    if let Err(err) = self.run_expiry_cleanup(Utc::now()).await {
                        metrics::counter!("percolate_scheduler_errors_total").increment(1);
                        error!(?err, "expired-message cleanup failed");
                    }
                }
                _ = prune.tick() => {
                    if let Err(err) = self.run_failed_job_pruning().await {
                        metrics::counter!("percolate_scheduler_errors_total").increment(1);
                        error!(?err, "failed-job pruning failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("scheduler shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One base tick: fire due cron schedules, then propagate.
    async fn tick(
        &self,
        next_fire: &mut BTreeMap<AgentSchedule, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!("previous tick still running, skipping");
            return;
        };

        for schedule in due_schedules(next_fire, now, self.jitter) {
            if let Err(err) = self.enqueue_due_checks(schedule, now).await {
                metrics::counter!("percolate_scheduler_errors_total").increment(1);
                error!(schedule = %schedule, ?err, "scheduled check enqueue failed");
            }
        }

        match propagate(self.store.as_ref(), self.registry.as_ref(), self.config.max_job_attempts)
            .await
        {
            Ok(report) => {
                if report.jobs_enqueued > 0 {
                    debug!(
                        receivers = report.receivers,
                        jobs = report.jobs_enqueued,
                        "propagated messages"
                    );
                }
            }
            Err(err) => {
                metrics::counter!("percolate_scheduler_errors_total").increment(1);
                error!(?err, "propagation pass failed");
            }
        }
    }

    /// Enqueue a check job for every enabled agent on the schedule
    /// whose type is registered and checkable.
    async fn enqueue_due_checks(
        &self,
        schedule: AgentSchedule,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let agent_ids = self.store.agents_due_for_schedule(schedule).await?;
        let mut enqueued = 0usize;
        for agent_id in agent_ids {
            // The store already excludes disabled agents; re-check the
            // fetched row so a flip racing this tick is still honored.
            let Some(agent) = self.store.get_agent(agent_id).await? else {
                continue;
            };
            if !agent.is_enabled() || !self.registry.can_check(&agent.type_id) {
                continue;
            }
            self.store
                .enqueue_job(
                    JobKind::AgentCheck { agent_id },
                    now,
                    self.config.max_job_attempts,
                )
                .await?;
            enqueued += 1;
        }
        if enqueued > 0 {
            info!(schedule = %schedule, count = enqueued, "enqueued scheduled checks");
        }
        Ok(())
    }

    /// Delete expired messages in batches until a short batch comes
    /// back.
    async fn run_expiry_cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let batch = self.config.expiry_batch_size;
        let mut total = 0u64;
        loop {
            let deleted = self.store.delete_expired_messages(now, batch).await?;
            total += deleted;
            if deleted < batch as u64 {
                break;
            }
        }
        if total > 0 {
            info!(deleted = total, "deleted expired messages");
        }
        Ok(total)
    }

    async fn run_failed_job_pruning(&self) -> Result<u64> {
        let pruned = self
            .store
            .prune_failed_jobs(self.config.failed_jobs_to_keep)
            .await?;
        if pruned > 0 {
            info!(pruned, "pruned old failed jobs");
        }
        Ok(pruned)
    }
}

/// Next fire time per named schedule, strictly after `now`.
fn initial_fire_times(
    now: DateTime<Utc>,
    jitter: ScheduleJitter,
) -> BTreeMap<AgentSchedule, DateTime<Utc>> {
    AgentSchedule::all()
        .into_iter()
        .filter_map(|schedule| {
            schedule
                .next_fire_after(now, jitter)
                .map(|at| (schedule, at))
        })
        .collect()
}

/// Drain the schedules due at `now`, advancing each to its next fire
/// time.
fn due_schedules(
    next_fire: &mut BTreeMap<AgentSchedule, DateTime<Utc>>,
    now: DateTime<Utc>,
    jitter: ScheduleJitter,
) -> Vec<AgentSchedule> {
    let due: Vec<AgentSchedule> = next_fire
        .iter()
        .filter(|(_, at)| **at <= now)
        .map(|(schedule, _)| *schedule)
        .collect();
    for schedule in &due {
        if let Some(at) = schedule.next_fire_after(now, jitter) {
            next_fire.insert(*schedule, at);
        } else {
            next_fire.remove(schedule);
        }
    }
    due
}

/// Spawn the scheduler on its own task. Send `true` on the returned
/// channel to stop it.
pub fn spawn_scheduler(
    config: SchedulerConfig,
    store: Arc<dyn Store>,
    registry: Arc<TypeRegistry>,
) -> (JoinHandle<Result<()>>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = SchedulerLoop::new(config, store, registry, shutdown_rx);
    let handle = tokio::spawn(async move { task.run().await });
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::model::Job;
    use crate::registry::testing::{descriptor, registry_with, CountingHandler};
    use crate::registry::Capabilities;
    use crate::store::memory::MemoryStore;
    use crate::store::MessageStore;

    fn scheduler(store: &Arc<MemoryStore>, registry: TypeRegistry) -> SchedulerLoop {
        let (_tx, rx) = watch::channel(false);
        SchedulerLoop::new(
            SchedulerConfig {
                expiry_batch_size: 2,
                failed_jobs_to_keep: 1,
                ..SchedulerConfig::default()
            },
            store.clone(),
            Arc::new(registry),
            rx,
        )
    }

    #[tokio::test]
    async fn due_schedule_enqueues_checks_for_matching_agents() {
        let store = Arc::new(MemoryStore::new());
        let sched = scheduler(&store, registry_with("t", Arc::new(CountingHandler::default())));
        let a = store.create_agent("t", "a", AgentSchedule::Every5m);
        let b = store.create_agent("t", "b", AgentSchedule::Every5m);
        store.create_agent("t", "other cadence", AgentSchedule::Every1h);

        sched
            .enqueue_due_checks(AgentSchedule::Every5m, Utc::now())
            .await
            .unwrap();

        let jobs = store.jobs_snapshot();
        assert_eq!(jobs.len(), 2);
        let mut agent_ids: Vec<_> = jobs.iter().map(|job| job.kind.agent_id()).collect();
        agent_ids.sort();
        assert_eq!(agent_ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn disabled_and_uncheckable_agents_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = TypeRegistry::new();
        registry.register("t", descriptor(), Arc::new(CountingHandler::default()));
        registry.register("sink", receive_only(), Arc::new(CountingHandler::default()));
        let sched = scheduler(&store, registry);

        let mut disabled = store.create_agent("t", "off", AgentSchedule::Every5m);
        disabled.disabled = true;
        store.update_agent(disabled);
        store.create_agent("sink", "no checks", AgentSchedule::Every5m);
        let live = store.create_agent("t", "on", AgentSchedule::Every5m);

        sched
            .enqueue_due_checks(AgentSchedule::Every5m, Utc::now())
            .await
            .unwrap();

        let jobs = store.jobs_snapshot();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind.agent_id(), live.id);
    }

    fn receive_only() -> crate::registry::AgentDescriptor {
        let mut d = descriptor();
        d.capabilities = Capabilities {
            can_check: false,
            can_receive: true,
        };
        d
    }

    #[tokio::test]
    async fn expiry_cleanup_drains_in_batches() {
        let store = Arc::new(MemoryStore::new());
        let sched = scheduler(&store, TypeRegistry::new());
        let agent = store.create_agent("t", "a", AgentSchedule::Never);
        let past = Utc::now() - chrono::Duration::hours(1);
        for i in 0..5 {
            store
                .append_message(agent.id, json!({"i": i}), Some(past))
                .await
                .unwrap();
        }
        store
            .append_message(agent.id, json!({"keep": true}), None)
            .await
            .unwrap();

        // Batch size is 2; all five expired rows go in one call.
        let deleted = sched.run_expiry_cleanup(Utc::now()).await.unwrap();
        assert_eq!(deleted, 5);
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn pruning_respects_the_retention_count() {
        let store = Arc::new(MemoryStore::new());
        let sched = scheduler(&store, TypeRegistry::new());
        let agent = store.create_agent("t", "a", AgentSchedule::Never);
        for _ in 0..3 {
            let id = store
                .enqueue_job(JobKind::AgentCheck { agent_id: agent.id }, Utc::now(), 1)
                .await
                .unwrap();
            store.mark_job_failed(id, "boom").await.unwrap();
        }

        let pruned = sched.run_failed_job_pruning().await.unwrap();
        assert_eq!(pruned, 2);
        let jobs: Vec<Job> = store.jobs_snapshot();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn fire_times_never_include_never_and_advance_when_due() {
        let jitter = ScheduleJitter::none();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap();
        let mut next_fire = initial_fire_times(now, jitter);
        assert!(!next_fire.contains_key(&AgentSchedule::Never));
        assert!(next_fire.values().all(|at| *at > now));

        // Pretend the 1m schedule came due.
        next_fire.insert(AgentSchedule::Every1m, now);
        let due = due_schedules(&mut next_fire, now, jitter);
        assert_eq!(due, vec![AgentSchedule::Every1m]);
        assert!(next_fire[&AgentSchedule::Every1m] > now);

        // Nothing due on a second identical pass.
        assert!(due_schedules(&mut next_fire, now, jitter).is_empty());
    }
}
