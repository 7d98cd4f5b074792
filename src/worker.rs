//! Worker pool: claims queued jobs and runs agent logic behind the
//! per-agent lock.
//!
//! Any number of pools may run concurrently (typically one per OS
//! process); they coordinate only through the shared store. Each pool
//! polls the dispatch queue on a short interval, claims up to its
//! concurrency budget, and executes every claimed job on its own task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use tokio::{
    sync::{watch, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::lock::AgentLockTable;
use crate::model::{Agent, Job, JobKind};
use crate::registry::{ExecutionContext, TypeRegistry};
use crate::retry::BackoffConfig;
use crate::store::{AgentRegistry, DispatchQueue, MessageStore, Store};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Queue poll period.
    pub poll_interval: Duration,
    /// Maximum jobs in flight across this pool.
    pub max_concurrent: usize,
    /// Queue-claim visibility timeout.
    pub claim_timeout: Duration,
    /// Agent-lock staleness threshold.
    pub lock_stale_after: Duration,
    /// Delay before re-running a job that lost the agent lock.
    pub lock_retry_delay: Duration,
    /// Backoff policy for failed attempts.
    pub backoff: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_concurrent: num_cpus::get().max(1) * 2,
            claim_timeout: Duration::from_secs(300),
            lock_stale_after: Duration::from_secs(300),
            lock_retry_delay: Duration::from_secs(5),
            backoff: BackoffConfig::Exponential {
                base_delay_ms: 5_000,
                multiplier: 2.0,
            },
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.worker_poll_interval,
            max_concurrent: config.max_concurrent_jobs,
            claim_timeout: config.claim_timeout,
            lock_stale_after: config.agent_lock_stale_after,
            lock_retry_delay: Duration::from_secs(5),
            backoff: config.backoff,
        }
    }
}

/// Handle to a running worker pool.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl WorkerPool {
    pub fn start(config: WorkerConfig, store: Arc<dyn Store>, registry: Arc<TypeRegistry>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = PoolTask {
                ctx: WorkerContext::new(store, registry, &config),
                config,
                shutdown_rx,
            };
            if let Err(err) = task.run().await {
                error!(?err, "worker pool terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("worker pool task panicked: {err}")),
        }
    }
}

/// Everything a single job execution needs.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) worker_id: Uuid,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) locks: AgentLockTable,
    pub(crate) lock_retry_delay: chrono::Duration,
    pub(crate) backoff: BackoffConfig,
}

impl WorkerContext {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        registry: Arc<TypeRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        let locks = AgentLockTable::new(store.clone(), config.lock_stale_after);
        Self {
            worker_id: Uuid::new_v4(),
            store,
            registry,
            locks,
            lock_retry_delay: chrono::Duration::from_std(config.lock_retry_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            backoff: config.backoff,
        }
    }
}

struct PoolTask {
    config: WorkerConfig,
    ctx: WorkerContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl PoolTask {
    async fn run(mut self) -> Result<()> {
        info!(
            worker_id = %self.ctx.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            max_concurrent = self.config.max_concurrent,
            "worker pool started",
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.claim_and_execute(&semaphore).await {
                        metrics::counter!("percolate_worker_errors_total").increment(1);
                        error!(?err, "worker poll cycle failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!(worker_id = %self.ctx.worker_id, "worker pool shutting down");
                        break;
                    }
                }
            }
        }

        self.wait_for_inflight(&semaphore).await;
        Ok(())
    }

    /// Claim due jobs up to the available concurrency budget and spawn
    /// a task per job.
    async fn claim_and_execute(&self, semaphore: &Arc<Semaphore>) -> Result<()> {
        loop {
            if semaphore.available_permits() == 0 {
                return Ok(());
            }
            let job = self
                .ctx
                .store
                .claim_next_job(
                    self.ctx.worker_id,
                    Utc::now(),
                    chrono::Duration::from_std(self.config.claim_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300)),
                )
                .await?;
            let Some(job) = job else {
                return Ok(());
            };
            let permit = semaphore.clone().acquire_owned().await?;
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                execute_job(&ctx, job, permit).await;
            });
        }
    }

    async fn wait_for_inflight(&self, semaphore: &Arc<Semaphore>) {
        let expected = self.config.max_concurrent.max(1);
        loop {
            if semaphore.available_permits() == expected {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn execute_job(ctx: &WorkerContext, job: Job, _permit: OwnedSemaphorePermit) {
    if let Err(err) = run_job(ctx, &job).await {
        metrics::counter!("percolate_worker_errors_total").increment(1);
        error!(job_id = %job.id, ?err, "job bookkeeping failed");
    }
}

/// Execute one claimed job end to end: lock, run agent logic, stamp
/// timestamps, release, and settle the queue row.
///
/// Errors returned here are store failures around the job, not agent
/// failures; agent failures are consumed into the retry policy.
pub(crate) async fn run_job(ctx: &WorkerContext, job: &Job) -> Result<()> {
    let agent_id = job.kind.agent_id();
    let Some(agent) = ctx.store.get_agent(agent_id).await? else {
        // Agent row gone (deleted by the management layer): nothing to
        // run, drop the job.
        debug!(job_id = %job.id, %agent_id, "agent no longer exists, dropping job");
        ctx.store.complete_job(job.id).await?;
        return Ok(());
    };

    if !agent.is_enabled() {
        debug!(job_id = %job.id, %agent_id, "agent disabled or deactivated, skipping job");
        ctx.store.complete_job(job.id).await?;
        return Ok(());
    }

    // Lock contention is transient: put the job back untouched and let
    // a later poll pick it up. This is not a failed attempt.
    if !ctx.locks.acquire(agent_id).await? {
        metrics::counter!("percolate_lock_contention_total").increment(1);
        ctx.store
            .release_job(job.id, Utc::now() + ctx.lock_retry_delay)
            .await?;
        return Ok(());
    }

    // A panicking handler must not poison the agent lock or dodge the
    // attempt counter, so the panic is contained and treated as a
    // failed attempt like any handler error.
    let outcome = match AssertUnwindSafe(invoke_agent(ctx, &agent, job))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Outcome::HandlerError(anyhow!(
            "agent handler panicked: {}",
            panic_message(panic.as_ref())
        )),
    };

    // The lock is released on every exit path; the staleness threshold
    // only has to cover process death.
    ctx.locks.release(agent_id).await?;

    match outcome {
        Outcome::Done => ctx.store.complete_job(job.id).await?,
        Outcome::HandlerError(err) => {
            error!(
                %agent_id,
                agent_type = %agent.type_id,
                job_id = %job.id,
                error = %format!("{err:#}"),
                "agent execution failed"
            );
            let attempt = job.attempts + 1;
            if attempt >= job.max_attempts {
                warn!(job_id = %job.id, attempts = attempt, "job attempts exhausted");
                ctx.store
                    .mark_job_failed(job.id, &format!("{err:#}"))
                    .await?;
            } else {
                // Small random offset so synchronized failures do not
                // all come due on the same instant.
                let jitter =
                    chrono::Duration::milliseconds(rand::thread_rng().gen_range(0..=250));
                let run_at = Utc::now() + ctx.backoff.delay_for_attempt(attempt) + jitter;
                ctx.store
                    .retry_job(job.id, &format!("{err:#}"), run_at)
                    .await?;
            }
        }
    }
    Ok(())
}

enum Outcome {
    Done,
    HandlerError(anyhow::Error),
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn invoke_agent(ctx: &WorkerContext, agent: &Agent, job: &Job) -> Outcome {
    let exec = ExecutionContext::new(ctx.store.clone(), agent.id);
    match job.kind {
        JobKind::AgentCheck { .. } => {
            let result = match ctx.registry.handler(&agent.type_id) {
                Some(handler) => handler.check(&exec, agent).await,
                None => Err(anyhow!("agent type not registered: {}", agent.type_id)),
            };
            // The attempt is stamped even on failure so the agent is
            // not hammered outside the queue's own backoff.
            if let Err(err) = ctx.store.mark_agent_checked(agent.id, Utc::now()).await {
                warn!(agent_id = %agent.id, error = %err, "failed to stamp check attempt");
            }
            match result {
                Ok(()) => Outcome::Done,
                Err(err) => Outcome::HandlerError(err),
            }
        }
        JobKind::AgentReceive { message_id, .. } => {
            let message = match ctx.store.get_message(message_id).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    // Expired or cleaned up between dispatch and
                    // execution; nothing left to deliver.
                    debug!(agent_id = %agent.id, %message_id, "message gone, skipping delivery");
                    return Outcome::Done;
                }
                Err(err) => return Outcome::HandlerError(err.into()),
            };
            let result = match ctx.registry.handler(&agent.type_id) {
                Some(handler) => handler.receive(&exec, agent, &message).await,
                None => Err(anyhow!("agent type not registered: {}", agent.type_id)),
            };
            if let Err(err) = ctx.store.mark_agent_received(agent.id, Utc::now()).await {
                warn!(agent_id = %agent.id, error = %err, "failed to stamp receive attempt");
            }
            match result {
                Ok(()) => Outcome::Done,
                Err(err) => Outcome::HandlerError(err),
            }
        }
    }
}
