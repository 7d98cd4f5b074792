//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `PERCOLATE_DATABASE_URL`: PostgreSQL connection string (required for the Postgres store)
//! - `PERCOLATE_PROPAGATE_INTERVAL_MS`: propagation tick period (default: 1000)
//! - `PERCOLATE_EXPIRY_INTERVAL_SECS`: expired-message cleanup period (default: 21600, 6h)
//! - `PERCOLATE_PRUNE_INTERVAL_SECS`: failed-job pruning period (default: 3600, 1h)
//! - `PERCOLATE_FAILED_JOBS_TO_KEEP`: failed jobs retained per prune (default: 100)
//! - `PERCOLATE_WORKER_COUNT`: worker tasks in the pool (default: num_cpus)
//! - `PERCOLATE_WORKER_POLL_INTERVAL_MS`: queue poll period (default: 250)
//! - `PERCOLATE_MAX_CONCURRENT_JOBS`: in-flight job cap per pool (default: num_cpus * 2)
//! - `PERCOLATE_MAX_JOB_ATTEMPTS`: attempts before a job is marked failed (default: 5)
//! - `PERCOLATE_BACKOFF_BASE_MS`: retry backoff base delay (default: 5000)
//! - `PERCOLATE_AGENT_LOCK_STALE_SECS`: agent-lock staleness threshold (default: 300)
//! - `PERCOLATE_CLAIM_TIMEOUT_SECS`: queue claim visibility timeout (default: 300)
//! - `PERCOLATE_EXPIRY_BATCH_SIZE`: expired messages deleted per batch (default: 1000)
//!
//! The configuration is an explicit value owned by `main` and passed
//! into the scheduler and worker pool; there is no process-global
//! cache.

use std::{env, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::retry::BackoffConfig;

/// Runtime configuration for the scheduler loop and worker pool.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: Option<String>,

    /// Propagation tick period.
    pub propagate_interval: Duration,

    /// Expired-message cleanup period.
    pub expiry_interval: Duration,

    /// Failed-job pruning period.
    pub prune_interval: Duration,

    /// Most recent failed jobs kept by each pruning pass.
    pub failed_jobs_to_keep: i64,

    /// Worker tasks in the pool.
    pub worker_count: usize,

    /// Queue poll period for workers.
    pub worker_poll_interval: Duration,

    /// Maximum in-flight jobs across the pool.
    pub max_concurrent_jobs: usize,

    /// Attempts before a job is marked permanently failed.
    pub max_job_attempts: i32,

    /// Retry backoff policy applied by the queue on job failure.
    pub backoff: BackoffConfig,

    /// An agent lock held longer than this is treated as abandoned.
    pub agent_lock_stale_after: Duration,

    /// A queue claim older than this is reclaimable by other workers.
    pub claim_timeout: Duration,

    /// Expired messages deleted per cleanup batch.
    pub expiry_batch_size: i64,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            database_url: None,
            propagate_interval: Duration::from_millis(1000),
            expiry_interval: Duration::from_secs(6 * 60 * 60),
            prune_interval: Duration::from_secs(60 * 60),
            failed_jobs_to_keep: 100,
            worker_count: cpus,
            worker_poll_interval: Duration::from_millis(250),
            max_concurrent_jobs: cpus * 2,
            max_job_attempts: 5,
            backoff: BackoffConfig::Exponential {
                base_delay_ms: 5_000,
                multiplier: 2.0,
            },
            agent_lock_stale_after: Duration::from_secs(300),
            claim_timeout: Duration::from_secs(300),
            expiry_batch_size: 1_000,
        }
    }
}

impl Config {
    /// Build a configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Self {
            database_url: env::var("PERCOLATE_DATABASE_URL").ok(),
            propagate_interval: env_duration_ms(
                "PERCOLATE_PROPAGATE_INTERVAL_MS",
                defaults.propagate_interval,
            )?,
            expiry_interval: env_duration_secs(
                "PERCOLATE_EXPIRY_INTERVAL_SECS",
                defaults.expiry_interval,
            )?,
            prune_interval: env_duration_secs(
                "PERCOLATE_PRUNE_INTERVAL_SECS",
                defaults.prune_interval,
            )?,
            failed_jobs_to_keep: env_parse(
                "PERCOLATE_FAILED_JOBS_TO_KEEP",
                defaults.failed_jobs_to_keep,
            )?,
            worker_count: env_parse("PERCOLATE_WORKER_COUNT", defaults.worker_count)?,
            worker_poll_interval: env_duration_ms(
                "PERCOLATE_WORKER_POLL_INTERVAL_MS",
                defaults.worker_poll_interval,
            )?,
            max_concurrent_jobs: env_parse(
                "PERCOLATE_MAX_CONCURRENT_JOBS",
                defaults.max_concurrent_jobs,
            )?,
            max_job_attempts: env_parse("PERCOLATE_MAX_JOB_ATTEMPTS", defaults.max_job_attempts)?,
            backoff: BackoffConfig::Exponential {
                base_delay_ms: env_parse("PERCOLATE_BACKOFF_BASE_MS", 5_000)?,
                multiplier: 2.0,
            },
            agent_lock_stale_after: env_duration_secs(
                "PERCOLATE_AGENT_LOCK_STALE_SECS",
                defaults.agent_lock_stale_after,
            )?,
            claim_timeout: env_duration_secs(
                "PERCOLATE_CLAIM_TIMEOUT_SECS",
                defaults.claim_timeout,
            )?,
            expiry_batch_size: env_parse(
                "PERCOLATE_EXPIRY_BATCH_SIZE",
                defaults.expiry_batch_size,
            )?,
        })
    }

    /// The database URL, or an error naming the missing variable.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("PERCOLATE_DATABASE_URL is not set")
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(env_parse(
        key,
        default.as_millis() as u64,
    )?))
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}
