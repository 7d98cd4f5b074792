//! Percolate - scheduling and message-propagation core for agent workflows.
//!
//! Agents produce typed messages; links fan them out to receiver agents.
//! A singleton [`SchedulerLoop`] drives cron triggers, the propagation
//! tick, and time-based cleanup; a [`WorkerPool`] executes the queued
//! check/receive jobs behind per-agent locks.

pub mod config;
pub mod lock;
pub mod model;
pub mod observability;
pub mod propagation;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use config::Config;
pub use lock::AgentLockTable;
pub use model::{Agent, AgentId, Job, JobId, JobKind, Link, Message, MessageId};
pub use propagation::{propagate, PropagationReport};
pub use registry::{AgentDescriptor, AgentHandler, Capabilities, ExecutionContext, TypeRegistry};
pub use remote::{RemoteAgent, REMOTE_TYPE_ID};
pub use retry::BackoffConfig;
pub use schedule::AgentSchedule;
pub use scheduler::{spawn_scheduler, SchedulerConfig, SchedulerLoop};
pub use store::memory::MemoryStore;
pub use store::postgres::PostgresStore;
pub use store::{DeliveryCandidate, Store, StoreError, StoreResult};
pub use worker::{WorkerConfig, WorkerPool};
