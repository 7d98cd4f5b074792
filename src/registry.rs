//! Pluggable agent-type registry.
//!
//! Agent kinds are registered explicitly at startup: a string type id
//! maps to a descriptor (display metadata, defaults, capabilities) and
//! a handler implementing the check/receive capability interface. The
//! propagation tick treats an unregistered type as a deferred
//! capability and silently skips its rows, so a disabled plugin never
//! surfaces as an error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{Agent, AgentId, Message, MessageId};
use crate::schedule::AgentSchedule;
use crate::store::{MessageStore, Store, StoreResult};

/// What a registered agent type is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_check: bool,
    pub can_receive: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            can_check: true,
            can_receive: true,
        }
    }
}

/// Static metadata for a registered agent type.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub display_name: String,
    pub description: String,
    pub default_options: Value,
    pub default_schedule: AgentSchedule,
    pub capabilities: Capabilities,
}

/// Execution-time services handed to an agent handler.
///
/// The only side channel agent logic has back into the core is
/// appending messages to the store.
#[derive(Clone)]
pub struct ExecutionContext {
    store: Arc<dyn Store>,
    agent_id: AgentId,
}

impl ExecutionContext {
    pub fn new(store: Arc<dyn Store>, agent_id: AgentId) -> Self {
        Self { store, agent_id }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Append a message owned by the executing agent.
    pub async fn emit(
        &self,
        payload: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<MessageId> {
        self.store.append_message(self.agent_id, payload, expires_at).await
    }
}

/// The check/receive capability interface every agent type implements.
///
/// Both operations may fail; failures are caught per-job by the worker
/// and fed into the queue's retry policy. Both may emit new messages
/// through the context.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Scheduled check: inspect the outside world, emit messages.
    async fn check(&self, ctx: &ExecutionContext, agent: &Agent) -> anyhow::Result<()>;

    /// Handle one delivered upstream message.
    async fn receive(
        &self,
        ctx: &ExecutionContext,
        agent: &Agent,
        message: &Message,
    ) -> anyhow::Result<()>;
}

struct Registration {
    descriptor: AgentDescriptor,
    handler: Arc<dyn AgentHandler>,
}

/// Registry mapping type ids to descriptors and handlers.
#[derive(Default)]
pub struct TypeRegistry {
    entries: HashMap<String, Registration>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type. Re-registering an id replaces the previous
    /// entry.
    pub fn register(
        &mut self,
        type_id: impl Into<String>,
        descriptor: AgentDescriptor,
        handler: Arc<dyn AgentHandler>,
    ) {
        self.entries
            .insert(type_id.into(), Registration { descriptor, handler });
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.entries.contains_key(type_id)
    }

    pub fn descriptor(&self, type_id: &str) -> Option<&AgentDescriptor> {
        self.entries.get(type_id).map(|entry| &entry.descriptor)
    }

    pub fn handler(&self, type_id: &str) -> Option<Arc<dyn AgentHandler>> {
        self.entries.get(type_id).map(|entry| Arc::clone(&entry.handler))
    }

    /// Whether the type both exists and can be checked.
    pub fn can_check(&self, type_id: &str) -> bool {
        self.descriptor(type_id)
            .map(|descriptor| descriptor.capabilities.can_check)
            .unwrap_or(false)
    }

    /// Whether the type both exists and can receive deliveries.
    pub fn can_receive(&self, type_id: &str) -> bool {
        self.descriptor(type_id)
            .map(|descriptor| descriptor.capabilities.can_receive)
            .unwrap_or(false)
    }

    pub fn type_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
