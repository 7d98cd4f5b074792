//! Built-in HTTP agent type.
//!
//! A remote agent bridges the system to an external HTTP endpoint:
//! scheduled checks POST a configured payload, and delivered messages
//! are forwarded with their payload merged over the configured one.
//! The JSON response can optionally be emitted back into the message
//! stream, which lets an external service act as both a source and a
//! sink.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::model::{Agent, Message};
use crate::registry::{AgentDescriptor, AgentHandler, Capabilities, ExecutionContext, TypeRegistry};
use crate::schedule::AgentSchedule;

pub const REMOTE_TYPE_ID: &str = "remote";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-agent options, stored in the agent's `options` document.
#[derive(Debug, Deserialize)]
struct RemoteOptions {
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default = "default_payload")]
    payload: Value,
    /// Emit the JSON response body as a new message.
    #[serde(default)]
    emit_response: bool,
}

fn default_payload() -> Value {
    Value::Object(Default::default())
}

pub struct RemoteAgent {
    client: reqwest::Client,
}

impl RemoteAgent {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }

    pub fn descriptor() -> AgentDescriptor {
        AgentDescriptor {
            display_name: "Remote HTTP".to_string(),
            description: "POSTs to an external HTTP endpoint on check and on delivery"
                .to_string(),
            default_options: serde_json::json!({
                "url": "",
                "payload": {},
                "emit_response": false,
            }),
            default_schedule: AgentSchedule::Never,
            capabilities: Capabilities {
                can_check: true,
                can_receive: true,
            },
        }
    }

    /// Register this type under [`REMOTE_TYPE_ID`].
    pub fn register(registry: &mut TypeRegistry) -> Result<()> {
        registry.register(REMOTE_TYPE_ID, Self::descriptor(), std::sync::Arc::new(Self::new()?));
        Ok(())
    }

    async fn post(
        &self,
        ctx: &ExecutionContext,
        options: &RemoteOptions,
        payload: &Value,
    ) -> Result<()> {
        let mut request = self.client.post(&options.url).json(payload);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", options.url))?
            .error_for_status()
            .with_context(|| format!("endpoint {} returned an error status", options.url))?;

        if options.emit_response {
            let body: Value = response
                .json()
                .await
                .with_context(|| format!("endpoint {} returned non-JSON body", options.url))?;
            let message_id = ctx.emit(body, None).await?;
            debug!(agent_id = %ctx.agent_id(), %message_id, "emitted remote response");
        }
        Ok(())
    }
}

fn parse_options(agent: &Agent) -> Result<RemoteOptions> {
    serde_json::from_value(agent.options.clone())
        .with_context(|| format!("invalid remote agent options for '{}'", agent.name))
}

/// Shallow merge: message keys override configured keys when both are
/// objects; otherwise the message payload wins outright.
fn merge_payload(configured: &Value, delivered: &Value) -> Value {
    match (configured, delivered) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (key, value) in over {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => delivered.clone(),
    }
}

#[async_trait]
impl AgentHandler for RemoteAgent {
    async fn check(&self, ctx: &ExecutionContext, agent: &Agent) -> Result<()> {
        let options = parse_options(agent)?;
        let payload = options.payload.clone();
        self.post(ctx, &options, &payload).await
    }

    async fn receive(
        &self,
        ctx: &ExecutionContext,
        agent: &Agent,
        message: &Message,
    ) -> Result<()> {
        let options = parse_options(agent)?;
        let payload = merge_payload(&options.payload, &message.payload);
        self.post(ctx, &options, &payload).await
    }
}
