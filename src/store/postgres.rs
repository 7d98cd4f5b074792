//! Postgres store shared by the scheduler loop and all worker
//! processes.
//!
//! Queries are runtime-bound (`sqlx::query` + `Row::get`) so the crate
//! builds without a live database. The claim query uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never contend on the
//! same row.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{
    AgentLockStore, AgentRegistry, DeliveryCandidate, DispatchQueue, LinkGraph, MessageStore,
    Store, StoreError, StoreResult,
};
use crate::model::{Agent, AgentId, Job, JobId, JobKind, Link, Message, MessageId};
use crate::schedule::AgentSchedule;

/// Store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(dsn).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id BIGSERIAL PRIMARY KEY,
            type_id TEXT NOT NULL,
            name TEXT NOT NULL,
            schedule TEXT NOT NULL DEFAULT 'never',
            disabled BOOLEAN NOT NULL DEFAULT FALSE,
            deactivated BOOLEAN NOT NULL DEFAULT FALSE,
            last_checked_message_id BIGINT,
            last_check_at TIMESTAMPTZ,
            last_receive_at TIMESTAMPTZ,
            options JSONB NOT NULL DEFAULT '{}'::jsonb
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id BIGSERIAL PRIMARY KEY,
            agent_id BIGINT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
            payload JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            expires_at TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS messages_agent_id_id_idx
            ON messages (agent_id, id)
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS messages_expires_at_idx
            ON messages (expires_at) WHERE expires_at IS NOT NULL
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS links (
            source_id BIGINT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
            receiver_id BIGINT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
            message_id_at_creation BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (source_id, receiver_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS agent_locks (
            agent_id BIGINT PRIMARY KEY REFERENCES agents(id) ON DELETE CASCADE,
            locked_at TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            kind JSONB NOT NULL,
            queue TEXT NOT NULL,
            priority INT NOT NULL DEFAULT 0,
            run_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            attempts INT NOT NULL DEFAULT 0,
            max_attempts INT NOT NULL DEFAULT 5,
            last_error TEXT,
            failed_at TIMESTAMPTZ,
            locked_by UUID,
            locked_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS jobs_claim_idx
            ON jobs (queue, priority, run_at) WHERE failed_at IS NULL
        "#,
    ];
    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn agent_from_row(row: &PgRow) -> StoreResult<Agent> {
    let schedule_name: String = row.get("schedule");
    let schedule = AgentSchedule::parse(&schedule_name)
        .ok_or_else(|| StoreError::Message(format!("unknown schedule: {schedule_name}")))?;
    Ok(Agent {
        id: AgentId(row.get("id")),
        type_id: row.get("type_id"),
        name: row.get("name"),
        schedule,
        disabled: row.get("disabled"),
        deactivated: row.get("deactivated"),
        last_checked_message_id: row
            .get::<Option<i64>, _>("last_checked_message_id")
            .map(MessageId),
        last_check_at: row.get("last_check_at"),
        last_receive_at: row.get("last_receive_at"),
        options: row.get("options"),
    })
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let kind: JobKind = serde_json::from_value(row.get::<Value, _>("kind"))?;
    Ok(Job {
        id: JobId(row.get("id")),
        kind,
        queue: row.get("queue"),
        priority: row.get("priority"),
        run_at: row.get("run_at"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        last_error: row.get("last_error"),
        failed_at: row.get("failed_at"),
        locked_by: row.get("locked_by"),
        locked_at: row.get("locked_at"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl AgentRegistry for PostgresStore {
    async fn get_agent(&self, id: AgentId) -> StoreResult<Option<Agent>> {
        let row = sqlx::query(
            r#"
            SELECT id, type_id, name, schedule, disabled, deactivated,
                   last_checked_message_id, last_check_at, last_receive_at, options
            FROM agents
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn agents_due_for_schedule(&self, schedule: AgentSchedule) -> StoreResult<Vec<AgentId>> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM agents
            WHERE schedule = $1 AND NOT disabled AND NOT deactivated
            ORDER BY id
            "#,
        )
        .bind(schedule.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| AgentId(row.get("id"))).collect())
    }

    async fn mark_agent_checked(&self, id: AgentId, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET last_check_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }

    async fn mark_agent_received(&self, id: AgentId, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET last_receive_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("agent {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn append_message(
        &self,
        agent_id: AgentId,
        payload: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<MessageId> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages (agent_id, payload, expires_at)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(agent_id.0)
        .bind(payload)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(row.get("id")))
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT id, agent_id, payload, created_at, expires_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Message {
            id: MessageId(row.get("id")),
            agent_id: AgentId(row.get("agent_id")),
            payload: row.get("payload"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn delete_expired_messages(&self, now: DateTime<Utc>, batch: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM messages
            WHERE id IN (
                SELECT id FROM messages
                WHERE expires_at IS NOT NULL AND expires_at <= $1
                LIMIT $2
            )
            "#,
        )
        .bind(now)
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LinkGraph for PostgresStore {
    async fn links(&self) -> StoreResult<Vec<Link>> {
        let rows = sqlx::query("SELECT source_id, receiver_id, message_id_at_creation FROM links")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Link {
                source_id: AgentId(row.get("source_id")),
                receiver_id: AgentId(row.get("receiver_id")),
                message_id_at_creation: MessageId(row.get("message_id_at_creation")),
            })
            .collect())
    }
}

#[async_trait]
impl AgentLockStore for PostgresStore {
    async fn try_acquire_lock(
        &self,
        agent_id: AgentId,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> StoreResult<bool> {
        let stale_before = now - stale_after;
        let result = sqlx::query(
            r#"
            INSERT INTO agent_locks (agent_id, locked_at)
            VALUES ($1, $2)
            ON CONFLICT (agent_id) DO UPDATE SET locked_at = EXCLUDED.locked_at
            WHERE agent_locks.locked_at IS NULL OR agent_locks.locked_at < $3
            "#,
        )
        .bind(agent_id.0)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, agent_id: AgentId) -> StoreResult<()> {
        sqlx::query("UPDATE agent_locks SET locked_at = NULL WHERE agent_id = $1")
            .bind(agent_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DispatchQueue for PostgresStore {
    async fn enqueue_job(
        &self,
        kind: JobKind,
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> StoreResult<JobId> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (kind, queue, run_at, max_attempts)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(serde_json::to_value(kind)?)
        .bind(kind.queue())
        .bind(run_at)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;
        Ok(JobId(row.get("id")))
    }

    async fn claim_next_job(
        &self,
        worker: Uuid,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> StoreResult<Option<Job>> {
        let reclaim_before = now - claim_timeout;
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_by = $1, locked_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE failed_at IS NULL
                  AND run_at <= $2
                  AND (locked_at IS NULL OR locked_at < $3)
                ORDER BY priority, run_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, queue, priority, run_at, attempts, max_attempts,
                      last_error, failed_at, locked_by, locked_at, created_at
            "#,
        )
        .bind(worker)
        .bind(now)
        .bind(reclaim_before)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete_job(&self, id: JobId) -> StoreResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_job(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1, last_error = $2, run_at = $3,
                locked_by = NULL, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(error)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn mark_job_failed(&self, id: JobId, error: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1, last_error = $2, failed_at = now(),
                locked_by = NULL, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn release_job(&self, id: JobId, run_at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET run_at = $2, locked_by = NULL, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn count_pending_jobs(&self, queue: &str) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS pending FROM jobs WHERE queue = $1 AND failed_at IS NULL",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("pending"))
    }

    async fn prune_failed_jobs(&self, keep: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE failed_at IS NOT NULL
              AND id NOT IN (
                SELECT id FROM jobs
                WHERE failed_at IS NOT NULL
                ORDER BY failed_at DESC
                LIMIT $1
              )
            "#,
        )
        .bind(keep.max(0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn delivery_candidates(&self) -> StoreResult<Vec<DeliveryCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT l.source_id, s.type_id AS source_type,
                   l.receiver_id, r.type_id AS receiver_type,
                   m.id AS message_id
            FROM links l
            JOIN agents s ON s.id = l.source_id
            JOIN agents r ON r.id = l.receiver_id
            JOIN messages m ON m.agent_id = l.source_id
            WHERE m.id > l.message_id_at_creation
              AND NOT r.disabled AND NOT r.deactivated
              AND (r.last_checked_message_id IS NULL
                   OR m.id > r.last_checked_message_id)
            ORDER BY l.receiver_id, m.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| DeliveryCandidate {
                source_id: AgentId(row.get("source_id")),
                source_type: row.get("source_type"),
                receiver_id: AgentId(row.get("receiver_id")),
                receiver_type: row.get("receiver_type"),
                message_id: MessageId(row.get("message_id")),
            })
            .collect())
    }

    async fn dispatch_deliveries(
        &self,
        receiver_id: AgentId,
        cursor: MessageId,
        message_ids: &[MessageId],
        run_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        // Cursor first, enqueues second, one transaction. The commit
        // makes both visible together; losing the transaction loses
        // both, which preserves at-most-once delivery.
        sqlx::query(
            r#"
            UPDATE agents
            SET last_checked_message_id = $2
            WHERE id = $1
              AND (last_checked_message_id IS NULL OR last_checked_message_id < $2)
            "#,
        )
        .bind(receiver_id.0)
        .bind(cursor.0)
        .execute(&mut *tx)
        .await?;

        if !message_ids.is_empty() {
            let mut jobs = Vec::with_capacity(message_ids.len());
            for message_id in message_ids {
                let kind = JobKind::AgentReceive {
                    agent_id: receiver_id,
                    message_id: *message_id,
                };
                jobs.push((serde_json::to_value(kind)?, kind.queue()));
            }
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO jobs (kind, queue, run_at, max_attempts) ");
            builder.push_values(jobs.iter(), |mut row, (kind, queue)| {
                row.push_bind(kind)
                    .push_bind(*queue)
                    .push_bind(run_at)
                    .push_bind(max_attempts);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
