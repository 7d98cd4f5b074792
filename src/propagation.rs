//! Message propagation: fan newly produced messages out along links.
//!
//! Runs once per scheduler tick. The algorithm only ever looks at
//! messages past each receiver's cursor (and past each link's creation
//! watermark), so a tick never re-scans delivered history.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::{debug, error};

use crate::model::{queues, AgentId, MessageId};
use crate::registry::TypeRegistry;
use crate::store::{DispatchQueue, Store, StoreResult};

/// Summary of one propagation tick, logged at debug level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PropagationReport {
    /// Tick skipped because a previous delivery batch is still in
    /// flight on the propagation queue.
    pub skipped_in_flight: bool,
    /// Receivers whose cursor advanced this tick.
    pub receivers: usize,
    /// Delivery jobs enqueued this tick.
    pub jobs_enqueued: usize,
    /// Join rows dropped because a source or receiver type is not
    /// registered (deferred capability, not an error).
    pub skipped_unknown_type: usize,
}

/// One propagation tick.
///
/// Computes the newly eligible (receiver, message) pairs, then for
/// each receiver advances the cursor to the highest pending id and
/// enqueues one delivery job per message, both inside one store
/// transaction. Per-receiver failures are logged and do not abort the
/// rest of the tick.
pub async fn propagate(
    store: &dyn Store,
    registry: &TypeRegistry,
    max_attempts: i32,
) -> StoreResult<PropagationReport> {
    let mut report = PropagationReport::default();

    // Bound queue growth: if the previous batch has not drained, do
    // nothing this tick. Permanently failed jobs do not count.
    if store.count_pending_jobs(queues::PROPAGATION).await? > 0 {
        report.skipped_in_flight = true;
        debug!("skipping propagation tick, delivery batch still in flight");
        return Ok(report);
    }

    let candidates = store.delivery_candidates().await?;
    if candidates.is_empty() {
        return Ok(report);
    }

    // Group surviving rows by receiver, deduplicating message ids.
    let mut batches: BTreeMap<AgentId, BTreeSet<MessageId>> = BTreeMap::new();
    for candidate in candidates {
        if !registry.contains(&candidate.source_type)
            || !registry.can_receive(&candidate.receiver_type)
        {
            report.skipped_unknown_type += 1;
            continue;
        }
        batches
            .entry(candidate.receiver_id)
            .or_default()
            .insert(candidate.message_id);
    }

    let now = Utc::now();
    for (receiver_id, message_ids) in batches {
        let cursor = *message_ids.last().expect("non-empty batch");
        let ids: Vec<MessageId> = message_ids.into_iter().collect();
        match store
            .dispatch_deliveries(receiver_id, cursor, &ids, now, max_attempts)
            .await
        {
            Ok(()) => {
                debug!(
                    %receiver_id,
                    %cursor,
                    count = ids.len(),
                    "dispatched delivery batch"
                );
                report.receivers += 1;
                report.jobs_enqueued += ids.len();
            }
            Err(err) => {
                metrics::counter!("percolate_propagation_errors_total").increment(1);
                error!(%receiver_id, error = %err, "failed to dispatch delivery batch");
            }
        }
    }

    Ok(report)
}
