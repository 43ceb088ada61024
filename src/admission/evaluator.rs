//! Admission Evaluator
//!
//! Both modes walk the same ordered budget plan:
//!
//! ```text
//! user in-flight -> global in-flight -> message rate -> tool-call rate
//! ```
//!
//! Shadow mode reads each counter and reports the first budget that one more
//! unit would exceed. Enforce mode increments each counter, checks it, and on
//! the first violation (or any store failure) decrements everything it took
//! in this attempt before denying. The store has atomic increments but no
//! multi-key transactions, so the rollback is compensating and best-effort;
//! key TTLs bound whatever a failed rollback leaves behind.

use super::config::AdmissionConfig;
use super::decision::BlockReason;
use super::error::StoreResult;
use super::keys::AdmissionKeys;
use super::store::CounterStore;
use crate::metrics;

/// TTL for rate buckets and for counters clamped back to zero
pub const BUCKET_TTL_SECS: u64 = 5;

/// One budget in the evaluation plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetCheck {
    pub reason: BlockReason,
    pub key: String,
    pub amount: i64,
    pub limit: i64,
    pub ttl_secs: u64,
}

/// Build the ordered budget plan for one request
///
/// The tool-call budget is only included when the request expects tool calls.
pub fn plan(config: &AdmissionConfig, keys: &AdmissionKeys, tool_calls: u32) -> Vec<BudgetCheck> {
    let ticket_ttl = config.ticket_ttl_secs();
    let mut checks = vec![
        BudgetCheck {
            reason: BlockReason::UserInflight,
            key: keys.user_in_flight.clone(),
            amount: 1,
            limit: i64::from(config.user_max_in_flight),
            ttl_secs: ticket_ttl,
        },
        BudgetCheck {
            reason: BlockReason::GlobalInflight,
            key: keys.global_in_flight.clone(),
            amount: 1,
            limit: i64::from(config.global_max_in_flight),
            ttl_secs: ticket_ttl,
        },
        BudgetCheck {
            reason: BlockReason::GlobalMsgRate,
            key: keys.msg_rate.clone(),
            amount: 1,
            limit: i64::from(config.global_max_messages_per_second),
            ttl_secs: BUCKET_TTL_SECS,
        },
    ];

    if tool_calls > 0 {
        checks.push(BudgetCheck {
            reason: BlockReason::GlobalToolRate,
            key: keys.tool_rate.clone(),
            amount: i64::from(tool_calls),
            limit: i64::from(config.global_max_tool_calls_per_second),
            ttl_secs: BUCKET_TTL_SECS,
        });
    }

    checks
}

/// Read-only walk: first budget that would be exceeded, if any
pub async fn observe(store: &dyn CounterStore, plan: &[BudgetCheck]) -> StoreResult<Option<BlockReason>> {
    for check in plan {
        let current = store.get(&check.key).await?.unwrap_or(0);
        if current.saturating_add(check.amount) > check.limit {
            return Ok(Some(check.reason));
        }
    }
    Ok(None)
}

/// Outcome of an enforce-mode reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Every budget was reserved and the ticket marker written
    Granted,
    /// Nothing is held; `reason` names the violated budget or the failure
    Denied(BlockReason),
}

/// Reserve one unit against every budget in `plan`, then write the ticket marker
pub async fn reserve(
    store: &dyn CounterStore,
    plan: &[BudgetCheck],
    ticket_key: &str,
    ticket_ttl_secs: u64,
) -> Reservation {
    let mut taken: Vec<&BudgetCheck> = Vec::with_capacity(plan.len());

    match try_reserve(store, plan, ticket_key, ticket_ttl_secs, &mut taken).await {
        Ok(None) => Reservation::Granted,
        Ok(Some(reason)) => {
            rollback(store, &taken).await;
            Reservation::Denied(reason)
        }
        Err(e) => {
            tracing::warn!(error = %e, store = store.name(), taken = taken.len(), "Admission reservation failed");
            metrics::STORE_ERRORS_TOTAL.with_label_values(&["reserve"]).inc();
            rollback(store, &taken).await;
            Reservation::Denied(BlockReason::RedisUnavailable)
        }
    }
}

async fn try_reserve<'a>(
    store: &dyn CounterStore,
    plan: &'a [BudgetCheck],
    ticket_key: &str,
    ticket_ttl_secs: u64,
    taken: &mut Vec<&'a BudgetCheck>,
) -> StoreResult<Option<BlockReason>> {
    for check in plan {
        let value = if check.amount == 1 {
            store.incr(&check.key).await?
        } else {
            store.incr_by(&check.key, check.amount).await?
        };
        // Held from here on, even if the expiry below fails
        taken.push(check);
        store.expire(&check.key, check.ttl_secs).await?;

        if value > check.limit {
            return Ok(Some(check.reason));
        }
    }

    store.set(ticket_key, 1).await?;
    if let Err(e) = store.expire(ticket_key, ticket_ttl_secs).await {
        // A marker without expiry would outlive its counters
        if let Err(del_err) = store.del(ticket_key).await {
            tracing::warn!(error = %del_err, ticket_key, "Failed to remove ticket marker");
        }
        return Err(e);
    }

    Ok(None)
}

/// Undo reservations in reverse order of acquisition
async fn rollback(store: &dyn CounterStore, taken: &[&BudgetCheck]) {
    for check in taken.iter().rev() {
        safe_decrement(store, &check.key, check.amount).await;
    }
}

/// Decrement `key` by `by`, clamping a negative result back to zero
///
/// Failures are logged and swallowed: the key's TTL is the backstop.
pub async fn safe_decrement(store: &dyn CounterStore, key: &str, by: i64) {
    if by <= 0 {
        return;
    }

    if let Err(e) = decrement_and_clamp(store, key, by).await {
        tracing::warn!(error = %e, key, by, "Best-effort decrement failed");
        metrics::ROLLBACK_FAILURES_TOTAL.inc();
    }
}

async fn decrement_and_clamp(store: &dyn CounterStore, key: &str, by: i64) -> StoreResult<()> {
    let next = if by == 1 {
        store.decr(key).await?
    } else {
        store.decr_by(key, by).await?
    };

    if next < 0 {
        tracing::debug!(key, value = next, "Clamping negative counter");
        store.set(key, 0).await?;
        store.expire(key, BUCKET_TTL_SECS).await?;
    }
    Ok(())
}
