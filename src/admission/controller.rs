//! Admission Controller
//!
//! Entry point for callers: decides whether a request may proceed and hands
//! out tickets for enforce-mode reservations.

use std::sync::Arc;

use super::config::{AdmissionConfig, AdmissionMode};
use super::decision::AdmissionResult;
use super::evaluator::{self, Reservation};
use super::keys::AdmissionKeys;
use super::store::{CounterStore, StoreHandle};
use super::ticket::{new_ticket_id, AdmissionGuard, AdmissionTicket};
use crate::metrics;

/// A request for admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Identity the per-principal budget is tracked against
    pub principal_key: String,

    /// Mode override; the configured mode is used when `None`
    pub mode: Option<AdmissionMode>,

    /// Tool calls this request expects to make; negative values count as zero
    pub estimated_tool_calls: Option<i64>,

    /// Evaluation time in epoch milliseconds; defaults to now
    pub now_ms: Option<i64>,
}

impl AdmissionRequest {
    /// Request admission for `principal_key` in the configured mode
    pub fn new(principal_key: impl Into<String>) -> Self {
        Self {
            principal_key: principal_key.into(),
            mode: None,
            estimated_tool_calls: None,
            now_ms: None,
        }
    }

    pub fn mode(mut self, mode: AdmissionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn tool_calls(mut self, estimated: i64) -> Self {
        self.estimated_tool_calls = Some(estimated);
        self
    }

    pub fn at(mut self, now_ms: i64) -> Self {
        self.now_ms = Some(now_ms);
        self
    }
}

/// Admission controller
///
/// Owns every counter mutation. Callers only ever hold tickets.
#[derive(Debug)]
pub struct AdmissionController {
    /// Budgets and mode
    config: AdmissionConfig,

    /// Counter store resolution
    stores: StoreHandle,
}

impl AdmissionController {
    /// Create a controller that connects to the configured store on first use
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            stores: StoreHandle::lazy(),
        }
    }

    /// Create a controller bound to a specific store
    pub fn with_store(config: AdmissionConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            config,
            stores: StoreHandle::pinned(store),
        }
    }

    /// Create with configuration from the environment
    pub fn from_env() -> Self {
        Self::new(AdmissionConfig::from_env())
    }

    /// Create a disabled controller (for testing)
    pub fn disabled() -> Self {
        Self::new(AdmissionConfig::disabled())
    }

    /// Get current configuration
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Decide whether a request may proceed, reserving capacity in enforce mode
    ///
    /// Never fails: store problems are reported as `redis_unavailable`, which
    /// denies in enforce mode and is informational in shadow mode.
    pub async fn check_and_acquire(&self, request: &AdmissionRequest) -> AdmissionResult {
        let mode = request.mode.unwrap_or(self.config.mode);
        let _timer = metrics::CHECK_DURATION_SECONDS
            .with_label_values(&[mode.as_str()])
            .start_timer();

        let result = self.evaluate(request, mode).await;

        metrics::DECISIONS_TOTAL
            .with_label_values(&[
                result.mode.as_str(),
                result.outcome(),
                result.reason.map(|r| r.as_str()).unwrap_or("none"),
            ])
            .inc();

        if !result.allowed || result.would_block == Some(true) {
            tracing::debug!(
                principal = %request.principal_key,
                mode = %result.mode,
                reason = result.reason.map(|r| r.as_str()).unwrap_or("none"),
                "Admission blocked"
            );
        }

        result
    }

    async fn evaluate(&self, request: &AdmissionRequest, mode: AdmissionMode) -> AdmissionResult {
        let config = &self.config;
        if !config.enabled {
            return AdmissionResult::shadow(None, config.retry_after_ms);
        }

        let Some(store) = self.stores.resolve(config) else {
            tracing::warn!(mode = %mode, "No counter store configured for admission control");
            return AdmissionResult::unavailable(mode, config);
        };

        let now_ms = request
            .now_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let tool_calls = request
            .estimated_tool_calls
            .unwrap_or_else(|| i64::from(config.estimated_tool_calls_per_message))
            .clamp(0, i64::from(u32::MAX)) as u32;

        match mode {
            AdmissionMode::Shadow => {
                self.check_shadow(store.as_ref(), &request.principal_key, tool_calls, now_ms)
                    .await
            }
            AdmissionMode::Enforce => {
                self.acquire_enforced(store.as_ref(), &request.principal_key, tool_calls, now_ms)
                    .await
            }
        }
    }

    async fn check_shadow(
        &self,
        store: &dyn CounterStore,
        principal_key: &str,
        tool_calls: u32,
        now_ms: i64,
    ) -> AdmissionResult {
        let keys = AdmissionKeys::build(&self.config.key_prefix, principal_key, now_ms, None);
        let plan = evaluator::plan(&self.config, &keys, tool_calls);

        match evaluator::observe(store, &plan).await {
            Ok(reason) => AdmissionResult::shadow(reason, self.config.retry_after_ms),
            Err(e) => {
                tracing::warn!(error = %e, store = store.name(), "Shadow admission read failed");
                metrics::STORE_ERRORS_TOTAL.with_label_values(&["observe"]).inc();
                AdmissionResult::unavailable(AdmissionMode::Shadow, &self.config)
            }
        }
    }

    async fn acquire_enforced(
        &self,
        store: &dyn CounterStore,
        principal_key: &str,
        tool_calls: u32,
        now_ms: i64,
    ) -> AdmissionResult {
        let ticket_id = new_ticket_id();
        let keys = AdmissionKeys::build(
            &self.config.key_prefix,
            principal_key,
            now_ms,
            Some(&ticket_id),
        );
        let plan = evaluator::plan(&self.config, &keys, tool_calls);

        match evaluator::reserve(store, &plan, &keys.ticket, self.config.ticket_ttl_secs()).await {
            Reservation::Granted => AdmissionResult::admitted(AdmissionTicket {
                ticket_id,
                ticket_key: keys.ticket,
                global_in_flight_key: keys.global_in_flight,
                user_in_flight_key: keys.user_in_flight,
            }),
            Reservation::Denied(reason) => {
                AdmissionResult::denied(reason, self.config.retry_after_ms)
            }
        }
    }

    /// Check admission and wrap any ticket in a guard that releases it
    pub async fn acquire_guard(
        self: &Arc<Self>,
        request: &AdmissionRequest,
    ) -> (AdmissionResult, AdmissionGuard) {
        let mut result = self.check_and_acquire(request).await;
        let guard = AdmissionGuard::new(Arc::clone(self), result.ticket.take());
        result.ticket = guard.ticket().cloned();
        (result, guard)
    }

    /// Give back the capacity held by `ticket`
    ///
    /// Idempotent: only the call that actually removes the ticket marker
    /// decrements the in-flight counters. A ticket whose marker already expired
    /// is a no-op, as is one whose keys fall outside `key_prefix`. Failures are
    /// logged and swallowed.
    pub async fn release(&self, ticket: Option<&AdmissionTicket>) {
        let Some(ticket) = ticket else {
            return;
        };

        if !ticket.is_scoped_to(&self.config.key_prefix) {
            tracing::warn!(
                ticket_id = %ticket.ticket_id,
                prefix = %self.config.key_prefix,
                "Ticket keys outside the admission namespace; refusing release"
            );
            metrics::RELEASES_TOTAL.with_label_values(&["rejected"]).inc();
            return;
        }

        let Some(store) = self.stores.resolve(&self.config) else {
            tracing::debug!(ticket_id = %ticket.ticket_id, "No counter store; skipping release");
            return;
        };

        let removed = match store.del(&ticket.ticket_key).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, ticket_id = %ticket.ticket_id, "Failed to delete ticket marker");
                metrics::STORE_ERRORS_TOTAL.with_label_values(&["release"]).inc();
                return;
            }
        };

        if removed == 0 {
            tracing::debug!(ticket_id = %ticket.ticket_id, "Ticket already released or expired");
            metrics::RELEASES_TOTAL.with_label_values(&["noop"]).inc();
            return;
        }

        evaluator::safe_decrement(store.as_ref(), &ticket.global_in_flight_key, 1).await;
        evaluator::safe_decrement(store.as_ref(), &ticket.user_in_flight_key, 1).await;
        metrics::RELEASES_TOTAL.with_label_values(&["released"]).inc();
    }
}
