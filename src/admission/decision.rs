//! Admission decisions as seen by callers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::config::{AdmissionConfig, AdmissionMode};
use super::ticket::AdmissionTicket;

/// Why a request was (or would have been) blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    UserInflight,
    GlobalInflight,
    GlobalMsgRate,
    GlobalToolRate,
    RedisUnavailable,
    /// Reserved; ticket write failures are reported as `RedisUnavailable`
    TicketCreateFailed,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::UserInflight => "user_inflight",
            BlockReason::GlobalInflight => "global_inflight",
            BlockReason::GlobalMsgRate => "global_msg_rate",
            BlockReason::GlobalToolRate => "global_tool_rate",
            BlockReason::RedisUnavailable => "redis_unavailable",
            BlockReason::TicketCreateFailed => "ticket_create_failed",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionResult {
    /// Whether the caller may proceed
    pub allowed: bool,

    /// Mode the decision was made in
    pub mode: AdmissionMode,

    /// Reservation to release later (enforce mode, admitted)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<AdmissionTicket>,

    /// Violated budget or failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,

    /// Backoff hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    /// Shadow mode only: whether enforce mode would have denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub would_block: Option<bool>,
}

impl AdmissionResult {
    /// Enforce-mode admission holding `ticket`
    pub fn admitted(ticket: AdmissionTicket) -> Self {
        Self {
            allowed: true,
            mode: AdmissionMode::Enforce,
            ticket: Some(ticket),
            reason: None,
            retry_after_ms: None,
            would_block: None,
        }
    }

    /// Enforce-mode denial
    pub fn denied(reason: BlockReason, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            mode: AdmissionMode::Enforce,
            ticket: None,
            reason: Some(reason),
            retry_after_ms: Some(retry_after_ms),
            would_block: None,
        }
    }

    /// Shadow-mode observation; always allowed
    pub fn shadow(reason: Option<BlockReason>, retry_after_ms: u64) -> Self {
        Self {
            allowed: true,
            mode: AdmissionMode::Shadow,
            ticket: None,
            reason,
            retry_after_ms: Some(retry_after_ms),
            would_block: Some(reason.is_some()),
        }
    }

    /// Conservative result when the counter store cannot be used
    pub fn unavailable(mode: AdmissionMode, config: &AdmissionConfig) -> Self {
        match mode {
            AdmissionMode::Shadow => {
                Self::shadow(Some(BlockReason::RedisUnavailable), config.retry_after_ms)
            }
            AdmissionMode::Enforce => {
                Self::denied(BlockReason::RedisUnavailable, config.retry_after_ms)
            }
        }
    }

    /// Label for metrics: `admitted`, `denied`, `would_block` or `observed`
    pub fn outcome(&self) -> &'static str {
        match (self.mode, self.allowed, self.would_block) {
            (AdmissionMode::Enforce, true, _) => "admitted",
            (AdmissionMode::Enforce, false, _) => "denied",
            (AdmissionMode::Shadow, _, Some(true)) => "would_block",
            (AdmissionMode::Shadow, _, _) => "observed",
        }
    }
}
