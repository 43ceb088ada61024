//! Admission Gate Library
//!
//! Distributed admission control for a multi-tenant, LLM-backed request
//! service: per-principal and global in-flight limits plus per-second message
//! and tool-call budgets, enforced through a shared counter store.

pub mod admission;
pub mod config;
pub mod metrics;
pub mod metrics_server;

pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionMode, AdmissionRequest, AdmissionResult,
    AdmissionTicket, BlockReason,
};
