//! Admission Control Module
//!
//! Distributed admission control for requests that fan out to a shared
//! inference API. Capacity is tracked in a shared counter store so limits hold
//! across every service instance, not just the local process.
//!
//! # Budgets
//!
//! - Concurrent requests per principal
//! - Concurrent requests across all principals
//! - Admissions per wall-clock second
//! - Estimated tool calls per wall-clock second
//!
//! # Modes
//!
//! - **shadow**: read counters and report what enforce mode would do; never
//!   blocks and never mutates state
//! - **enforce**: reserve capacity, deny over-budget requests, hand out a
//!   ticket that must be released when the request finishes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Admission Controller                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐         │
//! │  │ Key Builder │  │ Evaluator   │  │ Tickets     │         │
//! │  │             │  │ shadow/enf. │  │ + release   │         │
//! │  └─────────────┘  └─────────────┘  └─────────────┘         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │        Counter Store (REST Redis / In-Memory)        │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let controller = Arc::new(AdmissionController::from_env());
//! let request = AdmissionRequest::new(user_id).mode(AdmissionMode::Enforce);
//! let (result, guard) = controller.acquire_guard(&request).await;
//! if !result.allowed {
//!     return Err(backoff(result.retry_after_ms));
//! }
//! run_request().await;
//! guard.release().await;
//! ```

pub mod config;
pub mod controller;
pub mod decision;
pub mod error;
pub mod evaluator;
pub mod keys;
pub mod store;
pub mod ticket;
pub mod upstash;

pub use config::{AdmissionConfig, AdmissionMode};
pub use controller::{AdmissionController, AdmissionRequest};
pub use decision::{AdmissionResult, BlockReason};
pub use error::{StoreError, StoreResult};
pub use keys::AdmissionKeys;
pub use store::{CounterStore, MemoryStore, StoreHandle};
pub use ticket::{AdmissionGuard, AdmissionTicket};
pub use upstash::UpstashStore;
