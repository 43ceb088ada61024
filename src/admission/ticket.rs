//! Admission tickets and the guard that releases them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::controller::AdmissionController;

/// Receipt for a successful enforce-mode reservation
///
/// Holds the keys needed to give the reservation back. Callers treat it as
/// opaque and hand it to [`AdmissionController::release`] exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionTicket {
    pub ticket_id: String,
    pub ticket_key: String,
    pub global_in_flight_key: String,
    pub user_in_flight_key: String,
}

impl AdmissionTicket {
    /// Whether every key of the ticket lives under `prefix`
    pub fn is_scoped_to(&self, prefix: &str) -> bool {
        let namespace = format!("{}:", prefix);
        [
            &self.ticket_key,
            &self.global_in_flight_key,
            &self.user_in_flight_key,
        ]
        .iter()
        .all(|key| key.starts_with(&namespace))
    }
}

/// Generate a unique ticket id
pub fn new_ticket_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Releases a ticket when the guarded request finishes
///
/// Prefer [`AdmissionGuard::release`]. If the guard is dropped without it
/// (early return, panic, cancelled task) the release is spawned onto the
/// current tokio runtime; outside a runtime the ticket is left to expire.
#[derive(Debug)]
pub struct AdmissionGuard {
    controller: Arc<AdmissionController>,
    ticket: Option<AdmissionTicket>,
}

impl AdmissionGuard {
    pub fn new(controller: Arc<AdmissionController>, ticket: Option<AdmissionTicket>) -> Self {
        Self { controller, ticket }
    }

    /// The guarded ticket, if any
    pub fn ticket(&self) -> Option<&AdmissionTicket> {
        self.ticket.as_ref()
    }

    /// Release the ticket now
    pub async fn release(mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.controller.release(Some(&ticket)).await;
        }
    }

    /// Give up the guard without releasing; the caller takes over the ticket
    pub fn into_ticket(mut self) -> Option<AdmissionTicket> {
        self.ticket.take()
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let controller = Arc::clone(&self.controller);
                handle.spawn(async move {
                    controller.release(Some(&ticket)).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    ticket_id = %ticket.ticket_id,
                    "Admission guard dropped outside a runtime; ticket left to expire"
                );
            }
        }
    }
}
