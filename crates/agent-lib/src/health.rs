//! Liveness tracking for the telemetry agent
//!
//! Liveness means "we are still receiving engine events": the event watcher
//! flips the flag, the HTTP surface reads it. Per-container stream failures do
//! not affect it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Unhealthy,
}

/// Body of the liveness endpoint (informational)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub event_watcher: bool,
}

/// Shared liveness flag, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    events_healthy: Arc<AtomicBool>,
}

impl Liveness {
    /// Create a flag in the unhealthy state; the watcher marks it healthy once subscribed
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_events_healthy(&self, healthy: bool) {
        self.events_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn events_healthy(&self) -> bool {
        self.events_healthy.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthResponse {
        let event_watcher = self.events_healthy();
        let status = if event_watcher {
            ComponentStatus::Healthy
        } else {
            ComponentStatus::Unhealthy
        };
        HealthResponse {
            status,
            event_watcher,
        }
    }
}
