//! Agent library for container telemetry
//!
//! This crate provides the core functionality for:
//! - Container discovery from engine lifecycle events
//! - Log tailing with durable checkpoints
//! - Resource sampling with counter-to-rate differencing
//! - Publishing records to a message bus
//! - Liveness and observability

pub mod bus;
pub mod collector;
pub mod engine;
pub mod health;
pub mod models;
pub mod observability;

pub use health::{ComponentStatus, HealthResponse, Liveness};
pub use models::*;
pub use observability::{AgentMetrics, ShipCounters, StructuredLogger};
