//! Message bus collaborator
//!
//! The core only needs a publish primitive; delivery guarantees belong to the
//! bus implementation.

mod http;

pub use http::{BusConnectOptions, HttpBus};

use async_trait::async_trait;
use serde::Serialize;

/// Topic receiving log records
pub const LOGS_TOPIC: &str = "telemetry.logs";

/// Topic receiving metrics records
pub const METRICS_TOPIC: &str = "telemetry.metrics";

/// Errors reported by the message bus collaborator
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to message bus at `{url}`: {message}")]
    Connect { url: String, message: String },
    #[error("failed to publish to `{topic}`: {message}")]
    Publish { topic: String, message: String },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message bus connection is closed")]
    Closed,
}

/// Serialize a record into a bus payload
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, BusError> {
    Ok(serde_json::to_vec(record)?)
}

/// Publish side of the message bus.
///
/// Implementations must be safe to call concurrently from many tasks.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Hand a payload to the bus for `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Close the connection; later publishes fail with [`BusError::Closed`]
    async fn close(&self);
}
