//! Container engine collaborator
//!
//! The telemetry core only talks to the engine through [`ContainerEngine`].
//! The HTTP adapter in [`docker`] is what the agent binary wires in; tests use
//! an in-memory fake.

pub mod docker;
mod frames;
mod stats;

pub use docker::DockerEngine;
#[cfg(test)]
pub(crate) use frames::encode_frame;
pub use frames::{LogFrames, FRAME_HEADER_WIDTH};
pub use stats::{
    BlkioEntry, BlkioStats, CpuStats, CpuUsage, MemoryStats, NetworkStats, StatsSample,
};

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;

/// A following byte stream returned by the engine (logs or stats)
pub type ByteStream = Box<dyn AsyncBufRead + Send + Unpin>;

/// Errors reported by the container engine collaborator
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Transport(String),
    #[error("engine returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("failed to decode engine response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("engine stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event stream closed")]
    StreamClosed,
}

/// Container lifecycle actions the agent subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Start,
    Die,
    Stop,
    Kill,
    Destroy,
    Other(String),
}

impl EventAction {
    /// Actions included in the event subscription filter
    pub const SUBSCRIBED: [EventAction; 6] = [
        EventAction::Create,
        EventAction::Start,
        EventAction::Die,
        EventAction::Stop,
        EventAction::Kill,
        EventAction::Destroy,
    ];

    pub fn parse(action: &str) -> Self {
        match action {
            "create" => EventAction::Create,
            "start" => EventAction::Start,
            "die" => EventAction::Die,
            "stop" => EventAction::Stop,
            "kill" => EventAction::Kill,
            "destroy" => EventAction::Destroy,
            other => EventAction::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventAction::Create => "create",
            EventAction::Start => "start",
            EventAction::Die => "die",
            EventAction::Stop => "stop",
            EventAction::Kill => "kill",
            EventAction::Destroy => "destroy",
            EventAction::Other(other) => other,
        }
    }

    /// Returns true for actions after which the container is no longer running
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventAction::Die | EventAction::Stop | EventAction::Kill | EventAction::Destroy
        )
    }
}

/// A container-scoped engine event
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub action: EventAction,
    pub container_id: String,
}

/// Filter passed to [`ContainerEngine::subscribe_events`]
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub kind: String,
    pub actions: Vec<EventAction>,
}

impl EventFilter {
    /// Container-scoped lifecycle events: create, start, die, stop, kill, destroy
    pub fn container_lifecycle() -> Self {
        Self {
            kind: "container".to_string(),
            actions: EventAction::SUBSCRIBED.to_vec(),
        }
    }
}

/// Event and error channels of an active event subscription
pub struct EventSubscription {
    pub events: mpsc::Receiver<EngineEvent>,
    pub errors: mpsc::Receiver<EngineError>,
}

/// Entry of a container listing
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub state: String,
}

/// Result of inspecting a single container
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub id: String,
    /// Engine name, possibly with a leading `/`
    pub name: String,
    pub state: String,
    pub health: String,
    pub labels: HashMap<String, String>,
}

/// Result of inspecting an orchestrator task
#[derive(Debug, Clone, Default)]
pub struct TaskDetails {
    pub id: String,
    pub slot: u64,
    pub node_id: String,
}

/// Operations the telemetry core needs from the container engine.
///
/// Implementations must be safe to call concurrently from many tasks.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError>;

    async fn inspect_task(&self, task_id: &str) -> Result<TaskDetails, EngineError>;

    async fn subscribe_events(&self, filter: &EventFilter)
        -> Result<EventSubscription, EngineError>;

    /// Open a following, timestamped stdout+stderr log stream starting at `since`
    /// (empty token means from the beginning), split into frames
    async fn open_log_stream(&self, id: &str, since: &str) -> Result<LogFrames, EngineError>;

    /// Open a following stream of newline-delimited JSON stats samples
    async fn open_stats_stream(&self, id: &str) -> Result<ByteStream, EngineError>;

    /// Release client resources on shutdown
    async fn close(&self) {}
}
