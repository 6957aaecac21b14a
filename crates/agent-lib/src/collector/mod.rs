//! Container telemetry collection
//!
//! Discovers containers through engine events, follows each container's log
//! and stats streams in dedicated tasks, and hands the resulting records to
//! the message bus. The [`PollLoop`] is the only scheduled component: every
//! tick it makes sure the event watcher is subscribed and that every tracked
//! container has a running tailer and sampler.

mod checkpoint;
mod differencer;
mod discovery;
mod r#loop;
mod sampler;
mod store;
mod tailer;
mod watcher;

#[cfg(test)]
mod fakes;

pub use checkpoint::CheckpointStore;
pub use differencer::{
    cpu_usage, io_delta, memory_usage, net_rate, Delta, IoSnapshot, NetSnapshot, CPU_SCALE,
};
pub use discovery::{
    short_name, NODE_ID_LABEL, ROLE_LABEL, SERVICE_ID_LABEL, SERVICE_NAME_LABEL,
    STACK_NAMESPACE_LABEL, TASK_ID_LABEL,
};
pub use r#loop::{PollLoop, PollLoopBuilder, SpawnedStreams};
pub use sampler::build_metrics_entry;
pub use store::{ContainerRecord, ContainerStore};
pub use tailer::{LogLine, MIN_LINE_WIDTH};

use crate::bus::{BusError, MessageBus};
use crate::engine::{ContainerEngine, EngineError, EventAction};
use crate::health::Liveness;
use crate::observability::{AgentMetrics, ShipCounters, StructuredLogger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use watcher::RemovalDebouncer;

/// Configuration for the telemetry collector
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Poll loop tick interval (default: 1 second)
    pub poll_interval: Duration,
    /// Directory holding one checkpoint file per container
    pub checkpoint_dir: PathBuf,
    /// Minimum gap between two checkpoint writes of one container (default: 10 seconds)
    pub checkpoint_period: Duration,
    /// Delay between a terminal event and the record removal (default: 5 seconds)
    pub removal_debounce: Duration,
    /// Log and reset the shipping counters every N ticks (default: 60, 0 disables)
    pub report_every_ticks: u64,
    /// Node id used for records whose engine metadata has none
    pub node_id: String,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            checkpoint_dir: PathBuf::from("/var/lib/telemetry-agent/checkpoints"),
            checkpoint_period: Duration::from_secs(10),
            removal_debounce: Duration::from_secs(5),
            report_every_ticks: 60,
            node_id: String::new(),
        }
    }
}

/// Which per-container stream a task follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Logs,
    Metrics,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Logs => "logs",
            StreamKind::Metrics => "metrics",
        }
    }
}

/// Why a container left the record store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// A terminal lifecycle event, after the debounce delay
    Terminated(EventAction),
    /// The log or stats stream of the container failed
    StreamFailed(StreamKind),
}

impl RemovalReason {
    fn describe(&self) -> String {
        match self {
            RemovalReason::Terminated(action) => format!("{} event", action.as_str()),
            RemovalReason::StreamFailed(kind) => format!("{} stream failed", kind.as_str()),
        }
    }
}

/// Why a tailer or sampler stopped
#[derive(Debug, thiserror::Error)]
pub(crate) enum StreamError {
    #[error("failed to open stream: {0}")]
    Open(#[source] EngineError),
    #[error("stream read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("stream ended")]
    Ended,
    #[error("failed to decode stats sample: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Publish(#[from] BusError),
}

/// State shared by the poll loop, the event watcher and every per-container task
pub struct Collector {
    engine: Arc<dyn ContainerEngine>,
    bus: Arc<dyn MessageBus>,
    store: ContainerStore,
    checkpoints: CheckpointStore,
    counters: ShipCounters,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    liveness: Liveness,
    debouncer: RemovalDebouncer,
    config: CollectionConfig,
}

impl Collector {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        bus: Arc<dyn MessageBus>,
        liveness: Liveness,
        config: CollectionConfig,
    ) -> Self {
        let metrics = AgentMetrics::new();
        Self {
            engine,
            bus,
            store: ContainerStore::new(),
            checkpoints: CheckpointStore::new(
                config.checkpoint_dir.clone(),
                config.checkpoint_period,
                metrics.clone(),
            ),
            counters: ShipCounters::new(),
            logger: StructuredLogger::new(config.node_id.clone()),
            metrics,
            liveness,
            debouncer: RemovalDebouncer::default(),
            config,
        }
    }

    pub fn store(&self) -> &ContainerStore {
        &self.store
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn counters(&self) -> &ShipCounters {
        &self.counters
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    /// Drop a container from tracking: stop its streams and delete its checkpoint
    pub async fn remove_container(&self, container_id: &str, reason: RemovalReason) {
        let Some(record) = self.store.remove(container_id) else {
            debug!(container_id = %container_id, "Container already untracked");
            return;
        };
        record.retire(None);
        self.finish_removal(container_id, &reason).await;
    }

    /// Failure path of a tailer or sampler: the whole record goes, not just the stream
    pub(crate) async fn handle_stream_failure(&self, record: &Arc<ContainerRecord>, kind: StreamKind) {
        self.metrics.inc_stream_failures(kind.as_str());
        record.retire(Some(kind));

        // A newer record under the same id belongs to someone else
        if self.store.remove_record(record) {
            self.finish_removal(record.id(), &RemovalReason::StreamFailed(kind))
                .await;
        }
    }

    async fn finish_removal(&self, container_id: &str, reason: &RemovalReason) {
        self.checkpoints.remove(container_id).await;
        self.metrics.set_containers_tracked(self.store.len() as i64);
        self.logger
            .log_container_removed(container_id, &reason.describe());
    }

    /// Stop every per-container task and release the collaborators.
    ///
    /// Records and checkpoints are left in place so a restart resumes tailing.
    pub async fn shutdown(&self) {
        info!(containers = self.store.len(), "Closing container streams");
        self.debouncer.cancel_all();
        self.store.close_all_streams();
        self.liveness.set_events_healthy(false);
        self.engine.close().await;
        self.bus.close().await;
    }
}
