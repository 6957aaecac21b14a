//! Poll loop
//!
//! The only scheduled component. Each tick (re)starts the event watcher when
//! it is not healthy and starts a tailer and a sampler for every tracked
//! container lacking one. It never blocks on stream I/O itself.

use super::{sampler, tailer, CollectionConfig, Collector};
use crate::bus::MessageBus;
use crate::engine::ContainerEngine;
use crate::health::Liveness;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Streams started during one tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedStreams {
    pub tailers: usize,
    pub samplers: usize,
}

/// Orchestrates discovery and per-container tasks
pub struct PollLoop {
    collector: Arc<Collector>,
    watcher: Option<JoinHandle<()>>,
    ticks: u64,
}

impl PollLoop {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self {
            collector,
            watcher: None,
            ticks: 0,
        }
    }

    pub fn collector(&self) -> Arc<Collector> {
        Arc::clone(&self.collector)
    }

    /// Run until a shutdown signal arrives
    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(
            interval_ms = self.collector.config.poll_interval.as_millis() as u64,
            "Starting poll loop"
        );

        let mut ticker = interval(self.collector.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down poll loop");
                    break;
                }
            }
        }

        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }

    /// One pass of the loop
    pub async fn tick(&mut self) -> SpawnedStreams {
        self.ensure_event_watcher().await;
        let spawned = self.ensure_streams();

        self.ticks += 1;
        let report_every = self.collector.config.report_every_ticks;
        if report_every > 0 && self.ticks % report_every == 0 {
            self.report();
        }

        spawned
    }

    async fn ensure_event_watcher(&mut self) {
        if self.collector.liveness.events_healthy() {
            return;
        }
        if let Some(previous) = self.watcher.take() {
            previous.abort();
        }

        match self.collector.start_event_watcher().await {
            Ok(handle) => {
                self.watcher = Some(handle);
                // Catch up on containers started while no subscription was active
                if let Err(e) = self.collector.discover_existing_containers().await {
                    warn!(error = %e, "Failed to list containers");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to subscribe to engine events, retrying next tick");
            }
        }
    }

    /// Start the missing tailers and samplers
    fn ensure_streams(&self) -> SpawnedStreams {
        let mut spawned = SpawnedStreams::default();

        self.collector.store.for_each(|record| {
            let mut tracking = record.tracking();
            if tracking.retired {
                return;
            }

            if tracking.logs.needs_start() {
                let task = tokio::spawn(tailer::tail_logs(
                    Arc::clone(&self.collector),
                    Arc::clone(record),
                ));
                tracking.logs.attach(task.abort_handle());
                spawned.tailers += 1;
            }

            if tracking.metrics.needs_start() {
                let task = tokio::spawn(sampler::sample_stats(
                    Arc::clone(&self.collector),
                    Arc::clone(record),
                ));
                tracking.metrics.attach(task.abort_handle());
                spawned.samplers += 1;
            }
        });

        if spawned.tailers > 0 || spawned.samplers > 0 {
            debug!(
                tailers = spawned.tailers,
                samplers = spawned.samplers,
                "Started container streams"
            );
        }

        spawned
    }

    fn report(&self) {
        let (log_lines, metric_samples) = self.collector.counters.take();
        let containers = self.collector.store.len();
        self.collector.metrics.set_containers_tracked(containers as i64);
        self.collector
            .logger
            .log_shipping_report(log_lines, metric_samples, containers);
    }
}

/// Builder for creating the poll loop and its shared collector
pub struct PollLoopBuilder {
    engine: Option<Arc<dyn ContainerEngine>>,
    bus: Option<Arc<dyn MessageBus>>,
    liveness: Liveness,
    config: CollectionConfig,
}

impl PollLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            engine: None,
            bus: None,
            liveness: Liveness::new(),
            config: CollectionConfig::default(),
        }
    }

    /// Set the container engine client
    pub fn engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the message bus client
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Share a liveness flag with the HTTP surface
    pub fn liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the tick interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the checkpoint directory
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = dir.into();
        self
    }

    /// Set the minimum gap between checkpoint writes
    pub fn checkpoint_period(mut self, period: Duration) -> Self {
        self.config.checkpoint_period = period;
        self
    }

    /// Set the removal debounce delay
    pub fn removal_debounce(mut self, delay: Duration) -> Self {
        self.config.removal_debounce = delay;
        self
    }

    /// Set the node id
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.config.node_id = node_id.into();
        self
    }

    /// Build the poll loop
    pub fn build(self) -> Result<PollLoop> {
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("Engine is required"))?;
        let bus = self
            .bus
            .ok_or_else(|| anyhow::anyhow!("Message bus is required"))?;

        let collector = Collector::new(engine, bus, self.liveness, self.config);
        Ok(PollLoop::new(Arc::new(collector)))
    }
}

impl Default for PollLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::fakes::{eventually, FakeEngine, RecordingBus};

    #[test]
    fn test_collection_config_default() {
        let config = CollectionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.checkpoint_period, Duration::from_secs(10));
        assert_eq!(config.removal_debounce, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_poll_loop_builder() {
        let result = PollLoopBuilder::new()
            .engine(Arc::new(FakeEngine::new()))
            .bus(Arc::new(RecordingBus::new()))
            .poll_interval(Duration::from_millis(50))
            .node_id("node-1")
            .build();

        let poll_loop = result.unwrap();
        assert_eq!(poll_loop.collector().config().node_id, "node-1");
    }

    #[tokio::test]
    async fn test_poll_loop_builder_missing_engine() {
        let result = PollLoopBuilder::new()
            .bus(Arc::new(RecordingBus::new()))
            .build();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_ticks_until_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::new());
        engine.add_container("c1", "web", "running");
        let poll_loop = PollLoopBuilder::new()
            .engine(Arc::clone(&engine) as Arc<dyn ContainerEngine>)
            .bus(Arc::new(RecordingBus::new()))
            .checkpoint_dir(dir.path())
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let collector = poll_loop.collector();
        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

        let handle = tokio::spawn(poll_loop.run(shutdown_rx));
        eventually("streams started by the loop", || {
            engine.subscriptions() == 1 && engine.stats_opens().len() == 1
        })
        .await;
        assert!(collector.store().contains("c1"));
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
