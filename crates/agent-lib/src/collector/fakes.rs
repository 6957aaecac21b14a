//! In-memory engine and bus used by the collector tests

use super::discovery::SERVICE_NAME_LABEL;
use super::{CollectionConfig, Collector};
use crate::bus::{BusError, MessageBus, LOGS_TOPIC, METRICS_TOPIC};
use crate::engine::{
    ByteStream, ContainerDetails, ContainerEngine, ContainerSummary, EngineError, EngineEvent,
    EventAction, EventFilter, EventSubscription, LogFrames, TaskDetails,
};
use crate::health::Liveness;
use crate::models::{LogEntry, MetricsEntry};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

const STREAM_BUFFER: usize = 64 * 1024;
const WAIT_LIMIT: Duration = Duration::from_secs(3);

/// Poll `condition` until it holds, panicking after a few seconds
pub(crate) async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) fn collector_with(
    engine: Arc<FakeEngine>,
    bus: Arc<RecordingBus>,
    config: CollectionConfig,
) -> Arc<Collector> {
    Arc::new(Collector::new(engine, bus, Liveness::new(), config))
}

type EventSenders = (mpsc::Sender<EngineEvent>, mpsc::Sender<EngineError>);

/// Scriptable container engine.
///
/// Log and stats streams are in-memory pipes; the write halves stay here so
/// a test can feed lines or end a stream.
#[derive(Default)]
pub(crate) struct FakeEngine {
    containers: Mutex<HashMap<String, ContainerDetails>>,
    tasks: Mutex<HashMap<String, TaskDetails>>,
    failing_inspects: Mutex<HashSet<String>>,
    log_writers: tokio::sync::Mutex<HashMap<String, DuplexStream>>,
    stats_writers: tokio::sync::Mutex<HashMap<String, DuplexStream>>,
    log_opens: Mutex<Vec<(String, String)>>,
    stats_opens: Mutex<Vec<String>>,
    events: Mutex<Option<EventSenders>>,
    subscriptions: AtomicUsize,
    fail_subscribe: AtomicBool,
    closed: AtomicBool,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a task container of `service_name`
    pub(crate) fn add_container(&self, id: &str, service_name: &str, state: &str) {
        let mut labels = HashMap::new();
        labels.insert(SERVICE_NAME_LABEL.to_string(), service_name.to_string());

        self.containers.lock().unwrap().insert(
            id.to_string(),
            ContainerDetails {
                id: id.to_string(),
                name: format!("/{service_name}.1.{id}"),
                state: state.to_string(),
                health: String::new(),
                labels,
            },
        );
    }

    pub(crate) fn add_task(&self, task: TaskDetails) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    /// Make `inspect_container` fail for `id`
    pub(crate) fn fail_inspect(&self, id: &str) {
        self.failing_inspects.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// `(container id, since token)` of every log stream opened so far
    pub(crate) fn log_opens(&self) -> Vec<(String, String)> {
        self.log_opens.lock().unwrap().clone()
    }

    pub(crate) fn stats_opens(&self) -> Vec<String> {
        self.stats_opens.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver an event on the current subscription
    pub(crate) async fn send_event(&self, action: EventAction, id: &str) {
        let sender = self
            .events
            .lock()
            .unwrap()
            .as_ref()
            .map(|(events, _)| events.clone())
            .expect("no active event subscription");
        sender
            .send(EngineEvent {
                action,
                container_id: id.to_string(),
            })
            .await
            .unwrap();
    }

    /// Report an error on the current subscription
    pub(crate) async fn fail_events(&self) {
        let sender = self
            .events
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, errors)| errors.clone())
            .expect("no active event subscription");
        sender
            .send(EngineError::Transport("connection reset".to_string()))
            .await
            .unwrap();
    }

    /// Write raw frame bytes to the log stream of `id`, waiting for it to be opened
    pub(crate) async fn write_log(&self, id: &str, data: &[u8]) {
        write_when_open(&self.log_writers, id, data).await;
    }

    /// Write one stats sample, newline-terminated, to the stats stream of `id`
    pub(crate) async fn write_stats(&self, id: &str, sample: &serde_json::Value) {
        let mut line = serde_json::to_vec(sample).unwrap();
        line.push(b'\n');
        write_when_open(&self.stats_writers, id, &line).await;
    }

    /// End the log stream of `id`
    pub(crate) async fn close_logs(&self, id: &str) {
        self.log_writers.lock().await.remove(id);
    }
}

async fn write_when_open(
    writers: &tokio::sync::Mutex<HashMap<String, DuplexStream>>,
    id: &str,
    data: &[u8],
) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(writer) = writers.lock().await.get_mut(id) {
            writer.write_all(data).await.unwrap();
            writer.flush().await.unwrap();
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("stream of {id} was never opened");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn open_pipe(writers: &mut HashMap<String, DuplexStream>, id: &str) -> ByteStream {
    let (writer, reader) = duplex(STREAM_BUFFER);
    writers.insert(id.to_string(), writer);
    Box::new(BufReader::new(reader))
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                state: c.state.clone(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        if self.failing_inspects.lock().unwrap().contains(id) {
            return Err(EngineError::Transport("inspect timed out".to_string()));
        }
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn inspect_task(&self, task_id: &str) -> Result<TaskDetails, EngineError> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))
    }

    async fn subscribe_events(
        &self,
        _filter: &EventFilter,
    ) -> Result<EventSubscription, EngineError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("engine unreachable".to_string()));
        }

        let (events_tx, events) = mpsc::channel(16);
        let (errors_tx, errors) = mpsc::channel(1);
        *self.events.lock().unwrap() = Some((events_tx, errors_tx));
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        Ok(EventSubscription { events, errors })
    }

    async fn open_log_stream(&self, id: &str, since: &str) -> Result<LogFrames, EngineError> {
        self.log_opens
            .lock()
            .unwrap()
            .push((id.to_string(), since.to_string()));
        Ok(LogFrames::new(open_pipe(
            &mut *self.log_writers.lock().await,
            id,
        )))
    }

    async fn open_stats_stream(&self, id: &str) -> Result<ByteStream, EngineError> {
        self.stats_opens.lock().unwrap().push(id.to_string());
        Ok(open_pipe(&mut *self.stats_writers.lock().await, id))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Bus that keeps every published payload
#[derive(Default)]
pub(crate) struct RecordingBus {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
    closed: AtomicBool,
}

impl RecordingBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub(crate) fn logs(&self) -> Vec<LogEntry> {
        self.payloads(LOGS_TOPIC)
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    pub(crate) fn metrics(&self) -> Vec<MetricsEntry> {
        self.payloads(METRICS_TOPIC)
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                message: "bus unavailable".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
