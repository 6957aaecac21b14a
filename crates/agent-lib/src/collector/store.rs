//! In-memory record store of tracked containers
//!
//! A record exists while the agent intends to tail and sample that container.
//! The map itself is a `DashMap`; the mutable per-container tracking state
//! (stream handles, error flags, baselines) sits behind a mutex on the record
//! so tasks spawned for it never hold a map shard lock.

use super::differencer::{IoSnapshot, NetSnapshot};
use super::StreamKind;
use crate::models::{ContainerIdentity, RecordHeader};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::debug;

/// Handle of one per-container stream task
#[derive(Debug, Default)]
pub(crate) struct StreamSlot {
    handle: Option<AbortHandle>,
    read_error: bool,
}

impl StreamSlot {
    /// A new task may be started when none is attached or the last one failed
    pub(crate) fn needs_start(&self) -> bool {
        self.handle.is_none() || self.read_error
    }

    pub(crate) fn is_open(&self) -> bool {
        self.handle.is_some() && !self.read_error
    }

    #[cfg(test)]
    pub(crate) fn has_error(&self) -> bool {
        self.read_error
    }

    pub(crate) fn attach(&mut self, handle: AbortHandle) {
        self.handle = Some(handle);
        self.read_error = false;
    }

    /// Detach the handle of a task that is exiting on its own
    fn mark_failed(&mut self) {
        self.handle = None;
        self.read_error = true;
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Mutable tracking state of a record
#[derive(Debug)]
pub(crate) struct Tracking {
    pub(crate) logs: StreamSlot,
    pub(crate) metrics: StreamSlot,
    pub(crate) last_checkpoint_write: Instant,
    pub(crate) previous_io: Option<IoSnapshot>,
    pub(crate) previous_net: Option<NetSnapshot>,
    /// Set once the record has left the store; no stream may start afterwards
    pub(crate) retired: bool,
}

impl Tracking {
    fn new() -> Self {
        Self {
            logs: StreamSlot::default(),
            metrics: StreamSlot::default(),
            last_checkpoint_write: Instant::now(),
            previous_io: None,
            previous_net: None,
            retired: false,
        }
    }

    pub(crate) fn slot_mut(&mut self, kind: StreamKind) -> &mut StreamSlot {
        match kind {
            StreamKind::Logs => &mut self.logs,
            StreamKind::Metrics => &mut self.metrics,
        }
    }
}

/// Tracking entry for one container
#[derive(Debug)]
pub struct ContainerRecord {
    identity: ContainerIdentity,
    state: String,
    health: String,
    tracking: Mutex<Tracking>,
}

impl ContainerRecord {
    pub fn new(identity: ContainerIdentity, state: impl Into<String>, health: impl Into<String>) -> Self {
        Self {
            identity,
            state: state.into(),
            health: health.into(),
            tracking: Mutex::new(Tracking::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &ContainerIdentity {
        &self.identity
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn health(&self) -> &str {
        &self.health
    }

    /// Identity snapshot stamped on published records
    pub fn header(&self) -> RecordHeader {
        RecordHeader::new(&self.identity, &self.state)
    }

    pub fn has_open_log_stream(&self) -> bool {
        self.tracking().logs.is_open()
    }

    pub fn has_open_metrics_stream(&self) -> bool {
        self.tracking().metrics.is_open()
    }

    pub fn is_retired(&self) -> bool {
        self.tracking().retired
    }

    pub(crate) fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true, and restarts the throttle window, when a checkpoint write is due
    pub(crate) fn claim_checkpoint_write(&self, period: std::time::Duration) -> bool {
        let mut tracking = self.tracking();
        let now = Instant::now();
        if now.duration_since(tracking.last_checkpoint_write) < period {
            return false;
        }
        tracking.last_checkpoint_write = now;
        true
    }

    /// Stop all streams of a record that is leaving the store.
    ///
    /// `failed` names the stream whose own task is calling, so it is detached
    /// rather than aborted.
    pub(crate) fn retire(&self, failed: Option<StreamKind>) {
        let mut tracking = self.tracking();
        tracking.retired = true;
        if let Some(kind) = failed {
            tracking.slot_mut(kind).mark_failed();
        }
        tracking.logs.close();
        tracking.metrics.close();
    }

    fn close_streams(&self) {
        let mut tracking = self.tracking();
        tracking.logs.close();
        tracking.metrics.close();
    }
}

/// Registry of tracked containers on the node
#[derive(Debug, Default)]
pub struct ContainerStore {
    records: DashMap<String, Arc<ContainerRecord>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless one with the same id is already tracked.
    ///
    /// Returns false, leaving the existing record untouched, on a duplicate.
    pub fn insert(&self, record: ContainerRecord) -> bool {
        match self.records.entry(record.id().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                debug!(container_id = %record.id(), "Registering container");
                entry.insert(Arc::new(record));
                true
            }
        }
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.records.contains_key(container_id)
    }

    pub fn get(&self, container_id: &str) -> Option<Arc<ContainerRecord>> {
        self.records.get(container_id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, container_id: &str) -> Option<Arc<ContainerRecord>> {
        debug!(container_id = %container_id, "Unregistering container");
        self.records.remove(container_id).map(|(_, v)| v)
    }

    /// Remove `record` only if it is still the one stored under its id
    pub(crate) fn remove_record(&self, record: &Arc<ContainerRecord>) -> bool {
        self.records
            .remove_if(record.id(), |_, current| Arc::ptr_eq(current, record))
            .is_some()
    }

    /// Point-in-time copy of the tracked records; no map lock is held afterwards
    pub fn snapshot(&self) -> Vec<Arc<ContainerRecord>> {
        self.records.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<ContainerRecord>)) {
        for record in self.snapshot() {
            f(&record);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Abort every stream task without removing any record
    pub fn close_all_streams(&self) {
        self.for_each(|record| record.close_streams());
    }
}
