//! Engine event watcher
//!
//! Subscribes once to container lifecycle events. `start` tracks the
//! container, terminal events schedule its removal after a debounce delay so
//! a quick restart of the same id keeps its record. On a subscription error
//! the watcher marks itself unhealthy and exits; the poll loop restarts it.

use super::{Collector, RemovalReason};
use crate::engine::{EngineError, EngineEvent, EventAction, EventFilter, EventSubscription};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

/// Pending delayed removals, keyed by container id
#[derive(Debug, Default)]
pub(crate) struct RemovalDebouncer {
    pending: DashMap<String, (u64, AbortHandle)>,
    generation: AtomicU64,
}

impl RemovalDebouncer {
    /// Schedule removal of `container_id`, replacing any earlier schedule for it
    fn schedule(&self, collector: Arc<Collector>, container_id: String, action: EventAction) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let delay = collector.config.removal_debounce;
        let id = container_id.clone();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            // Wait until the entry below is in place
            if registered_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            // A later event for the same id owns the entry now
            let owned = collector
                .debouncer
                .pending
                .remove_if(&id, |_, (g, _)| *g == generation)
                .is_some();
            if owned {
                collector
                    .remove_container(&id, RemovalReason::Terminated(action))
                    .await;
            }
        });

        if let Some((_, previous)) = self
            .pending
            .insert(container_id, (generation, task.abort_handle()))
        {
            previous.abort();
        }
        let _ = registered_tx.send(());
    }

    /// Cancel a pending removal; returns true if one was pending
    pub(crate) fn cancel(&self, container_id: &str) -> bool {
        match self.pending.remove(container_id) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&self) {
        self.pending.retain(|_, (_, handle)| {
            handle.abort();
            false
        });
    }

    pub(crate) fn is_pending(&self, container_id: &str) -> bool {
        self.pending.contains_key(container_id)
    }
}

impl Collector {
    /// Subscribe to engine events and spawn the watcher task.
    ///
    /// Liveness turns healthy once the subscription is established.
    pub(crate) async fn start_event_watcher(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<()>, EngineError> {
        let subscription = self
            .engine
            .subscribe_events(&EventFilter::container_lifecycle())
            .await?;

        self.liveness.set_events_healthy(true);
        self.metrics.inc_event_watcher_restarts();
        info!("Subscribed to engine events");

        Ok(tokio::spawn(watch_events(Arc::clone(self), subscription)))
    }

    /// React to one lifecycle event
    pub(crate) async fn handle_event(self: &Arc<Self>, event: EngineEvent) {
        let EngineEvent {
            action,
            container_id,
        } = event;

        match action {
            EventAction::Start => {
                if self.debouncer.cancel(&container_id) {
                    debug!(container_id = %container_id, "Restarted within debounce window, keeping record");
                }
                self.upsert(&container_id).await;
            }
            action if action.is_terminal() => {
                debug!(
                    container_id = %container_id,
                    action = action.as_str(),
                    delay_ms = self.config.removal_debounce.as_millis() as u64,
                    "Scheduling container removal"
                );
                self.debouncer
                    .schedule(Arc::clone(self), container_id, action);
            }
            other => {
                debug!(container_id = %container_id, action = other.as_str(), "Ignoring event");
            }
        }
    }
}

async fn watch_events(collector: Arc<Collector>, mut subscription: EventSubscription) {
    let reason = loop {
        tokio::select! {
            biased;

            event = subscription.events.recv() => match event {
                Some(event) => collector.handle_event(event).await,
                None => break closed_reason(&mut subscription.errors),
            },
            error = subscription.errors.recv() => {
                break error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| EngineError::StreamClosed.to_string());
            }
        }
    };

    collector.liveness.set_events_healthy(false);
    collector.logger.log_event_watcher_down(&reason);
}

/// Why the event channel closed: the error queued by the reader, if any
fn closed_reason(errors: &mut mpsc::Receiver<EngineError>) -> String {
    errors
        .try_recv()
        .map(|e| e.to_string())
        .unwrap_or_else(|_| EngineError::StreamClosed.to_string())
}
