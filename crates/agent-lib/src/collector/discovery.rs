//! Container discovery
//!
//! Resolves a container id into a [`ContainerRecord`] by querying the engine
//! once. A failed query skips the container; it is only retried when another
//! lifecycle event names it.

use super::store::ContainerRecord;
use super::Collector;
use crate::engine::{ContainerDetails, ContainerEngine, EngineError};
use crate::models::ContainerIdentity;
use tracing::{debug, info, warn};

pub const SERVICE_NAME_LABEL: &str = "com.docker.swarm.service.name";
pub const SERVICE_ID_LABEL: &str = "com.docker.swarm.service.id";
pub const TASK_ID_LABEL: &str = "com.docker.swarm.task.id";
pub const NODE_ID_LABEL: &str = "com.docker.swarm.node.id";
pub const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";
pub const ROLE_LABEL: &str = "io.telemetry.role";

const RUNNING_STATE: &str = "running";

/// Human-friendly container name.
///
/// Task containers are named `<service>.<slot>.<task id>`; for those the task
/// id is dropped. Any other name is returned without its leading `/`.
pub fn short_name(name: &str, service_name: &str) -> String {
    let name = name.trim_start_matches('/');
    if service_name.is_empty() {
        return name.to_string();
    }

    match name
        .strip_prefix(service_name)
        .and_then(|rest| rest.strip_prefix('.'))
    {
        Some(rest) => match rest.split_once('.') {
            Some((slot, _task_id)) => format!("{service_name}.{slot}"),
            None => name.to_string(),
        },
        None => name.to_string(),
    }
}

/// Build the identity of a container from its inspect result
pub(crate) async fn resolve_identity(
    engine: &dyn ContainerEngine,
    details: &ContainerDetails,
    default_node_id: &str,
) -> ContainerIdentity {
    let label = |key: &str| details.labels.get(key).cloned().unwrap_or_default();

    let name = details.name.trim_start_matches('/').to_string();
    let service_name = label(SERVICE_NAME_LABEL);
    let task_id = label(TASK_ID_LABEL);
    let mut node_id = label(NODE_ID_LABEL);
    let mut task_slot = 0;

    if !task_id.is_empty() {
        match engine.inspect_task(&task_id).await {
            Ok(task) => {
                task_slot = task.slot;
                if node_id.is_empty() {
                    node_id = task.node_id;
                }
            }
            Err(e) => {
                debug!(container_id = %details.id, task_id = %task_id, error = %e, "Task inspect failed");
            }
        }
    }

    if node_id.is_empty() {
        node_id = default_node_id.to_string();
    }

    ContainerIdentity {
        id: details.id.clone(),
        short_name: short_name(&name, &service_name),
        name,
        service_name,
        service_id: label(SERVICE_ID_LABEL),
        stack_name: label(STACK_NAMESPACE_LABEL),
        task_id,
        task_slot,
        node_id,
        role: label(ROLE_LABEL),
        labels: details.labels.clone(),
    }
}

impl Collector {
    /// Start tracking `container_id` unless it is already tracked.
    ///
    /// Returns true when a new record was inserted.
    pub async fn upsert(&self, container_id: &str) -> bool {
        if self.store.contains(container_id) {
            return false;
        }

        let details = match self.engine.inspect_container(container_id).await {
            Ok(details) => details,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Container inspect failed, skipping");
                return false;
            }
        };

        let identity =
            resolve_identity(self.engine.as_ref(), &details, &self.config.node_id).await;
        let (name, service_name) = (identity.name.clone(), identity.service_name.clone());
        let record = ContainerRecord::new(identity, details.state, details.health);

        if !self.store.insert(record) {
            return false;
        }

        self.metrics.set_containers_tracked(self.store.len() as i64);
        self.logger
            .log_container_tracked(container_id, &name, &service_name);
        true
    }

    /// List every container on the node and track the running ones
    pub async fn discover_existing_containers(&self) -> Result<usize, EngineError> {
        let containers = self.engine.list_containers(true).await?;
        let mut added = 0;

        for container in containers
            .iter()
            .filter(|c| c.state == RUNNING_STATE)
        {
            if self.upsert(&container.id).await {
                added += 1;
            }
        }

        info!(
            listed = containers.len(),
            added = added,
            "Discovered existing containers"
        );
        Ok(added)
    }
}
