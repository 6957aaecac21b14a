//! HTTP adapter for the container engine REST API
//!
//! Talks to the engine over TCP (`DOCKER_HOST=tcp://...` style endpoints).
//! Following bodies are exposed as `AsyncBufRead`. Events and stats are read
//! line by line; the log body is demultiplexed into frames.

use super::{
    ByteStream, ContainerDetails, ContainerEngine, ContainerSummary, EngineError, EngineEvent,
    EventAction, EventFilter, EventSubscription, LogFrames, TaskDetails,
};
use async_trait::async_trait;
use chrono::DateTime;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, info};
use url::Url;

/// Buffer size of the event and error channels handed to the watcher
const EVENT_CHANNEL_SIZE: usize = 256;

/// Engine client backed by `reqwest`
#[derive(Debug, Clone)]
pub struct DockerEngine {
    client: reqwest::Client,
    base: Url,
}

impl DockerEngine {
    /// Create a client for the engine listening at `endpoint` (e.g. `http://127.0.0.1:2375`)
    pub fn new(endpoint: &str) -> Result<Self, EngineError> {
        let base = Url::parse(endpoint)
            .map_err(|e| EngineError::Transport(format!("invalid engine url `{endpoint}`: {e}")))?;

        info!(endpoint = %base, "Using container engine endpoint");

        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    fn url(&self, path: &str) -> Result<Url, EngineError> {
        self.base
            .join(path)
            .map_err(|e| EngineError::Transport(format!("invalid engine path `{path}`: {e}")))
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, EngineError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(url.path().to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, EngineError> {
        let body = self.get(url).await?.bytes().await.map_err(transport_error)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_stream(&self, url: Url) -> Result<ByteStream, EngineError> {
        let response = self.get(url).await?;
        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .boxed();

        Ok(Box::new(StreamReader::new(body)))
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut url = self.url("containers/json")?;
        url.query_pairs_mut()
            .append_pair("all", if all { "true" } else { "false" });

        let listing: Vec<ApiContainerSummary> = self.get_json(url).await?;
        Ok(listing
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id,
                state: c.state,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let url = self.url(&format!("containers/{id}/json"))?;
        let inspect: ApiContainerInspect = self.get_json(url).await?;

        Ok(ContainerDetails {
            id: inspect.id,
            name: inspect.name,
            state: inspect.state.status,
            health: inspect
                .state
                .health
                .map(|h| h.status)
                .unwrap_or_default(),
            labels: inspect.config.labels.unwrap_or_default(),
        })
    }

    async fn inspect_task(&self, task_id: &str) -> Result<TaskDetails, EngineError> {
        let url = self.url(&format!("tasks/{task_id}"))?;
        let task: ApiTask = self.get_json(url).await?;

        Ok(TaskDetails {
            id: task.id,
            slot: task.slot,
            node_id: task.node_id,
        })
    }

    async fn subscribe_events(
        &self,
        filter: &EventFilter,
    ) -> Result<EventSubscription, EngineError> {
        let filters = serde_json::json!({
            "type": [filter.kind],
            "event": filter.actions.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
        });
        let mut url = self.url("events")?;
        url.query_pairs_mut()
            .append_pair("filters", &filters.to_string());

        let mut stream = self.get_stream(url).await?;
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (error_tx, errors) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                let error = match stream.read_line(&mut line).await {
                    Ok(0) => EngineError::StreamClosed,
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ApiEvent>(trimmed) {
                            Ok(event) => {
                                let event = EngineEvent {
                                    action: EventAction::parse(&event.action),
                                    container_id: event.actor.id,
                                };
                                if event_tx.send(event).await.is_err() {
                                    debug!("Event receiver dropped, stopping event reader");
                                    return;
                                }
                                continue;
                            }
                            Err(e) => EngineError::Decode(e),
                        }
                    }
                    Err(e) => EngineError::Io(e),
                };
                let _ = error_tx.send(error).await;
                return;
            }
        });

        Ok(EventSubscription { events, errors })
    }

    async fn open_log_stream(&self, id: &str, since: &str) -> Result<LogFrames, EngineError> {
        let mut url = self.url(&format!("containers/{id}/logs"))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("follow", "true")
                .append_pair("timestamps", "true")
                .append_pair("stdout", "true")
                .append_pair("stderr", "true");
            if let Some(since) = since_param(since) {
                query.append_pair("since", &since);
            }
        }

        Ok(LogFrames::new(self.get_stream(url).await?))
    }

    async fn open_stats_stream(&self, id: &str) -> Result<ByteStream, EngineError> {
        let mut url = self.url(&format!("containers/{id}/stats"))?;
        url.query_pairs_mut().append_pair("stream", "true");

        self.get_stream(url).await
    }
}

fn transport_error(err: reqwest::Error) -> EngineError {
    EngineError::Transport(err.to_string())
}

/// Convert an RFC3339 resume token into the engine's `<secs>.<nanos>` form
fn since_param(token: &str) -> Option<String> {
    if token.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(token) {
        Ok(ts) => Some(format!("{}.{:09}", ts.timestamp(), ts.timestamp_subsec_nanos())),
        Err(_) => Some(token.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ApiContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State", default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct ApiContainerInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State", default)]
    state: ApiContainerState,
    #[serde(rename = "Config", default)]
    config: ApiContainerConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ApiContainerState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Health", default)]
    health: Option<ApiHealth>,
}

#[derive(Debug, Deserialize)]
struct ApiHealth {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiContainerConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ApiTask {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Slot", default)]
    slot: u64,
    #[serde(rename = "NodeID", default)]
    node_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor")]
    actor: ApiActor,
}

#[derive(Debug, Deserialize)]
struct ApiActor {
    #[serde(rename = "ID", default)]
    id: String,
}
