//! HTTP publish adapter for the message bus
//!
//! Publishes each payload with `POST {url}/topics/{topic}`, identifying the
//! agent with `X-Cluster-Id` / `X-Client-Id` headers.

use super::{BusError, MessageBus};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;
use url::Url;

/// Parameters of [`HttpBus::connect`]
#[derive(Debug, Clone)]
pub struct BusConnectOptions {
    pub url: String,
    pub cluster_id: String,
    pub client_id: String,
    pub timeout: Duration,
}

/// Message bus client publishing over HTTP
#[derive(Debug)]
pub struct HttpBus {
    client: reqwest::Client,
    base: Url,
    cluster_id: String,
    client_id: String,
    closed: AtomicBool,
}

impl HttpBus {
    /// Connect to the bus, probing the endpoint once
    pub async fn connect(options: BusConnectOptions) -> Result<Self, BusError> {
        let connect_error = |message: String| BusError::Connect {
            url: options.url.clone(),
            message,
        };

        let base = Url::parse(&options.url).map_err(|e| connect_error(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.timeout)
            .build()
            .map_err(|e| connect_error(e.to_string()))?;

        client
            .get(base.clone())
            .header("X-Cluster-Id", &options.cluster_id)
            .header("X-Client-Id", &options.client_id)
            .send()
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        info!(
            url = %base,
            cluster_id = %options.cluster_id,
            client_id = %options.client_id,
            "Connected to message bus"
        );

        Ok(Self {
            client,
            base,
            cluster_id: options.cluster_id,
            client_id: options.client_id,
            closed: AtomicBool::new(false),
        })
    }

    fn topic_url(&self, topic: &str) -> Result<Url, BusError> {
        let path = format!("topics/{topic}");
        self.base.join(&path).map_err(|e| BusError::Publish {
            topic: topic.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let publish_error = |message: String| BusError::Publish {
            topic: topic.to_string(),
            message,
        };

        let response = self
            .client
            .post(self.topic_url(topic)?)
            .header("X-Cluster-Id", &self.cluster_id)
            .header("X-Client-Id", &self.client_id)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(publish_error(format!("status {}", response.status())));
        }

        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        info!(client_id = %self.client_id, "Message bus connection closed");
    }
}
