//! Core data models for the telemetry agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identity metadata of a tracked container, resolved once when it is discovered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub id: String,
    pub name: String,
    pub short_name: String,
    pub service_name: String,
    pub service_id: String,
    pub stack_name: String,
    pub task_id: String,
    pub task_slot: u64,
    pub node_id: String,
    pub role: String,
    pub labels: HashMap<String, String>,
}

/// Identity fields shared by every published record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordHeader {
    pub container_id: String,
    pub container_name: String,
    pub short_name: String,
    pub state: String,
    pub service_name: String,
    pub service_id: String,
    pub task_id: String,
    pub stack_name: String,
    pub node_id: String,
    pub labels: HashMap<String, String>,
}

impl RecordHeader {
    pub fn new(identity: &ContainerIdentity, state: &str) -> Self {
        Self {
            container_id: identity.id.clone(),
            container_name: identity.name.clone(),
            short_name: identity.short_name.clone(),
            state: state.to_string(),
            service_name: identity.service_name.clone(),
            service_id: identity.service_id.clone(),
            task_id: identity.task_id.clone(),
            stack_name: identity.stack_name.clone(),
            node_id: identity.node_id.clone(),
            labels: identity.labels.clone(),
        }
    }
}

/// Record published on the logs topic, one per log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub header: RecordHeader,
    pub message: String,
}

/// Record published on the metrics topic, one per stats sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub header: RecordHeader,
    pub cpu: CpuEntry,
    pub mem: MemoryEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io: Option<IoEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<NetEntry>,
}

/// CPU usage over the sample interval, in percent of one core
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuEntry {
    pub total_usage: f64,
    pub usage_in_kernel_mode: f64,
    pub usage_in_user_mode: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub failcnt: u64,
    pub limit: u64,
    pub max_usage: u64,
    pub usage: u64,
    pub usage_fraction: f64,
}

/// Block I/O bytes transferred since the previous sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IoEntry {
    pub read: u64,
    pub write: u64,
    pub total: u64,
}

/// Network throughput since the previous sample, per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetEntry {
    pub total_bytes: f64,
    pub rx_bytes: f64,
    pub rx_dropped: f64,
    pub rx_errors: f64,
    pub rx_packets: f64,
    pub tx_bytes: f64,
    pub tx_dropped: f64,
    pub tx_errors: f64,
    pub tx_packets: f64,
}
