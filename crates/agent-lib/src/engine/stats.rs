//! Resource-usage samples as emitted by the engine stats stream

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// One decoded sample of the stats stream.
///
/// `cpu_stats`/`precpu_stats` carry a self-contained counter pair, `read` and
/// `preread` are the times at which each side was taken.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsSample {
    #[serde(default)]
    pub read: DateTime<Utc>,
    #[serde(default)]
    pub preread: DateTime<Utc>,
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub blkio_stats: BlkioStats,
    #[serde(default)]
    pub networks: Option<HashMap<String, NetworkStats>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: Option<u64>,
}

/// Cumulative CPU counters in nanoseconds
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub usage_in_kernelmode: u64,
    #[serde(default)]
    pub usage_in_usermode: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub max_usage: u64,
    #[serde(default)]
    pub failcnt: u64,
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlkioStats {
    #[serde(default)]
    pub io_service_bytes_recursive: Option<Vec<BlkioEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlkioEntry {
    #[serde(default)]
    pub major: u64,
    #[serde(default)]
    pub minor: u64,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub value: u64,
}

/// Cumulative per-interface network counters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub rx_errors: u64,
    #[serde(default)]
    pub rx_dropped: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub tx_packets: u64,
    #[serde(default)]
    pub tx_errors: u64,
    #[serde(default)]
    pub tx_dropped: u64,
}
