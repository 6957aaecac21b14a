//! Counter-to-rate computation for stats samples
//!
//! Pure functions over two snapshots. Nothing here touches a record; the
//! sampler decides when a stored baseline is replaced.
//!
//! | resource | baseline                    | normalisation                |
//! |----------|-----------------------------|------------------------------|
//! | cpu      | pair inside the sample      | delta / (seconds * 1e7)      |
//! | memory   | none                        | usage / limit                |
//! | block io | previous sample             | raw delta                    |
//! | network  | previous sample             | delta / seconds              |

use crate::engine::{MemoryStats, StatsSample};
use crate::models::{CpuEntry, IoEntry, MemoryEntry, NetEntry};
use chrono::{DateTime, Utc};

/// Nanoseconds of CPU time per second of wall time, expressed as a percentage
pub const CPU_SCALE: f64 = 1e7;

/// Outcome of differencing two snapshots
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delta<T> {
    Ready(T),
    /// No previous snapshot to compare against yet
    NoHistory,
    /// The snapshots are not strictly ordered in time
    NonPositiveDuration,
}

impl<T> Delta<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Delta::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Delta::Ready(value) => Some(value),
            _ => None,
        }
    }
}

/// Cumulative block I/O byte counters at one point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IoSnapshot {
    pub taken_at: DateTime<Utc>,
    pub read: u64,
    pub write: u64,
    pub total: u64,
}

impl IoSnapshot {
    pub fn from_sample(sample: &StatsSample) -> Self {
        let mut read = 0u64;
        let mut write = 0u64;
        let mut total = None::<u64>;

        for entry in sample
            .blkio_stats
            .io_service_bytes_recursive
            .iter()
            .flatten()
        {
            if entry.op.eq_ignore_ascii_case("read") {
                read = read.saturating_add(entry.value);
            } else if entry.op.eq_ignore_ascii_case("write") {
                write = write.saturating_add(entry.value);
            } else if entry.op.eq_ignore_ascii_case("total") {
                total = Some(total.unwrap_or(0).saturating_add(entry.value));
            }
        }

        Self {
            taken_at: sample.read,
            read,
            write,
            // Unified cgroup hierarchies report no "total" op
            total: total.unwrap_or_else(|| read.saturating_add(write)),
        }
    }
}

/// Cumulative network counters summed over all interfaces
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
    pub rx_errors: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    pub tx_errors: u64,
    pub tx_packets: u64,
}

impl NetSnapshot {
    pub fn from_sample(sample: &StatsSample) -> Self {
        let mut snapshot = NetSnapshot {
            taken_at: sample.read,
            ..Default::default()
        };

        for net in sample.networks.iter().flat_map(|n| n.values()) {
            snapshot.rx_bytes = snapshot.rx_bytes.saturating_add(net.rx_bytes);
            snapshot.rx_dropped = snapshot.rx_dropped.saturating_add(net.rx_dropped);
            snapshot.rx_errors = snapshot.rx_errors.saturating_add(net.rx_errors);
            snapshot.rx_packets = snapshot.rx_packets.saturating_add(net.rx_packets);
            snapshot.tx_bytes = snapshot.tx_bytes.saturating_add(net.tx_bytes);
            snapshot.tx_dropped = snapshot.tx_dropped.saturating_add(net.tx_dropped);
            snapshot.tx_errors = snapshot.tx_errors.saturating_add(net.tx_errors);
            snapshot.tx_packets = snapshot.tx_packets.saturating_add(net.tx_packets);
        }

        snapshot
    }
}

/// Elapsed seconds from `from` to `to`, negative when `to` is earlier
fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let elapsed = to - from;
    elapsed.num_seconds() as f64 + f64::from(elapsed.subsec_nanos()) / 1e9
}

/// Growth of a cumulative counter; a counter reset yields zero
fn counter_delta(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

/// CPU usage between `precpu_stats` and `cpu_stats` of one sample.
///
/// Kernel and user mode are differenced against the current counter on both
/// sides and therefore always report zero; only `total_usage` carries usage.
pub fn cpu_usage(sample: &StatsSample) -> Delta<CpuEntry> {
    let duration = seconds_between(sample.preread, sample.read);
    if duration <= 0.0 {
        return Delta::NonPositiveDuration;
    }

    let scale = duration * CPU_SCALE;
    let current = &sample.cpu_stats.cpu_usage;
    let previous = &sample.precpu_stats.cpu_usage;

    Delta::Ready(CpuEntry {
        total_usage: counter_delta(previous.total_usage, current.total_usage) as f64 / scale,
        usage_in_kernel_mode: counter_delta(current.usage_in_kernelmode, current.usage_in_kernelmode)
            as f64
            / scale,
        usage_in_user_mode: counter_delta(current.usage_in_usermode, current.usage_in_usermode)
            as f64
            / scale,
    })
}

/// Instantaneous memory figures; no history involved
pub fn memory_usage(stats: &MemoryStats) -> MemoryEntry {
    let usage_fraction = if stats.limit == 0 {
        0.0
    } else {
        stats.usage as f64 / stats.limit as f64
    };

    MemoryEntry {
        failcnt: stats.failcnt,
        limit: stats.limit,
        max_usage: stats.max_usage,
        usage: stats.usage,
        usage_fraction,
    }
}

/// Bytes read and written since `previous`, not divided by the interval
pub fn io_delta(previous: Option<&IoSnapshot>, current: &IoSnapshot) -> Delta<IoEntry> {
    let Some(previous) = previous else {
        return Delta::NoHistory;
    };
    if seconds_between(previous.taken_at, current.taken_at) <= 0.0 {
        return Delta::NonPositiveDuration;
    }

    Delta::Ready(IoEntry {
        read: counter_delta(previous.read, current.read),
        write: counter_delta(previous.write, current.write),
        total: counter_delta(previous.total, current.total),
    })
}

/// Per-second network rates since `previous`
pub fn net_rate(previous: Option<&NetSnapshot>, current: &NetSnapshot) -> Delta<NetEntry> {
    let Some(previous) = previous else {
        return Delta::NoHistory;
    };
    let duration = seconds_between(previous.taken_at, current.taken_at);
    if duration <= 0.0 {
        return Delta::NonPositiveDuration;
    }

    let rate = |prev: u64, curr: u64| counter_delta(prev, curr) as f64 / duration;
    let rx_bytes = rate(previous.rx_bytes, current.rx_bytes);
    let tx_bytes = rate(previous.tx_bytes, current.tx_bytes);

    Delta::Ready(NetEntry {
        total_bytes: rx_bytes + tx_bytes,
        rx_bytes,
        rx_dropped: rate(previous.rx_dropped, current.rx_dropped),
        rx_errors: rate(previous.rx_errors, current.rx_errors),
        rx_packets: rate(previous.rx_packets, current.rx_packets),
        tx_bytes,
        tx_dropped: rate(previous.tx_dropped, current.tx_dropped),
        tx_errors: rate(previous.tx_errors, current.tx_errors),
        tx_packets: rate(previous.tx_packets, current.tx_packets),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BlkioEntry, BlkioStats, CpuStats, CpuUsage, NetworkStats};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cpu_sample(preread: i64, read: i64, previous: u64, current: u64) -> StatsSample {
        StatsSample {
            read: at(read),
            preread: at(preread),
            cpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: current,
                    usage_in_kernelmode: current / 2,
                    usage_in_usermode: current / 2,
                },
                system_cpu_usage: None,
            },
            precpu_stats: CpuStats {
                cpu_usage: CpuUsage {
                    total_usage: previous,
                    usage_in_kernelmode: previous / 2,
                    usage_in_usermode: previous / 2,
                },
                system_cpu_usage: None,
            },
            ..Default::default()
        }
    }

    fn io_snapshot(secs: i64, read: u64, write: u64) -> IoSnapshot {
        IoSnapshot {
            taken_at: at(secs),
            read,
            write,
            total: read + write,
        }
    }

    fn net_snapshot(secs: i64, rx_bytes: u64, tx_bytes: u64) -> NetSnapshot {
        NetSnapshot {
            taken_at: at(secs),
            rx_bytes,
            tx_bytes,
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_normalisation() {
        // 20ms of CPU time over 2s
        let sample = cpu_sample(0, 2, 10_000_000, 30_000_000);
        let cpu = cpu_usage(&sample).ready().unwrap();

        assert!((cpu.total_usage - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_mode_fields_are_zero() {
        let sample = cpu_sample(0, 2, 10_000_000, 30_000_000);
        let cpu = cpu_usage(&sample).ready().unwrap();

        assert_eq!(cpu.usage_in_kernel_mode, 0.0);
        assert_eq!(cpu.usage_in_user_mode, 0.0);
    }

    #[test]
    fn test_cpu_duration_guard() {
        assert_eq!(
            cpu_usage(&cpu_sample(2, 2, 0, 100)),
            Delta::NonPositiveDuration
        );
        assert_eq!(
            cpu_usage(&cpu_sample(5, 2, 0, 100)),
            Delta::NonPositiveDuration
        );
    }

    #[test]
    fn test_net_rate_divides_by_duration() {
        let previous = net_snapshot(0, 1_000, 500);
        let current = net_snapshot(2, 3_000, 900);

        let net = net_rate(Some(&previous), &current).ready().unwrap();
        assert_eq!(net.rx_bytes, 1000.0);
        assert_eq!(net.tx_bytes, 200.0);
        assert_eq!(net.total_bytes, 1200.0);
    }

    #[test]
    fn test_io_delta_is_raw() {
        let previous = io_snapshot(0, 1_000, 0);
        let current = io_snapshot(2, 3_000, 10);

        let io = io_delta(Some(&previous), &current).ready().unwrap();
        assert_eq!(io.read, 2000);
        assert_eq!(io.write, 10);
        assert_eq!(io.total, 2010);
    }

    #[test]
    fn test_duration_guard_for_history_based_deltas() {
        let io = io_snapshot(5, 10, 10);
        let net = net_snapshot(5, 10, 10);

        assert_eq!(io_delta(Some(&io), &io), Delta::NonPositiveDuration);
        assert_eq!(net_rate(Some(&net), &net), Delta::NonPositiveDuration);
        assert_eq!(
            io_delta(Some(&io), &io_snapshot(4, 20, 20)),
            Delta::NonPositiveDuration
        );
        assert_eq!(io_delta(None, &io), Delta::NoHistory);
        assert_eq!(net_rate(None, &net), Delta::NoHistory);
    }

    #[test]
    fn test_counter_reset_yields_zero() {
        let previous = net_snapshot(0, 5_000, 5_000);
        let current = net_snapshot(1, 100, 100);

        let net = net_rate(Some(&previous), &current).ready().unwrap();
        assert_eq!(net.rx_bytes, 0.0);
        assert_eq!(net.total_bytes, 0.0);
    }

    #[test]
    fn test_memory_usage_fraction() {
        let stats = MemoryStats {
            usage: 50,
            max_usage: 80,
            failcnt: 1,
            limit: 200,
        };
        let mem = memory_usage(&stats);
        assert_eq!(mem.usage_fraction, 0.25);
        assert_eq!(mem.max_usage, 80);

        let unlimited = memory_usage(&MemoryStats {
            usage: 50,
            ..Default::default()
        });
        assert_eq!(unlimited.usage_fraction, 0.0);
    }

    #[test]
    fn test_snapshots_from_sample() {
        let mut networks = HashMap::new();
        networks.insert(
            "eth0".to_string(),
            NetworkStats {
                rx_bytes: 10,
                tx_bytes: 1,
                ..Default::default()
            },
        );
        networks.insert(
            "eth1".to_string(),
            NetworkStats {
                rx_bytes: 5,
                tx_bytes: 2,
                ..Default::default()
            },
        );
        let sample = StatsSample {
            read: at(3),
            blkio_stats: BlkioStats {
                io_service_bytes_recursive: Some(vec![
                    BlkioEntry {
                        op: "Read".to_string(),
                        value: 100,
                        ..Default::default()
                    },
                    BlkioEntry {
                        op: "write".to_string(),
                        value: 40,
                        ..Default::default()
                    },
                ]),
            },
            networks: Some(networks),
            ..Default::default()
        };

        let io = IoSnapshot::from_sample(&sample);
        assert_eq!((io.read, io.write, io.total), (100, 40, 140));
        assert_eq!(io.taken_at, at(3));

        let net = NetSnapshot::from_sample(&sample);
        assert_eq!(net.rx_bytes, 15);
        assert_eq!(net.tx_bytes, 3);
    }
}
