//! Per-container resource sampling

use super::differencer::{
    cpu_usage, io_delta, memory_usage, net_rate, Delta, IoSnapshot, NetSnapshot,
};
use super::store::ContainerRecord;
use super::{Collector, StreamError, StreamKind};
use crate::bus::{encode_record, METRICS_TOPIC};
use crate::engine::StatsSample;
use crate::models::MetricsEntry;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, trace, warn};

/// Replace `baseline` with `current` unless the delta was rejected for its duration
fn advance<S, T>(
    baseline: &mut Option<S>,
    current: S,
    diff: fn(Option<&S>, &S) -> Delta<T>,
) -> Delta<T> {
    let delta = diff(baseline.as_ref(), &current);
    if !matches!(delta, Delta::NonPositiveDuration) {
        *baseline = Some(current);
    }
    delta
}

/// Turn one stats sample into a metrics record, updating the record's baselines.
///
/// Returns `None` when no resource produced a delta, in which case nothing is
/// published for this sample.
pub fn build_metrics_entry(record: &ContainerRecord, sample: &StatsSample) -> Option<MetricsEntry> {
    let cpu = cpu_usage(sample);
    let (io, net) = {
        let mut tracking = record.tracking();
        let io = advance(
            &mut tracking.previous_io,
            IoSnapshot::from_sample(sample),
            io_delta,
        );
        let net = advance(
            &mut tracking.previous_net,
            NetSnapshot::from_sample(sample),
            net_rate,
        );
        (io, net)
    };

    if !cpu.is_ready() && !io.is_ready() && !net.is_ready() {
        return None;
    }

    Some(MetricsEntry {
        timestamp: sample.read,
        header: record.header(),
        cpu: cpu.ready().unwrap_or_default(),
        mem: memory_usage(&sample.memory_stats),
        io: io.ready(),
        net: net.ready(),
    })
}

/// Task body of a metrics sampler; on any failure the container leaves the store
pub(crate) async fn sample_stats(collector: Arc<Collector>, record: Arc<ContainerRecord>) {
    debug!(container_id = %record.id(), "Starting metrics sampler");

    if let Err(e) = follow_stats(&collector, &record).await {
        if matches!(e, StreamError::Publish(_)) {
            collector.metrics.inc_publish_errors();
        }
        warn!(container_id = %record.id(), error = %e, "Stats stream failed, removing container");
        collector
            .handle_stream_failure(&record, StreamKind::Metrics)
            .await;
    }
}

async fn follow_stats(collector: &Collector, record: &ContainerRecord) -> Result<(), StreamError> {
    let mut stream = collector
        .engine
        .open_stats_stream(record.id())
        .await
        .map_err(StreamError::Open)?;

    let mut raw = Vec::with_capacity(4096);
    loop {
        raw.clear();
        if stream.read_until(b'\n', &mut raw).await? == 0 {
            return Err(StreamError::Ended);
        }
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let sample: StatsSample = serde_json::from_slice(&raw)?;
        let Some(entry) = build_metrics_entry(record, &sample) else {
            trace!(container_id = %record.id(), "Not enough history, skipping sample");
            collector.metrics.inc_metric_samples_skipped();
            continue;
        };

        collector
            .bus
            .publish(METRICS_TOPIC, encode_record(&entry)?)
            .await?;
        collector.counters.add_metric_sample();
        collector.metrics.inc_metric_samples_shipped();
    }
}
