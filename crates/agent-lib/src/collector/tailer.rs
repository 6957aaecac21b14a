//! Per-container log tailing
//!
//! Each frame of the engine log stream is laid out as
//!
//! ```text
//! [8-byte frame header][30-byte RFC3339 timestamp, 9 fractional digits][space][message]
//! ```
//!
//! Frames too short to hold the header, timestamp and separator are dropped.

use super::store::ContainerRecord;
use super::{Collector, StreamError, StreamKind};
use crate::bus::{encode_record, LOGS_TOPIC};
use crate::engine::FRAME_HEADER_WIDTH;
use crate::models::LogEntry;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, trace, warn};

const HEADER_WIDTH: usize = FRAME_HEADER_WIDTH;
const TIMESTAMP_WIDTH: usize = 30;

/// Shortest line (without terminator) that carries a timestamp
pub const MIN_LINE_WIDTH: usize = HEADER_WIDTH + TIMESTAMP_WIDTH + 1;

/// One parsed log line
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogLine {
    /// Parse one frame; `None` for frames shorter than [`MIN_LINE_WIDTH`].
    ///
    /// An unparseable timestamp falls back to the current time.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.len() < MIN_LINE_WIDTH {
            return None;
        }

        let timestamp = std::str::from_utf8(&raw[HEADER_WIDTH..HEADER_WIDTH + TIMESTAMP_WIDTH])
            .ok()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let message = String::from_utf8_lossy(&raw[MIN_LINE_WIDTH..]).into_owned();

        Some(Self { timestamp, message })
    }

    /// Resume token for this line
    pub fn token(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }
}

/// Task body of a log tailer; on any failure the container leaves the store
pub(crate) async fn tail_logs(collector: Arc<Collector>, record: Arc<ContainerRecord>) {
    debug!(container_id = %record.id(), "Starting log tailer");

    if let Err(e) = follow_logs(&collector, &record).await {
        if matches!(e, StreamError::Publish(_)) {
            collector.metrics.inc_publish_errors();
        }
        warn!(container_id = %record.id(), error = %e, "Log stream failed, removing container");
        collector
            .handle_stream_failure(&record, StreamKind::Logs)
            .await;
    }
}

async fn follow_logs(collector: &Collector, record: &ContainerRecord) -> Result<(), StreamError> {
    let token = collector.checkpoints.load(record.id()).await;
    let resume_from = DateTime::parse_from_rfc3339(&token)
        .ok()
        .map(|ts| ts.with_timezone(&Utc));

    let mut frames = collector
        .engine
        .open_log_stream(record.id(), &token)
        .await
        .map_err(StreamError::Open)?;
    debug!(container_id = %record.id(), since = %token, "Log stream opened");

    loop {
        let Some(frame) = frames.next_frame().await? else {
            return Err(StreamError::Ended);
        };

        let Some(line) = LogLine::parse(frame) else {
            trace!(container_id = %record.id(), len = frame.len(), "Discarding short log line");
            continue;
        };

        // The engine may replay lines from before the resume point
        if resume_from.is_some_and(|from| line.timestamp < from) {
            continue;
        }

        let token = line.token();
        let entry = LogEntry {
            timestamp: line.timestamp,
            header: record.header(),
            message: line.message,
        };
        collector
            .bus
            .publish(LOGS_TOPIC, encode_record(&entry)?)
            .await?;

        collector.checkpoints.save(record, &token).await;
        collector.counters.add_log_line();
        collector.metrics.inc_log_lines_shipped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_line(timestamp: &str, message: &str) -> Vec<u8> {
        let mut raw = vec![1, 0, 0, 0, 0, 0, 0, 42];
        raw.extend_from_slice(timestamp.as_bytes());
        raw.push(b' ');
        raw.extend_from_slice(message.as_bytes());
        raw.push(b'\n');
        raw
    }

    #[test]
    fn test_parse_valid_line() {
        let line = LogLine::parse(&raw_line("2024-03-01T10:00:00.000000005Z", "hello world")).unwrap();

        assert_eq!(line.message, "hello world");
        assert_eq!(line.token(), "2024-03-01T10:00:00.000000005Z");
    }

    #[test]
    fn test_parse_discards_short_line() {
        assert!(LogLine::parse(b"short\n").is_none());
        assert!(LogLine::parse(&[0u8; MIN_LINE_WIDTH - 1]).is_none());
        assert!(LogLine::parse(b"").is_none());
    }

    #[test]
    fn test_parse_empty_message() {
        let line = LogLine::parse(&raw_line("2024-03-01T10:00:00.000000005Z", "")).unwrap();
        assert_eq!(line.message, "");
    }

    #[test]
    fn test_parse_bad_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let line = LogLine::parse(&raw_line("not-a-timestamp-but-30-chars!!", "kept")).unwrap();

        assert_eq!(line.message, "kept");
        assert!(line.timestamp >= before);
    }

    #[test]
    fn test_parse_strips_crlf() {
        let mut raw = raw_line("2024-03-01T10:00:00.000000005Z", "windows");
        raw.insert(raw.len() - 1, b'\r');

        assert_eq!(LogLine::parse(&raw).unwrap().message, "windows");
    }
}
