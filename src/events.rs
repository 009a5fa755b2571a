//! Build events and counters.
//!
//! Every terminal build attempt produces one [`BuildEvent`] that is handed to
//! a [`BuildEventSink`]. A sink that fails does not fail the build, but the
//! failure is logged and counted in [`BuilderStats`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::admission::BuildMode;
use crate::error::Result;
use crate::status::BuildStatus;

/// Terminal outcome of a build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum BuildOutcome {
    Status(BuildStatus),
    /// The gate was blocked.
    Cancelled,
    /// Hard failure, e.g. a storage error while installing.
    Failed(String),
}

impl BuildOutcome {
    pub fn status(&self) -> Option<BuildStatus> {
        match self {
            BuildOutcome::Status(status) => Some(*status),
            _ => None,
        }
    }
}

/// One build attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub time: DateTime<Utc>,
    pub table: String,
    pub part_name: String,
    pub index_name: String,
    pub mode: BuildMode,
    pub outcome: BuildOutcome,
    pub duration_ms: u64,
    /// Number of times the built output was re-targeted to a successor part.
    pub install_retries: usize,
    pub indexed_rows: Option<usize>,
}

/// Destination of build events.
pub trait BuildEventSink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: &BuildEvent) -> Result<()>;
}

/// Writes events through the `log` facade.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl BuildEventSink for LogEventSink {
    fn record(&self, event: &BuildEvent) -> Result<()> {
        let target = format!(
            "{}.{} on {} ({} mode, {} ms)",
            event.table, event.index_name, event.part_name, event.mode, event.duration_ms
        );
        match &event.outcome {
            BuildOutcome::Status(BuildStatus::Success) => info!(
                "built vector index {target}: {} rows",
                event.indexed_rows.unwrap_or(0)
            ),
            BuildOutcome::Status(status) if status.is_error() => {
                warn!("vector index build {target} finished with {status}")
            }
            BuildOutcome::Status(status) => debug!("vector index build {target}: {status}"),
            BuildOutcome::Cancelled => info!("vector index build {target} cancelled"),
            BuildOutcome::Failed(reason) => error!("vector index build {target} failed: {reason}"),
        }
        Ok(())
    }
}

/// Keeps the most recent events in memory.
#[derive(Debug)]
pub struct MemoryEventSink {
    capacity: usize,
    events: Mutex<VecDeque<BuildEvent>>,
}

impl MemoryEventSink {
    pub fn new(capacity: usize) -> Self {
        MemoryEventSink {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn count(&self, outcome: &BuildOutcome) -> usize {
        self.events.lock().iter().filter(|e| &e.outcome == outcome).count()
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl BuildEventSink for MemoryEventSink {
    fn record(&self, event: &BuildEvent) -> Result<()> {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }
}

/// Counters of build attempts and outcomes.
#[derive(Debug, Default)]
pub struct BuilderStats {
    attempts: AtomicU64,
    statuses: [AtomicU64; 7],
    cancelled: AtomicU64,
    failed: AtomicU64,
    sink_failures: AtomicU64,
}

/// Point-in-time copy of [`BuilderStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub no_data_part: u64,
    pub success: u64,
    pub build_fail: u64,
    pub meta_error: u64,
    pub misconfigured: u64,
    pub build_skipped: u64,
    pub build_retry: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub sink_failures: u64,
}

impl BuilderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, outcome: &BuildOutcome) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match outcome {
            BuildOutcome::Status(status) => {
                self.statuses[status.ordinal()].fetch_add(1, Ordering::Relaxed);
            }
            BuildOutcome::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            BuildOutcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, status: BuildStatus) -> u64 {
        self.statuses[status.ordinal()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let status = |s: BuildStatus| self.count(s);
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            no_data_part: status(BuildStatus::NoDataPart),
            success: status(BuildStatus::Success),
            build_fail: status(BuildStatus::BuildFail),
            meta_error: status(BuildStatus::MetaError),
            misconfigured: status(BuildStatus::Misconfigured),
            build_skipped: status(BuildStatus::BuildSkipped),
            build_retry: status(BuildStatus::BuildRetry),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: BuildOutcome) -> BuildEvent {
        BuildEvent {
            time: Utc::now(),
            table: "t".to_string(),
            part_name: "all_1_1_0".to_string(),
            index_name: "v1".to_string(),
            mode: BuildMode::Fast,
            outcome,
            duration_ms: 1,
            install_retries: 0,
            indexed_rows: None,
        }
    }

    #[test]
    fn test_memory_sink_capacity() {
        let sink = MemoryEventSink::new(2);
        for _ in 0..3 {
            sink.record(&event(BuildOutcome::Cancelled)).unwrap();
        }
        sink.record(&event(BuildOutcome::Status(BuildStatus::Success)))
            .unwrap();
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.count(&BuildOutcome::Cancelled), 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = BuilderStats::new();
        stats.record(&BuildOutcome::Status(BuildStatus::Success));
        stats.record(&BuildOutcome::Status(BuildStatus::BuildRetry));
        stats.record(&BuildOutcome::Cancelled);
        stats.record_sink_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.success, 1);
        assert_eq!(snapshot.build_retry, 1);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.sink_failures, 1);
    }

    #[test]
    fn test_event_serializes() {
        let json = serde_json::to_value(event(BuildOutcome::Status(BuildStatus::BuildFail))).unwrap();
        assert_eq!(json["outcome"]["kind"], "status");
        assert_eq!(json["outcome"]["detail"], "BUILD_FAIL");
        assert_eq!(json["mode"], "fast");
    }
}
