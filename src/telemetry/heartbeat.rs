//! Heartbeat counters
//!
//! Components add to named counters and record notable error messages as
//! they go; a timer flushes everything as a single structured log event and
//! starts over.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::info;

#[cfg(test)]
use mockall::automock;

/// Counters reported on every heartbeat
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeartbeatMetric {
    /// Admission reviews received
    AdmissionReviewCount,
    /// Admission reviews that passed validation and reached the engine
    AdmissionReviewActionableCount,
    /// Actionable admission reviews the engine failed on
    AdmissionReviewActionableFailedCount,
    /// Calls made to the Kubernetes API server
    ApiServerCallCount,
    /// Failed calls to the Kubernetes API server
    ApiServerCallErrorCount,
    /// Instrumentation resources currently known
    CrCount,
    /// Certificate secret writes
    SecretStoreUpdatedCount,
    /// Failed certificate secret writes
    SecretStoreUpdateFailedCount,
    /// Webhook configuration CA bundle updates
    WebhookConfigUpdatedCount,
    /// Workloads reverted by the cleanup job
    CleanupPatchedCount,
}

impl HeartbeatMetric {
    /// Name as emitted in the heartbeat event
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionReviewCount => "AdmissionReviewCount",
            Self::AdmissionReviewActionableCount => "AdmissionReviewActionableCount",
            Self::AdmissionReviewActionableFailedCount => "AdmissionReviewActionableFailedCount",
            Self::ApiServerCallCount => "ApiServerCallCount",
            Self::ApiServerCallErrorCount => "ApiServerCallErrorCount",
            Self::CrCount => "CrCount",
            Self::SecretStoreUpdatedCount => "SecretStoreUpdatedCount",
            Self::SecretStoreUpdateFailedCount => "SecretStoreUpdateFailedCount",
            Self::WebhookConfigUpdatedCount => "WebhookConfigUpdatedCount",
            Self::CleanupPatchedCount => "CleanupPatchedCount",
        }
    }
}

/// Error logs reported on every heartbeat
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeartbeatLog {
    /// Errors returned by the Kubernetes API server
    ApiServerTopExceptionsEncountered,
    /// Errors hit while handling admission reviews
    AdmissionReviewTopExceptionsEncountered,
}

impl HeartbeatLog {
    /// Name as emitted in the heartbeat event
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiServerTopExceptionsEncountered => "ApiServerTopExceptionsEncountered",
            Self::AdmissionReviewTopExceptionsEncountered => {
                "AdmissionReviewTopExceptionsEncountered"
            }
        }
    }
}

/// Sink for heartbeat telemetry
///
/// Injected into every long-running component so tests can observe what
/// they report.
#[cfg_attr(test, automock)]
pub trait Telemetry: Send + Sync {
    /// Add `value` to a heartbeat counter
    fn add_heartbeat_metric(&self, metric: HeartbeatMetric, value: f64);

    /// Record one occurrence of `entry` in a heartbeat log
    fn append_heartbeat_log(&self, log: HeartbeatLog, entry: &str);
}

/// Values accumulated since the previous flush
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeartbeatSnapshot {
    /// Counter totals by name
    pub metrics: BTreeMap<&'static str, f64>,
    /// Log entries with occurrence counts, most frequent first
    pub logs: BTreeMap<&'static str, Vec<(String, u64)>>,
}

/// Production [`Telemetry`] that reports through `tracing`
pub struct HeartbeatTelemetry {
    metrics: DashMap<HeartbeatMetric, f64>,
    logs: DashMap<HeartbeatLog, BTreeMap<String, u64>>,
    max_log_entries: usize,
}

impl Default for HeartbeatTelemetry {
    fn default() -> Self {
        Self::new(10)
    }
}

impl HeartbeatTelemetry {
    /// Create a sink keeping at most `max_log_entries` distinct entries per log
    pub fn new(max_log_entries: usize) -> Self {
        Self {
            metrics: DashMap::new(),
            logs: DashMap::new(),
            max_log_entries,
        }
    }

    /// Take everything accumulated so far and reset
    pub fn take(&self) -> HeartbeatSnapshot {
        let mut snapshot = HeartbeatSnapshot::default();

        let metric_keys: Vec<HeartbeatMetric> = self.metrics.iter().map(|e| *e.key()).collect();
        for key in metric_keys {
            if let Some((metric, value)) = self.metrics.remove(&key) {
                snapshot.metrics.insert(metric.as_str(), value);
            }
        }

        let log_keys: Vec<HeartbeatLog> = self.logs.iter().map(|e| *e.key()).collect();
        for key in log_keys {
            if let Some((log, entries)) = self.logs.remove(&key) {
                let mut entries: Vec<(String, u64)> = entries.into_iter().collect();
                entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                snapshot.logs.insert(log.as_str(), entries);
            }
        }

        snapshot
    }

    /// Emit one heartbeat event and reset
    pub fn flush(&self) -> HeartbeatSnapshot {
        let snapshot = self.take();
        info!(
            metrics = ?snapshot.metrics,
            logs = ?snapshot.logs,
            "heartbeat"
        );
        snapshot
    }

    /// Flush every `interval` until the runtime shuts down
    pub fn spawn_flush_loop(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.flush();
            }
        })
    }
}

impl Telemetry for HeartbeatTelemetry {
    fn add_heartbeat_metric(&self, metric: HeartbeatMetric, value: f64) {
        *self.metrics.entry(metric).or_insert(0.0) += value;
    }

    fn append_heartbeat_log(&self, log: HeartbeatLog, entry: &str) {
        let mut entries = self.logs.entry(log).or_default();
        if let Some(count) = entries.get_mut(entry) {
            *count += 1;
        } else if entries.len() < self.max_log_entries {
            entries.insert(entry.to_string(), 1);
        }
    }
}
