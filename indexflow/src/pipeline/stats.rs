//! Throughput tracking and run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

/// Records per second over `elapsed`.
#[must_use]
pub fn records_per_second(records: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    records as f64 / secs
}

/// Counts records read and logs progress every `log_batch_size` records.
#[derive(Debug)]
pub struct ThroughputTracker {
    started: Instant,
    batch_started: Instant,
    log_batch_size: u64,
    read: u64,
}

impl ThroughputTracker {
    /// Starts tracking. A `log_batch_size` of 0 disables progress lines.
    #[must_use]
    pub fn new(log_batch_size: u64) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            batch_started: now,
            log_batch_size,
            read: 0,
        }
    }

    /// Counts one record read and returns its 1-based position.
    pub fn record_read(&mut self) -> u64 {
        self.read += 1;
        if self.log_batch_size > 0 && self.read % self.log_batch_size == 0 {
            let batch_rate = format!(
                "{:.1}",
                records_per_second(self.log_batch_size, self.batch_started.elapsed())
            );
            let overall_rate = format!("{:.1}", records_per_second(self.read, self.started.elapsed()));
            info!(
                records = self.read,
                batch_rate = %batch_rate,
                overall_rate = %overall_rate,
                "Read {} records",
                self.read
            );
            self.batch_started = Instant::now();
        }
        self.read
    }

    /// Records read so far.
    #[must_use]
    pub fn read(&self) -> u64 {
        self.read
    }

    /// Time since tracking started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Outcome of a completed pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run id.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Records pulled from the source.
    pub records_read: u64,
    /// Records skipped by a transformation step.
    pub skipped_by_transformation: u64,
    /// Records skipped because delivery failed.
    pub skipped_by_delivery: u64,
    /// Records delivered.
    pub delivered: u64,
    /// Wall time of the run in milliseconds.
    pub duration_ms: f64,
    /// True when no record was skipped by delivery.
    pub success: bool,
}

impl RunReport {
    /// Records per second over the whole run.
    #[must_use]
    pub fn records_per_second(&self) -> f64 {
        records_per_second(self.records_read, Duration::from_secs_f64(self.duration_ms / 1000.0))
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
        map.insert("started_at".to_string(), serde_json::json!(self.started_at.to_rfc3339()));
        map.insert("records_read".to_string(), serde_json::json!(self.records_read));
        map.insert(
            "skipped_by_transformation".to_string(),
            serde_json::json!(self.skipped_by_transformation),
        );
        map.insert("skipped_by_delivery".to_string(), serde_json::json!(self.skipped_by_delivery));
        map.insert("delivered".to_string(), serde_json::json!(self.delivered));
        map.insert("duration_ms".to_string(), serde_json::json!(self.duration_ms));
        map.insert("success".to_string(), serde_json::json!(self.success));
        map
    }
}
