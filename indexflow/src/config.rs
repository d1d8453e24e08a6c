//! Configuration for the pipeline driver and the batching delivery sink.
//!
//! Loading these from files is the embedding application's concern; the
//! types only carry serde defaults and validation.

use crate::errors::{DeliveryErrorKind, IndexflowError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Worker threads for transformation. `0` runs every record on the
    /// driver thread.
    #[serde(default = "default_processing_threads")]
    pub processing_threads: usize,
    /// Emit a progress line every this many records read. `0` disables.
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: u64,
    /// Output field used to identify records in log lines.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Whether a field step that yields no values still creates the field.
    #[serde(default)]
    pub allow_empty_fields: bool,
    /// Delivery sink configuration.
    #[serde(default)]
    pub sink: SinkConfig,
}

fn default_processing_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
}

fn default_log_batch_size() -> u64 {
    100_000
}

fn default_id_field() -> String {
    "id".to_string()
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            processing_threads: default_processing_threads(),
            log_batch_size: default_log_batch_size(),
            id_field: default_id_field(),
            allow_empty_fields: false,
            sink: SinkConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transformation thread count.
    #[must_use]
    pub fn with_processing_threads(mut self, threads: usize) -> Self {
        self.processing_threads = threads;
        self
    }

    /// Sets the progress log interval.
    #[must_use]
    pub fn with_log_batch_size(mut self, records: u64) -> Self {
        self.log_batch_size = records;
        self
    }

    /// Sets the identifying output field.
    #[must_use]
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    /// Sets whether empty field results create the field.
    #[must_use]
    pub fn with_allow_empty_fields(mut self, allow: bool) -> Self {
        self.allow_empty_fields = allow;
        self
    }

    /// Replaces the sink configuration.
    #[must_use]
    pub fn with_sink(mut self, sink: SinkConfig) -> Self {
        self.sink = sink;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` describing the first invalid setting.
    pub fn validate(&self) -> Result<(), IndexflowError> {
        if self.id_field.trim().is_empty() {
            return Err(IndexflowError::usage("id_field must not be empty"));
        }
        self.sink.validate()
    }
}

/// Configuration for the batching delivery sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Base URL of the indexing service.
    #[serde(default)]
    pub url: String,
    /// Explicit update path. `None` auto-detects on first delivery.
    #[serde(default)]
    pub update_path: Option<String>,
    /// Extra query parameters sent with every update request.
    #[serde(default)]
    pub update_params: BTreeMap<String, String>,
    /// Records per delivery call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delivery threads. `0` and `1` both mean one background thread.
    #[serde(default = "default_thread_pool")]
    pub thread_pool: usize,
    /// Skipped records tolerated before the sink fails. `0` tolerates none.
    #[serde(default)]
    pub max_skipped: u64,
    /// Issue a commit request when the sink closes.
    #[serde(default)]
    pub commit_on_close: bool,
    /// Failure kinds that skip records instead of aborting.
    #[serde(default = "default_skippable")]
    pub skippable: HashSet<DeliveryErrorKind>,
    /// Re-send a failed batch one record at a time to isolate bad records.
    #[serde(default = "default_true")]
    pub retry_individually: bool,
    /// Read timeout for delivery calls, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,
    /// Connect timeout for delivery calls, in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    /// Basic auth user.
    #[serde(default)]
    pub basic_auth_user: Option<String>,
    /// Basic auth password.
    #[serde(default)]
    pub basic_auth_password: Option<String>,
}

fn default_batch_size() -> usize {
    100
}

fn default_thread_pool() -> usize {
    1
}

fn default_skippable() -> HashSet<DeliveryErrorKind> {
    [
        DeliveryErrorKind::Rejected,
        DeliveryErrorKind::Connect,
        DeliveryErrorKind::Timeout,
    ]
    .into_iter()
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> f64 {
    10.0
}

fn default_connect_timeout() -> f64 {
    5.0
}

/// Converts a positive number of seconds that fits a `Duration`.
fn seconds(name: &str, secs: f64) -> Result<Duration, IndexflowError> {
    if secs.is_nan() || secs <= 0.0 {
        return Err(IndexflowError::usage(format!("{name} must be positive, got {secs}")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| IndexflowError::usage(format!("{name} is out of range ({secs}): {e}")))
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            update_path: None,
            update_params: BTreeMap::new(),
            batch_size: default_batch_size(),
            thread_pool: default_thread_pool(),
            max_skipped: 0,
            commit_on_close: false,
            skippable: default_skippable(),
            retry_individually: true,
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            basic_auth_user: None,
            basic_auth_password: None,
        }
    }
}

impl SinkConfig {
    /// Creates a sink configuration for the given service URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the delivery thread count.
    #[must_use]
    pub fn with_thread_pool(mut self, threads: usize) -> Self {
        self.thread_pool = threads;
        self
    }

    /// Sets the maximum tolerated skipped records.
    #[must_use]
    pub fn with_max_skipped(mut self, max_skipped: u64) -> Self {
        self.max_skipped = max_skipped;
        self
    }

    /// Sets commit-on-close.
    #[must_use]
    pub fn with_commit_on_close(mut self, commit: bool) -> Self {
        self.commit_on_close = commit;
        self
    }

    /// Pins the update path, disabling auto-detection.
    #[must_use]
    pub fn with_update_path(mut self, path: impl Into<String>) -> Self {
        self.update_path = Some(path.into());
        self
    }

    /// Adds a query parameter to every update request.
    #[must_use]
    pub fn with_update_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.update_params.insert(key.into(), value.into());
        self
    }

    /// Replaces the skippable failure kinds. Connect and timeout failures
    /// stay skippable regardless.
    #[must_use]
    pub fn with_skippable(mut self, kinds: impl IntoIterator<Item = DeliveryErrorKind>) -> Self {
        self.skippable = kinds.into_iter().collect();
        self
    }

    /// Sets whether failed batches are re-sent record by record.
    #[must_use]
    pub fn with_retry_individually(mut self, retry: bool) -> Self {
        self.retry_individually = retry;
        self
    }

    /// Sets the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_secs = seconds;
        self
    }

    /// Sets basic auth credentials.
    #[must_use]
    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth_user = Some(user.into());
        self.basic_auth_password = Some(password.into());
        self
    }

    /// Gets the read timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        seconds("timeout_secs", self.timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_timeout()))
    }

    /// Gets the connect timeout as a Duration.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        seconds("connect_timeout_secs", self.connect_timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_connect_timeout()))
    }

    /// Number of delivery threads actually started.
    #[must_use]
    pub fn effective_thread_pool(&self) -> usize {
        self.thread_pool.max(1)
    }

    /// Whether a failure of this kind skips records instead of aborting.
    #[must_use]
    pub fn is_skippable(&self, kind: DeliveryErrorKind) -> bool {
        DeliveryErrorKind::ALWAYS_SKIPPABLE.contains(&kind) || self.skippable.contains(&kind)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` describing the first invalid setting.
    pub fn validate(&self) -> Result<(), IndexflowError> {
        if self.batch_size == 0 {
            return Err(IndexflowError::usage("batch_size must be at least 1"));
        }
        if let Some(path) = &self.update_path {
            if !path.starts_with('/') {
                return Err(IndexflowError::usage(format!(
                    "update_path must start with '/', got '{path}'"
                )));
            }
        }
        seconds("timeout_secs", self.timeout_secs)?;
        seconds("connect_timeout_secs", self.connect_timeout_secs)?;
        if self.basic_auth_password.is_some() && self.basic_auth_user.is_none() {
            return Err(IndexflowError::usage(
                "basic_auth_password requires basic_auth_user",
            ));
        }
        Ok(())
    }
}
