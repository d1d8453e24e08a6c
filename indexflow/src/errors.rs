//! Error types for the indexflow pipeline.
//!
//! Every fault that can cross a thread boundary is `Clone`, so a fault
//! captured on a worker can be re-raised on the driving thread at every
//! checkpoint without being consumed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for indexflow operations.
#[derive(Debug, Clone, Error)]
pub enum IndexflowError {
    /// Invalid configuration or lifecycle misuse, raised before work starts.
    #[error("Usage error: {0}")]
    Usage(String),

    /// A transformation step failed unexpectedly.
    #[error("Transformation failed for record #{position}{} in step '{step}': {cause}", record_id_suffix(.record_id))]
    Transformation {
        /// 1-based position of the record in the source.
        position: u64,
        /// Output identifier of the record, if one was populated.
        record_id: Option<String>,
        /// Description of the failing step.
        step: String,
        /// Rendered cause chain.
        cause: String,
    },

    /// A delivery failure that is not in the skippable set.
    #[error("{0}")]
    Delivery(#[from] DeliveryError),

    /// The sink skipped more records than it is allowed to.
    #[error("Delivery aborted: exceeded maximum of {max_skipped} skipped records ({skipped} skipped)")]
    MaxSkippedExceeded {
        /// Configured maximum.
        max_skipped: u64,
        /// Observed skip count when the threshold was crossed.
        skipped: u64,
    },

    /// A task panicked inside a worker pool.
    #[error("Task panicked in pool '{pool}': {message}")]
    TaskPanicked {
        /// Name of the pool.
        pool: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// The record source failed to produce the next record.
    #[error("Source error: {0}")]
    Source(String),

    /// A post-processing hook failed.
    #[error("Post-processing hook '{name}' failed: {cause}")]
    Hook {
        /// Hook name.
        name: String,
        /// Rendered cause chain.
        cause: String,
    },

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn record_id_suffix(record_id: &Option<String>) -> String {
    record_id
        .as_deref()
        .map(|id| format!(" (id: {id})"))
        .unwrap_or_default()
}

impl IndexflowError {
    /// Creates a usage error.
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Returns true if this fault aborts the run.
    ///
    /// Everything except a usage error is raised from a running pipeline, so
    /// this is mostly useful for reporting.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Usage(_))
    }

    /// Converts to a dictionary representation for structured reporting.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        let kind = match self {
            Self::Usage(_) => "usage",
            Self::Transformation { position, record_id, step, .. } => {
                map.insert("position".to_string(), serde_json::json!(position));
                map.insert("record_id".to_string(), serde_json::json!(record_id));
                map.insert("step".to_string(), serde_json::json!(step));
                "transformation"
            }
            Self::Delivery(err) => {
                map.insert("delivery_kind".to_string(), serde_json::json!(err.kind));
                "delivery"
            }
            Self::MaxSkippedExceeded { max_skipped, skipped } => {
                map.insert("max_skipped".to_string(), serde_json::json!(max_skipped));
                map.insert("skipped".to_string(), serde_json::json!(skipped));
                "max_skipped_exceeded"
            }
            Self::TaskPanicked { pool, .. } => {
                map.insert("pool".to_string(), serde_json::json!(pool));
                "task_panicked"
            }
            Self::Source(_) => "source",
            Self::Hook { name, .. } => {
                map.insert("hook".to_string(), serde_json::json!(name));
                "hook"
            }
            Self::Internal(_) => "internal",
        };
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Classification of a failed delivery call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorKind {
    /// The endpoint answered with a non-2xx status.
    Rejected,
    /// The connection could not be established.
    Connect,
    /// The connect or read timeout elapsed.
    Timeout,
    /// Any other transport-level failure.
    Transport,
    /// The request body could not be serialized.
    Serialization,
}

impl DeliveryErrorKind {
    /// Kinds that are skippable regardless of configuration.
    pub const ALWAYS_SKIPPABLE: [Self; 2] = [Self::Connect, Self::Timeout];
}

/// A failed call against the remote indexing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Delivery failed ({kind:?}{}): {message}", status_suffix(.status))]
pub struct DeliveryError {
    /// Failure classification.
    pub kind: DeliveryErrorKind,
    /// HTTP status for `Rejected` failures.
    pub status: Option<u16>,
    /// Human readable detail.
    pub message: String,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(", HTTP {s}")).unwrap_or_default()
}

impl DeliveryError {
    /// Creates a delivery error of the given kind.
    #[must_use]
    pub fn new(kind: DeliveryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Creates a rejection for a non-2xx response.
    #[must_use]
    pub fn rejected(status: u16, body: &str) -> Self {
        Self {
            kind: DeliveryErrorKind::Rejected,
            status: Some(status),
            message: excerpt(body, 200),
        }
    }

    /// Creates a connection failure.
    #[must_use]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::Connect, message)
    }

    /// Creates a timeout failure.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::Timeout, message)
    }

    /// Creates a generic transport failure.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(DeliveryErrorKind::Transport, message)
    }
}

/// Truncates a response body for log lines and error messages.
pub(crate) fn excerpt(body: &str, max_chars: usize) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_skipped_message() {
        let err = IndexflowError::MaxSkippedExceeded {
            max_skipped: 5,
            skipped: 6,
        };
        let msg = err.to_string();
        assert!(msg.contains("exceeded maximum"));
        assert!(msg.contains('5'));
        assert!(msg.contains('6'));
    }

    #[test]
    fn test_transformation_message_with_and_without_id() {
        let with_id = IndexflowError::Transformation {
            position: 3,
            record_id: Some("abc".to_string()),
            step: "to_field title".to_string(),
            cause: "boom".to_string(),
        };
        assert_eq!(
            with_id.to_string(),
            "Transformation failed for record #3 (id: abc) in step 'to_field title': boom"
        );

        let without_id = IndexflowError::Transformation {
            position: 4,
            record_id: None,
            step: "each_record".to_string(),
            cause: "boom".to_string(),
        };
        assert!(without_id.to_string().starts_with("Transformation failed for record #4 in step"));
    }

    #[test]
    fn test_rejected_delivery_error() {
        let err = DeliveryError::rejected(400, "  bad document  ");
        assert_eq!(err.kind, DeliveryErrorKind::Rejected);
        assert_eq!(err.status, Some(400));
        assert_eq!(err.message, "bad document");
        assert!(err.to_string().contains("HTTP 400"));
    }

    #[test]
    fn test_excerpt_truncates() {
        let body = "x".repeat(300);
        let short = excerpt(&body, 10);
        assert_eq!(short, format!("{}...", "x".repeat(10)));
    }

    #[test]
    fn test_error_to_dict() {
        let err = IndexflowError::from(DeliveryError::timeout("read timed out"));
        let dict = err.to_dict();
        assert_eq!(dict.get("type").unwrap(), "delivery");
        assert_eq!(dict.get("delivery_kind").unwrap(), "timeout");
        assert!(err.is_fatal());
        assert!(!IndexflowError::usage("bad").is_fatal());
    }
}
