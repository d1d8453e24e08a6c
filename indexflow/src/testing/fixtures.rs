//! Sample records and configurations for tests.

use serde::{Deserialize, Serialize};

use crate::config::SinkConfig;

/// A minimal bibliographic record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    /// Control number.
    pub id: String,
    /// Title.
    pub title: String,
}

impl TestRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// Creates `count` records with ids `rec-1` through `rec-{count}`.
#[must_use]
pub fn numbered_records(count: usize) -> Vec<TestRecord> {
    (1..=count)
        .map(|n| TestRecord::new(format!("rec-{n}"), format!("Title {n}")))
        .collect()
}

/// A sink configuration pointing at a local test core.
#[must_use]
pub fn test_sink_config() -> SinkConfig {
    SinkConfig::new("http://localhost:8983/solr/test")
}
