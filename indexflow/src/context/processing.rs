//! Per-record processing context.

use super::OutputMap;
use crate::steps::HelperCache;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Mutable working state for one input record.
///
/// A context is owned by exactly one thread at a time: the driver builds it,
/// moves it into a transformation task, and the task moves it into the
/// sink. Nothing in it is shared, so no field needs synchronization.
pub struct ProcessingContext<R> {
    position: u64,
    source_record: R,
    /// Output values, keyed by field name.
    pub output: OutputMap,
    /// Scratch space for passing data between steps of the same record.
    pub clipboard: HashMap<String, Value>,
    skip_reason: Option<String>,
    current_step: Option<String>,
    id_field: Arc<str>,
    helpers: OnceLock<Arc<HelperCache>>,
}

impl<R> ProcessingContext<R> {
    /// Creates a context for the record at a 1-based position.
    #[must_use]
    pub fn new(position: u64, source_record: R) -> Self {
        Self {
            position,
            source_record,
            output: OutputMap::new(),
            clipboard: HashMap::new(),
            skip_reason: None,
            current_step: None,
            id_field: Arc::from("id"),
            helpers: OnceLock::new(),
        }
    }

    /// Sets the output field used to identify the record.
    #[must_use]
    pub fn with_id_field(mut self, id_field: Arc<str>) -> Self {
        self.id_field = id_field;
        self
    }

    /// Shares a run-scoped helper cache with this context.
    #[must_use]
    pub fn with_helpers(mut self, helpers: Arc<HelperCache>) -> Self {
        self.helpers = OnceLock::from(helpers);
        self
    }

    /// Returns the 1-based position of the record in its source.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the raw record.
    #[must_use]
    pub fn source_record(&self) -> &R {
        &self.source_record
    }

    /// Marks the record as skipped. The first reason is kept.
    pub fn skip(&mut self, reason: impl Into<String>) {
        if self.skip_reason.is_none() {
            self.skip_reason = Some(reason.into());
        }
    }

    /// Returns true if the record has been marked skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }

    /// Returns the skip reason.
    #[must_use]
    pub fn skip_reason(&self) -> Option<&str> {
        self.skip_reason.as_deref()
    }

    /// Returns the description of the step currently executing.
    #[must_use]
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub(crate) fn set_current_step(&mut self, step: Option<&str>) {
        self.current_step = step.map(str::to_string);
    }

    /// Returns the run-scoped helper cache.
    ///
    /// A context built without [`with_helpers`](Self::with_helpers) gets a
    /// private cache on first use.
    #[must_use]
    pub fn helpers(&self) -> &HelperCache {
        self.helpers.get_or_init(|| Arc::new(HelperCache::new()))
    }

    #[cfg(test)]
    pub(crate) fn has_helpers(&self) -> bool {
        self.helpers.get().is_some()
    }

    /// Returns the record's identifier from the configured id field.
    #[must_use]
    pub fn record_id(&self) -> Option<String> {
        self.output.first(&self.id_field).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Returns a label for log lines, e.g. `record #12 (id: b123)`.
    #[must_use]
    pub fn label(&self) -> String {
        record_label(self.position, self.record_id().as_deref())
    }
}

/// Formats a record label from a position and optional id.
#[must_use]
pub fn record_label(position: u64, record_id: Option<&str>) -> String {
    match record_id {
        Some(id) => format!("record #{position} (id: {id})"),
        None => format!("record #{position}"),
    }
}

impl<R> fmt::Debug for ProcessingContext<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingContext")
            .field("position", &self.position)
            .field("output", &self.output)
            .field("skip_reason", &self.skip_reason)
            .field("current_step", &self.current_step)
            .finish_non_exhaustive()
    }
}
