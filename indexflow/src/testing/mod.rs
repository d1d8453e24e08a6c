//! Testing utilities for indexflow pipelines.
//!
//! This module provides:
//! - A scriptable in-memory delivery client
//! - Log capture for counting emitted lines
//! - Sample records and configurations

mod fixtures;
mod logs;
mod mocks;

pub use fixtures::{numbered_records, test_sink_config, TestRecord};
pub use logs::LogCapture;
pub use mocks::{FailingStep, RecordedCall, RecordingDeliveryClient, ScriptedOutcome};
