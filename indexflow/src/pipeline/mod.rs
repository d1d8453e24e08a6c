//! Pipeline execution.
//!
//! This module provides:
//! - Record sources
//! - The pipeline driver and its builder
//! - Throughput tracking and run reports

mod driver;
mod source;
mod stats;

#[cfg(test)]
mod integration_tests;

pub use driver::{PipelineBuilder, PipelineDriver};
pub use source::{FallibleSource, RecordSource};
pub use stats::{records_per_second, RunReport, ThroughputTracker};
