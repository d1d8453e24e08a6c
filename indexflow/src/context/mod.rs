//! Per-record working state.
//!
//! This module provides:
//! - The ordered, multi-valued output mapping a record is transformed into
//! - The processing context that carries a record through its steps

mod output;
mod processing;

pub use output::OutputMap;
pub use processing::{record_label, ProcessingContext};
