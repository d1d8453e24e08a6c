//! Single-slot holder for faults captured on worker threads.

use crate::errors::IndexflowError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Thread-safe holder for the first fault captured by a pool.
///
/// The first fault wins and is kept: every `check_and_raise` call returns it
/// again, so a checkpoint that observes it cannot consume it. Later faults
/// are counted and otherwise discarded.
#[derive(Debug, Default)]
pub struct FaultSlot {
    first: Mutex<Option<IndexflowError>>,
    suppressed: AtomicUsize,
}

impl FaultSlot {
    /// Creates an empty fault slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fault. Returns true if it became the captured fault.
    pub fn record(&self, fault: IndexflowError) -> bool {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(fault);
            true
        } else {
            let suppressed = self.suppressed.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(error = %fault, suppressed, "Additional fault after first capture");
            false
        }
    }

    /// Returns the captured fault as an error, if any.
    ///
    /// # Errors
    ///
    /// Returns a clone of the first captured fault.
    pub fn check_and_raise(&self) -> Result<(), IndexflowError> {
        match self.first.lock().as_ref() {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    /// Returns true if a fault has been captured.
    #[must_use]
    pub fn has_fault(&self) -> bool {
        self.first.lock().is_some()
    }

    /// Returns a copy of the captured fault.
    #[must_use]
    pub fn fault(&self) -> Option<IndexflowError> {
        self.first.lock().clone()
    }

    /// Number of faults recorded after the first one.
    #[must_use]
    pub fn suppressed_count(&self) -> usize {
        self.suppressed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_slot_is_ok() {
        let slot = FaultSlot::new();
        assert!(slot.check_and_raise().is_ok());
        assert!(!slot.has_fault());
    }

    #[test]
    fn test_first_fault_wins_and_is_sticky() {
        let slot = FaultSlot::new();
        assert!(slot.record(IndexflowError::Internal("first".to_string())));
        assert!(!slot.record(IndexflowError::Internal("second".to_string())));

        for _ in 0..3 {
            let err = slot.check_and_raise().unwrap_err();
            assert_eq!(err.to_string(), "Internal error: first");
        }
        assert_eq!(slot.suppressed_count(), 1);
    }

    #[test]
    fn test_visible_across_threads() {
        let slot = Arc::new(FaultSlot::new());
        let writer = slot.clone();
        std::thread::spawn(move || {
            writer.record(IndexflowError::Source("gone".to_string()));
        })
        .join()
        .unwrap();

        assert!(matches!(slot.check_and_raise(), Err(IndexflowError::Source(_))));
    }
}
