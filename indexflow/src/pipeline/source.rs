//! Record sources.

use crate::errors::IndexflowError;
use std::fmt::Display;

/// A sequential supplier of raw records.
///
/// The driver pulls from one thread only, so implementations need not be
/// thread-safe. An error ends the run.
pub trait RecordSource {
    /// The raw record type.
    type Record;

    /// Returns the next record, or `None` when exhausted.
    fn next_record(&mut self) -> Result<Option<Self::Record>, IndexflowError>;
}

impl<I: Iterator> RecordSource for I {
    type Record = I::Item;

    fn next_record(&mut self) -> Result<Option<Self::Record>, IndexflowError> {
        Ok(self.next())
    }
}

/// Adapts an iterator of results; the first error becomes a fatal source
/// fault.
#[derive(Debug)]
pub struct FallibleSource<I> {
    inner: I,
    failed: bool,
}

impl<I> FallibleSource<I> {
    /// Wraps an iterator of results.
    pub fn new(inner: I) -> Self {
        Self { inner, failed: false }
    }
}

impl<I, R, E> RecordSource for FallibleSource<I>
where
    I: Iterator<Item = Result<R, E>>,
    E: Display,
{
    type Record = R;

    fn next_record(&mut self) -> Result<Option<R>, IndexflowError> {
        if self.failed {
            return Ok(None);
        }
        self.inner.next().transpose().map_err(|e| {
            self.failed = true;
            IndexflowError::Source(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterator_is_a_source() {
        let mut source = vec![1, 2].into_iter();
        assert_eq!(source.next_record().unwrap(), Some(1));
        assert_eq!(source.next_record().unwrap(), Some(2));
        assert_eq!(source.next_record().unwrap(), None);
    }

    #[test]
    fn test_fallible_source_stops_at_error() {
        let items: Vec<Result<u32, String>> = vec![Ok(1), Err("truncated record".to_string()), Ok(3)];
        let mut source = FallibleSource::new(items.into_iter());

        assert_eq!(source.next_record().unwrap(), Some(1));
        let err = source.next_record().unwrap_err();
        assert!(matches!(err, IndexflowError::Source(ref m) if m == "truncated record"));
        assert_eq!(source.next_record().unwrap(), None);
    }
}
