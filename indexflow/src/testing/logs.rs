//! In-memory log capture.

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Collects formatted log output in memory.
///
/// Worker pools propagate the dispatcher that is current when they are
/// created, so lines emitted on pool threads are captured as long as the
/// pools are built inside [`LogCapture::run`].
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Creates an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a plain-text subscriber writing into this capture.
    #[must_use]
    pub fn subscriber(&self, max_level: Level) -> impl tracing::Subscriber + Send + Sync + 'static {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(max_level)
            .finish()
    }

    /// Runs `f` with this capture as the default subscriber.
    pub fn run<T>(&self, max_level: Level, f: impl FnOnce() -> T) -> T {
        tracing::subscriber::with_default(self.subscriber(max_level), f)
    }

    /// Returns everything captured so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Returns captured lines.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    /// Counts captured lines containing `needle`.
    #[must_use]
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines().iter().filter(|line| line.contains(needle)).count()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_lines_at_level() {
        let capture = LogCapture::new();
        capture.run(Level::INFO, || {
            tracing::info!("first line");
            tracing::warn!(count = 2, "second line");
            tracing::debug!("filtered out");
        });
        assert_eq!(capture.count_containing("line"), 2);
        assert_eq!(capture.count_containing("filtered"), 0);
        assert!(capture.contents().contains("count=2"));
    }

    #[test]
    fn test_captures_pool_threads() {
        let capture = LogCapture::new();
        capture.run(Level::INFO, || {
            let pool = crate::pool::WorkerPool::new("logs", 2).unwrap();
            for i in 0..4 {
                pool.submit(move || {
                    tracing::info!(i, "from worker");
                    Ok(())
                })
                .unwrap();
            }
            pool.shutdown_and_wait(None);
        });
        assert_eq!(capture.count_containing("from worker"), 4);
    }
}
