//! Batching delivery sink.

use super::{DeliveryClient, UpdateEndpoint};
use crate::config::SinkConfig;
use crate::context::{record_label, ProcessingContext};
use crate::errors::{DeliveryError, DeliveryErrorKind, IndexflowError};
use crate::pool::{FaultSlot, WorkerPool};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkState {
    /// Accepting records.
    Open,
    /// A synchronous flush is in progress.
    Flushing,
    /// A fatal fault occurred; every further call re-raises it.
    Failed,
    /// Closed cleanly.
    Closed,
}

impl SinkState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Flushing => 1,
            Self::Failed => 2,
            Self::Closed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Flushing,
            2 => Self::Failed,
            _ => Self::Closed,
        }
    }
}

/// One transformed record waiting for delivery.
#[derive(Debug, Clone)]
struct BatchEntry {
    position: u64,
    record_id: Option<String>,
    document: Value,
}

impl BatchEntry {
    fn label(&self) -> String {
        record_label(self.position, self.record_id.as_deref())
    }
}

/// State shared between the accepting thread and delivery workers.
struct SinkShared {
    config: SinkConfig,
    client: Arc<dyn DeliveryClient>,
    endpoint: UpdateEndpoint,
    skipped: AtomicU64,
    delivered: AtomicU64,
    calls: AtomicU64,
    state: AtomicU8,
    faults: Arc<FaultSlot>,
}

impl SinkShared {
    fn state(&self) -> SinkState {
        SinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SinkState, to: SinkState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Records the fault, moves to `Failed` and logs once.
    fn fail(&self, fault: IndexflowError) -> IndexflowError {
        self.faults.record(fault.clone());
        self.mark_failed(&fault);
        fault
    }

    fn mark_failed(&self, fault: &IndexflowError) {
        let previous = SinkState::from_u8(self.state.swap(SinkState::Failed.as_u8(), Ordering::SeqCst));
        if previous != SinkState::Failed {
            error!(error = %fault, "Delivery sink failed");
        }
    }

    /// Delivers a batch, falling back to per-record attribution when the
    /// batch as a whole fails with a skippable error.
    fn deliver(&self, batch: Vec<BatchEntry>) -> Result<(), IndexflowError> {
        match self.send(&batch) {
            Ok(()) => {
                self.delivered.fetch_add(batch.len() as u64, Ordering::SeqCst);
                Ok(())
            }
            Err(err) if self.config.is_skippable(err.kind) => {
                if batch.len() > 1 && self.config.retry_individually {
                    warn!(
                        batch_size = batch.len(),
                        error = %err,
                        "Batch delivery failed, resending records one at a time"
                    );
                    for entry in batch {
                        self.deliver_one(entry)?;
                    }
                    Ok(())
                } else {
                    for entry in &batch {
                        self.record_skip(entry, &err)?;
                    }
                    Ok(())
                }
            }
            Err(err) => Err(self.fail(err.into())),
        }
    }

    fn deliver_one(&self, entry: BatchEntry) -> Result<(), IndexflowError> {
        match self.send(std::slice::from_ref(&entry)) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(err) if self.config.is_skippable(err.kind) => self.record_skip(&entry, &err),
            Err(err) => Err(self.fail(err.into())),
        }
    }

    fn send(&self, entries: &[BatchEntry]) -> Result<(), DeliveryError> {
        let documents: Vec<&Value> = entries.iter().map(|entry| &entry.document).collect();
        let body = serde_json::to_string(&documents)
            .map_err(|e| DeliveryError::new(DeliveryErrorKind::Serialization, e.to_string()))?;

        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = self.endpoint.post(self.client.as_ref(), &body)?;
        if response.is_success() {
            debug!(records = entries.len(), status = response.status, "Delivered batch");
            Ok(())
        } else {
            Err(DeliveryError::rejected(response.status, &response.body))
        }
    }

    fn record_skip(&self, entry: &BatchEntry, cause: &DeliveryError) -> Result<(), IndexflowError> {
        let skipped = self.skipped.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            position = entry.position,
            record_id = entry.record_id.as_deref().unwrap_or_default(),
            skipped,
            error = %cause,
            "Could not deliver {}, skipping",
            entry.label()
        );

        let max_skipped = self.config.max_skipped;
        if skipped > max_skipped {
            return Err(self.fail(IndexflowError::MaxSkippedExceeded { max_skipped, skipped }));
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), IndexflowError> {
        let path = self.endpoint.control_path();
        info!(path = %path, "Sending commit");
        let params = [("commit".to_string(), "true".to_string())];
        let response = self
            .client
            .get(&path, &params)
            .map_err(|err| self.fail(err.into()))?;
        if !response.is_success() {
            return Err(self.fail(DeliveryError::rejected(response.status, &response.body).into()));
        }
        Ok(())
    }
}

/// Accepts transformed records, groups them into batches and delivers each
/// full batch on its own worker pool.
///
/// Failures in the skippable set skip the affected records, each logged on
/// its own line. Once more than `max_skipped` records have been skipped the
/// sink fails, and the fault is re-raised by every later call.
pub struct BatchDeliverySink {
    shared: Arc<SinkShared>,
    batch: Mutex<Vec<BatchEntry>>,
    pool: WorkerPool,
}

impl BatchDeliverySink {
    /// Name of the sink's worker pool.
    pub const POOL_NAME: &'static str = "delivery";

    /// Creates a sink delivering through `client`.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` for an invalid configuration.
    pub fn new(config: SinkConfig, client: Arc<dyn DeliveryClient>) -> Result<Self, IndexflowError> {
        config.validate()?;
        let pool = WorkerPool::new(Self::POOL_NAME, config.effective_thread_pool())?;
        let endpoint = UpdateEndpoint::new(config.update_path.clone(), &config.update_params);
        let batch = Mutex::new(Vec::with_capacity(config.batch_size));

        info!(
            url = %config.url,
            batch_size = config.batch_size,
            thread_pool = config.effective_thread_pool(),
            max_skipped = config.max_skipped,
            "Delivery sink opened"
        );

        Ok(Self {
            shared: Arc::new(SinkShared {
                config,
                client,
                endpoint,
                skipped: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                calls: AtomicU64::new(0),
                state: AtomicU8::new(SinkState::Open.as_u8()),
                faults: Arc::clone(pool.fault_slot()),
            }),
            batch,
            pool,
        })
    }

    /// Creates a sink delivering over HTTP to `config.url`.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` for an invalid configuration or URL.
    #[cfg(feature = "http")]
    pub fn from_config(config: SinkConfig) -> Result<Self, IndexflowError> {
        let client = super::HttpDeliveryClient::new(&config)?;
        Self::new(config, Arc::new(client))
    }

    /// Accepts one processed record.
    ///
    /// Skipped contexts are dropped. When the pending batch reaches the
    /// configured size it is handed to the delivery pool; a full pool queue
    /// delivers on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the sink's fault if it has failed, or a usage error after
    /// close.
    pub fn accept<R>(&self, context: ProcessingContext<R>) -> Result<(), IndexflowError> {
        self.ensure_open()?;
        if context.is_skipped() {
            return Ok(());
        }

        let entry = BatchEntry {
            position: context.position(),
            record_id: context.record_id(),
            document: context.output.into_document(),
        };

        let full = {
            let mut batch = self.batch.lock();
            batch.push(entry);
            if batch.len() >= self.shared.config.batch_size {
                Some(std::mem::replace(
                    &mut *batch,
                    Vec::with_capacity(self.shared.config.batch_size),
                ))
            } else {
                None
            }
        };

        if let Some(full) = full {
            let shared = Arc::clone(&self.shared);
            self.pool.submit(move || shared.deliver(full))?;
        }
        Ok(())
    }

    /// Delivers the pending batch on the calling thread.
    ///
    /// Batches already handed to the pool are not waited for.
    ///
    /// # Errors
    ///
    /// Returns the sink's fault, or the fault raised by this delivery.
    pub fn flush(&self) -> Result<(), IndexflowError> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut *self.batch.lock());
        if pending.is_empty() {
            return Ok(());
        }

        let flushing = self.shared.transition(SinkState::Open, SinkState::Flushing);
        debug!(records = pending.len(), "Flushing pending batch");
        let result = self.shared.deliver(pending);
        if flushing {
            self.shared.transition(SinkState::Flushing, SinkState::Open);
        }
        result
    }

    /// Delivers what is pending, waits for in-flight batches, and commits
    /// if configured.
    ///
    /// Calling `close` again returns the same outcome as the first call.
    ///
    /// # Errors
    ///
    /// Returns the first fatal fault raised by any delivery, or the commit
    /// failure.
    pub fn close(&self) -> Result<(), IndexflowError> {
        match self.state() {
            SinkState::Closed => return Ok(()),
            SinkState::Failed => {
                self.pool.shutdown_and_wait(None);
                return self.raise_failure();
            }
            SinkState::Open | SinkState::Flushing => {}
        }

        let remaining = std::mem::take(&mut *self.batch.lock());
        if !remaining.is_empty() {
            let shared = Arc::clone(&self.shared);
            self.pool.submit(move || shared.deliver(remaining))?;
        }

        let waited = self.pool.shutdown_and_wait(None);
        debug!(waited_ms = waited.as_millis() as u64, "Delivery pool drained");

        if let Err(fault) = self.pool.check_and_raise() {
            self.shared.mark_failed(&fault);
            return Err(fault);
        }
        if self.shared.config.commit_on_close {
            self.shared.commit()?;
        }

        self.shared
            .state
            .store(SinkState::Closed.as_u8(), Ordering::SeqCst);
        info!(
            delivered = self.delivered_record_count(),
            skipped = self.skipped_record_count(),
            calls = self.delivery_call_count(),
            "Delivery sink closed"
        );
        Ok(())
    }

    /// Deletes the document with `id` on the remote service.
    ///
    /// # Errors
    ///
    /// Returns the sink's fault if it has failed, or the delivery error.
    pub fn delete(&self, id: &str) -> Result<(), IndexflowError> {
        self.ensure_open()?;
        let body = serde_json::json!({ "delete": { "id": id } }).to_string();
        debug!(id, "Deleting document");
        let response = self.shared.endpoint.post(self.shared.client.as_ref(), &body)?;
        if !response.is_success() {
            return Err(DeliveryError::rejected(response.status, &response.body).into());
        }
        Ok(())
    }

    /// Records skipped because of delivery failures.
    #[must_use]
    pub fn skipped_record_count(&self) -> u64 {
        self.shared.skipped.load(Ordering::SeqCst)
    }

    /// Records delivered successfully.
    #[must_use]
    pub fn delivered_record_count(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Delivery attempts made, including per-record resends.
    #[must_use]
    pub fn delivery_call_count(&self) -> u64 {
        self.shared.calls.load(Ordering::SeqCst)
    }

    /// Records accepted but not yet handed to delivery.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.batch.lock().len()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SinkState {
        self.shared.state()
    }

    /// The sink configuration.
    #[must_use]
    pub fn config(&self) -> &SinkConfig {
        &self.shared.config
    }

    /// Re-raises a fault captured by a delivery worker.
    ///
    /// # Errors
    ///
    /// Returns the captured fault.
    pub fn check_and_raise(&self) -> Result<(), IndexflowError> {
        self.pool.check_and_raise()
    }

    /// Stops the delivery pool without delivering what is pending and
    /// fails the sink with `fault`, unless it already closed cleanly.
    ///
    /// Later calls re-raise the first fault recorded by the sink, so a
    /// `close` after an aborted run never commits partial data.
    pub(crate) fn abort(&self, fault: &IndexflowError) {
        let dropped = std::mem::take(&mut *self.batch.lock()).len();
        if dropped > 0 {
            warn!(dropped, "Discarding undelivered records");
        }
        self.pool.shutdown_and_wait(None);
        if self.state() != SinkState::Closed {
            self.shared.fail(fault.clone());
        }
    }

    fn ensure_open(&self) -> Result<(), IndexflowError> {
        match self.state() {
            SinkState::Open | SinkState::Flushing => self.pool.check_and_raise(),
            SinkState::Failed => self.raise_failure(),
            SinkState::Closed => Err(IndexflowError::usage("delivery sink is closed")),
        }
    }

    fn raise_failure(&self) -> Result<(), IndexflowError> {
        self.pool.check_and_raise()?;
        Err(IndexflowError::Internal(
            "delivery sink failed without a recorded fault".to_string(),
        ))
    }
}

impl fmt::Debug for BatchDeliverySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchDeliverySink")
            .field("url", &self.shared.config.url)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .field("delivered", &self.delivered_record_count())
            .field("skipped", &self.skipped_record_count())
            .finish_non_exhaustive()
    }
}
