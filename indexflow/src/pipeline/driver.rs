//! Pipeline driver: reads, transforms in parallel, delivers.

use super::stats::{RunReport, ThroughputTracker};
use super::RecordSource;
use crate::config::IndexerConfig;
use crate::context::ProcessingContext;
use crate::delivery::BatchDeliverySink;
use crate::errors::IndexflowError;
use crate::pool::WorkerPool;
use crate::steps::{EachRecordStep, HelperCache, ToFieldStep, TransformationStep};
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

type HookFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct PostProcessingHook {
    name: String,
    func: HookFn,
}

/// Builder registering steps and hooks for a [`PipelineDriver`].
pub struct PipelineBuilder<R> {
    config: IndexerConfig,
    steps: Vec<Box<dyn TransformationStep<R>>>,
    hooks: Vec<PostProcessingHook>,
}

impl<R: Send + 'static> PipelineBuilder<R> {
    /// Appends values extracted from each record to `field`.
    #[must_use]
    pub fn to_field<F>(self, field: impl Into<String>, extract: F) -> Self
    where
        F: Fn(&ProcessingContext<R>) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        let allow_empty = self.config.allow_empty_fields;
        self.step(ToFieldStep::new(field, extract).with_allow_empty(allow_empty))
    }

    /// Runs a closure with full access to each record's context.
    #[must_use]
    pub fn each_record<F>(self, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut ProcessingContext<R>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.step(EachRecordStep::new(description, func))
    }

    /// Appends any step.
    #[must_use]
    pub fn step(mut self, step: impl TransformationStep<R> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Registers a hook run once after every record has been delivered.
    #[must_use]
    pub fn after_processing<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.hooks.push(PostProcessingHook {
            name: name.into(),
            func: Box::new(func),
        });
        self
    }

    /// Number of registered steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Builds the driver around `sink`.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` for an invalid configuration.
    pub fn build(self, sink: impl Into<Arc<BatchDeliverySink>>) -> Result<PipelineDriver<R>, IndexflowError> {
        self.config.validate()?;
        Ok(PipelineDriver {
            config: self.config,
            steps: self.steps,
            hooks: self.hooks,
            sink: sink.into(),
        })
    }

    /// Builds the driver with an HTTP sink for `config.sink`.
    ///
    /// # Errors
    ///
    /// Returns `IndexflowError::Usage` for an invalid configuration or URL.
    #[cfg(feature = "http")]
    pub fn build_http(self) -> Result<PipelineDriver<R>, IndexflowError> {
        let sink = BatchDeliverySink::from_config(self.config.sink.clone())?;
        self.build(sink)
    }
}

impl<R> fmt::Debug for PipelineBuilder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("steps", &self.steps)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

/// State shared by every transformation task of one run.
struct RunShared<R> {
    steps: Vec<Box<dyn TransformationStep<R>>>,
    sink: Arc<BatchDeliverySink>,
    skipped: AtomicU64,
}

impl<R> RunShared<R> {
    /// Runs every step on one record and hands the result to the sink.
    fn transform(&self, mut context: ProcessingContext<R>) -> Result<(), IndexflowError> {
        for step in &self.steps {
            context.set_current_step(Some(step.description()));
            if let Err(cause) = step.execute(&mut context) {
                let record_id = context.record_id();
                let cause = format!("{cause:#}");
                error!(
                    position = context.position(),
                    record_id = record_id.as_deref().unwrap_or_default(),
                    step = step.description(),
                    error = %cause,
                    "Transformation failed for {}",
                    context.label()
                );
                return Err(IndexflowError::Transformation {
                    position: context.position(),
                    record_id,
                    step: step.description().to_string(),
                    cause,
                });
            }
            if context.is_skipped() {
                break;
            }
        }
        context.set_current_step(None);

        if context.is_skipped() {
            let skipped = self.skipped.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                position = context.position(),
                skipped,
                "Skipping {}: {}",
                context.label(),
                context.skip_reason().unwrap_or_default()
            );
            return Ok(());
        }
        self.sink.accept(context)
    }
}

/// Drives records from a source through the transformation steps into a
/// [`BatchDeliverySink`].
///
/// Records are read on the calling thread and transformed on a pool of
/// `processing_threads` workers; a full queue makes the reader transform
/// the record itself. The first fault raised anywhere aborts the run.
pub struct PipelineDriver<R> {
    config: IndexerConfig,
    steps: Vec<Box<dyn TransformationStep<R>>>,
    hooks: Vec<PostProcessingHook>,
    sink: Arc<BatchDeliverySink>,
}

impl<R: Send + 'static> PipelineDriver<R> {
    /// Starts building a driver.
    #[must_use]
    pub fn builder(config: IndexerConfig) -> PipelineBuilder<R> {
        PipelineBuilder {
            config,
            steps: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Returns the sink records are delivered to.
    #[must_use]
    pub fn sink(&self) -> &Arc<BatchDeliverySink> {
        &self.sink
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Processes every record of `source`, closes the sink and runs the
    /// post-processing hooks.
    ///
    /// # Errors
    ///
    /// Returns the first fatal fault: a transformation error, a delivery
    /// fault, a source error, a hook failure or a panic in any task.
    pub fn run<S>(self, mut source: S) -> Result<RunReport, IndexflowError>
    where
        S: RecordSource<Record = R>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            processing_threads = self.config.processing_threads,
            batch_size = self.sink.config().batch_size,
            delivery_threads = self.sink.config().effective_thread_pool(),
            "Indexing run started"
        );

        let pool = WorkerPool::new("transform", self.config.processing_threads)?;
        let shared = Arc::new(RunShared {
            steps: self.steps,
            sink: Arc::clone(&self.sink),
            skipped: AtomicU64::new(0),
        });
        let helpers = Arc::new(HelperCache::new());
        let id_field: Arc<str> = Arc::from(self.config.id_field.as_str());
        let mut throughput = ThroughputTracker::new(self.config.log_batch_size);

        let fed = feed(&pool, &shared, &mut source, &mut throughput, &helpers, &id_field)
            .and_then(|()| {
                pool.shutdown_and_wait(None);
                pool.check_and_raise()
            })
            .and_then(|()| self.sink.close());

        if let Err(fault) = fed {
            return Err(abort(&pool, &self.sink, &throughput, fault));
        }

        for hook in self.hooks {
            info!(hook = %hook.name, "Running post-processing hook");
            if let Err(cause) = (hook.func)() {
                let fault = IndexflowError::Hook {
                    name: hook.name,
                    cause: format!("{cause:#}"),
                };
                return Err(abort(&pool, &self.sink, &throughput, fault));
            }
        }

        let elapsed = throughput.elapsed();
        let skipped_by_delivery = self.sink.skipped_record_count();
        let report = RunReport {
            run_id,
            started_at,
            records_read: throughput.read(),
            skipped_by_transformation: shared.skipped.load(Ordering::SeqCst),
            skipped_by_delivery,
            delivered: self.sink.delivered_record_count(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            success: skipped_by_delivery == 0,
        };

        let elapsed_ms = format!("{:.0}", report.duration_ms);
        let rate = format!("{:.1}", report.records_per_second());
        info!(
            run_id = %run_id,
            read = report.records_read,
            delivered = report.delivered,
            skipped_by_transformation = report.skipped_by_transformation,
            skipped_by_delivery = report.skipped_by_delivery,
            elapsed_ms = %elapsed_ms,
            records_per_second = %rate,
            success = report.success,
            "Indexing run finished"
        );
        Ok(report)
    }
}

impl<R> fmt::Debug for PipelineDriver<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("config", &self.config)
            .field("steps", &self.steps)
            .field("hooks", &self.hooks.len())
            .field("sink", &self.sink)
            .finish()
    }
}

fn feed<R, S>(
    pool: &WorkerPool,
    shared: &Arc<RunShared<R>>,
    source: &mut S,
    throughput: &mut ThroughputTracker,
    helpers: &Arc<HelperCache>,
    id_field: &Arc<str>,
) -> Result<(), IndexflowError>
where
    R: Send + 'static,
    S: RecordSource<Record = R>,
{
    loop {
        pool.check_and_raise()?;
        let Some(record) = source.next_record()? else {
            return Ok(());
        };

        let position = throughput.record_read();
        let context = ProcessingContext::new(position, record)
            .with_id_field(Arc::clone(id_field))
            .with_helpers(Arc::clone(helpers));
        let task_shared = Arc::clone(shared);
        pool.submit(move || task_shared.transform(context))?;
    }
}

/// Logs the abort line and stops both pools.
fn abort(
    pool: &WorkerPool,
    sink: &BatchDeliverySink,
    throughput: &ThroughputTracker,
    fault: IndexflowError,
) -> IndexflowError {
    error!(
        error = %fault,
        read = throughput.read(),
        delivered = sink.delivered_record_count(),
        "Indexing run aborted"
    );
    pool.shutdown_and_wait(None);
    sink.abort(&fault);
    fault
}
