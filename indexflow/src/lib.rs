//! # Indexflow
//!
//! A batch pipeline that transforms records in parallel and delivers the
//! results in batches to a remote indexing service.
//!
//! Indexflow provides:
//!
//! - **Parallel transformation**: records are read sequentially and run
//!   through ordered steps on a worker pool with caller-runs backpressure
//! - **Batched delivery**: transformed records are grouped and posted as JSON
//!   arrays on an independent delivery pool
//! - **Skip accounting**: bad records are skipped and logged individually up
//!   to a configured threshold
//! - **Fault capture**: errors and panics on worker threads are captured and
//!   re-raised on the driving thread
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use indexflow::prelude::*;
//! use serde_json::json;
//!
//! let config = IndexerConfig::new()
//!     .with_sink(SinkConfig::new("http://localhost:8983/solr/catalog").with_batch_size(200));
//!
//! let report = PipelineDriver::builder(config)
//!     .to_field("id", |ctx: &ProcessingContext<Book>| Ok(vec![json!(ctx.source_record().id)]))
//!     .to_field("title", |ctx: &ProcessingContext<Book>| Ok(vec![json!(ctx.source_record().title)]))
//!     .build_http()?
//!     .run(books.into_iter())?;
//!
//! assert!(report.success);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod config;
pub mod context;
pub mod delivery;
pub mod errors;
pub mod pipeline;
pub mod pool;
pub mod steps;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{IndexerConfig, SinkConfig};
    pub use crate::context::{OutputMap, ProcessingContext};
    #[cfg(feature = "http")]
    pub use crate::delivery::HttpDeliveryClient;
    pub use crate::delivery::{BatchDeliverySink, DeliveryClient, DeliveryResponse, SinkState};
    pub use crate::errors::{DeliveryError, DeliveryErrorKind, IndexflowError};
    pub use crate::pipeline::{FallibleSource, PipelineDriver, RecordSource, RunReport};
    pub use crate::pool::WorkerPool;
    pub use crate::steps::{
        EachRecordStep, HelperCache, RegexCaptureStep, ToFieldStep, TransformationStep,
    };
}
