//! Bounded worker pools with cross-thread fault capture.
//!
//! Two independent pools run in a pipeline: one for transformation, owned
//! by the driver, and one for delivery, owned by the sink. They are sized
//! separately and couple only through caller-runs overflow.

mod fault;
mod worker_pool;

pub use fault::FaultSlot;
pub use worker_pool::{Task, WorkerPool, QUEUE_SLOTS_PER_WORKER};
