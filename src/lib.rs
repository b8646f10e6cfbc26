//! Bounded worker pool with hot-swappable pre-processing callbacks.
//!
//! # Features
//! - Fixed number of worker threads fed from a queue bounded by the worker count
//! - Callbacks that can be registered at runtime without pausing in-flight work
//! - Non-blocking dispatch with a single-use result handle per job
//! - Shutdown on demand, on drop, or when an external `CancellationToken` fires
//! - Every handed-over job reports exactly once, even across shutdown

pub mod errors;
pub mod factory;
pub mod handle;
pub mod job;
pub mod model;
pub mod result;
mod state;
mod worker;

pub use errors::{ClosedFactoryError, FactoryError, JobError};
pub use factory::{Config, Factory};
pub use handle::JobHandle;
pub use job::{Callback, Job};
pub use model::FactoryMetrics;
pub use result::JobResult;
pub use tokio_util::sync::CancellationToken;
