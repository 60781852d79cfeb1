//! Staged request execution.
//!
//! This module implements the service side of the pipeline:
//!
//! 1. **Configuration** (`config`): per-stage worker counts, validated up front
//! 2. **Worker pools** (`pool`): bounded OS-thread pools for blocking work
//! 3. **Pipeline** (`pipeline`): the `Service` contract and `ModelService`,
//!    which pushes each request through preprocess -> inference -> postprocess
//!    on the pool set while the async caller awaits

pub mod config;
pub mod pipeline;
pub mod pool;

// Re-export key types for convenient access.
pub use config::{ConfigError, ServiceConfig};
pub use pipeline::{ModelService, PipelineError, Service, ServiceId, Stage};
pub use pool::{JobError, JobHandle, PoolClosed, PoolSet, WorkerPool};
