//! Per-service configuration for the staged execution pools.

use crate::service::pipeline::Stage;

/// Worker counts for the three stage pools of one service.
///
/// Each count is the number of blocking units of work that stage can run
/// at once. Counts are fixed for the lifetime of the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Worker threads for the preprocess pool.
    pub preprocess_workers: usize,
    /// Worker threads for the inference pool.
    pub inference_workers: usize,
    /// Worker threads for the postprocess pool.
    pub postprocess_workers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            preprocess_workers: 1,
            inference_workers: 1,
            postprocess_workers: 1,
        }
    }
}

impl ServiceConfig {
    /// Gives every stage the same worker count.
    #[must_use]
    pub fn uniform(workers: usize) -> Self {
        Self {
            preprocess_workers: workers,
            inference_workers: workers,
            postprocess_workers: workers,
        }
    }
}

/// Configuration errors surfaced at service construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A stage pool was configured with zero workers. A zero-width pool
    /// would accept work that can never run, so construction refuses it
    /// before any thread is spawned.
    #[error("{stage} pool configured with zero workers")]
    ZeroWorkers {
        /// The stage whose pool has no capacity.
        stage: Stage,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
