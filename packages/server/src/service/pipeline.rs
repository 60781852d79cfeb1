//! The staged pipeline executor.
//!
//! [`ModelService`] drives one request through preprocess -> inference ->
//! postprocess. Each stage is a blocking call into the [`Model`], submitted
//! to that stage's pool and awaited before the next stage is submitted, so
//! the stages of a single request never overlap while different requests
//! interleave freely across the pools.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use async_trait::async_trait;
use conveyor_core::{Model, ServiceRequest, ServiceResponse};
use tokio::sync::OnceCell;
use tracing::Instrument;
use uuid::Uuid;

use crate::service::config::ServiceConfig;
use crate::service::pool::{JobError, PoolSet};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// The three pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Raw request to model input.
    Preprocess,
    /// Model input to model output.
    Inference,
    /// Model output to response payload.
    Postprocess,
}

impl Stage {
    /// Stage name as used in pool names, logs, and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::Inference => "inference",
            Self::Postprocess => "postprocess",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Failure of a single pipeline run. Never affects other requests.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A stage returned an error or panicked; later stages were skipped.
    /// The original cause is preserved as the source chain.
    #[error("{stage} stage failed")]
    Stage {
        /// The stage that failed.
        stage: Stage,
        /// The model's error, or a panic report.
        #[source]
        source: anyhow::Error,
    },
    /// The service was torn down; the request was not processed.
    #[error("service is terminated")]
    Terminated,
}

// ---------------------------------------------------------------------------
// ServiceId / Service
// ---------------------------------------------------------------------------

/// Identifier of one service instance, used in logs and teardown reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId(String);

impl ServiceId {
    /// Creates an id from a caller-chosen name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a `service-<hex>` id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("service-{}", Uuid::new_v4().simple()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The request-handling contract endpoints bind to.
///
/// Implementations process one request per call and tear down exactly once;
/// both methods are callable from many tasks at once.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Stable identifier for logs and reports.
    fn id(&self) -> &ServiceId;

    /// Processes one request to a single response.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Stage`] if a stage fails, or
    /// [`PipelineError::Terminated`] after teardown.
    async fn handle_request(
        &self,
        request: ServiceRequest,
    ) -> Result<ServiceResponse, PipelineError>;

    /// Releases the service's resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if resources could not be released; the service
    /// still counts as terminated.
    async fn teardown(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ModelService
// ---------------------------------------------------------------------------

/// A [`Service`] that executes a [`Model`] on a private [`PoolSet`].
///
/// The model is loaded once via [`start`](Self::start) before traffic;
/// requests run through [`Service::handle_request`]; teardown drains and
/// joins the stage pools.
pub struct ModelService<M: Model> {
    id: ServiceId,
    model: Arc<M>,
    pools: PoolSet,
    loaded: OnceCell<()>,
    terminated: AtomicBool,
}

impl<M: Model> ModelService<M> {
    /// Builds the service and its stage pools. The model is not loaded yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker counts are invalid or the pool
    /// threads cannot be spawned.
    pub fn new(model: M, config: &ServiceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            id: ServiceId::generate(),
            model: Arc::new(model),
            pools: PoolSet::new(config)?,
            loaded: OnceCell::new(),
            terminated: AtomicBool::new(false),
        })
    }

    /// Replaces the generated id with a caller-chosen one.
    #[must_use]
    pub fn with_id(mut self, id: ServiceId) -> Self {
        self.id = id;
        self
    }

    /// Loads the model, exactly once across all callers.
    ///
    /// The blocking [`Model::load`] runs off the async runtime. Concurrent
    /// callers wait for the one load in flight; once it has succeeded,
    /// further calls return immediately. A failed load leaves the service
    /// unstarted so the next call retries.
    ///
    /// # Errors
    ///
    /// Returns the model's load error, or an error if the service is
    /// already terminated.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            anyhow::bail!("service `{}` is terminated", self.id);
        }
        self.loaded
            .get_or_try_init(|| {
                let model = Arc::clone(&self.model);
                let id = self.id.clone();
                async move {
                    tracing::info!(service = %id, "loading model");
                    tokio::task::spawn_blocking(move || model.load())
                        .await
                        .context("model load task failed")??;
                    tracing::info!(service = %id, "model loaded");
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await?;
        Ok(())
    }

    /// Whether the model has been loaded.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.loaded.initialized()
    }

    /// Whether teardown has begun.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    async fn run_stages(
        &self,
        request: &Arc<ServiceRequest>,
    ) -> Result<serde_json::Value, PipelineError> {
        let model = Arc::clone(&self.model);
        let req = Arc::clone(request);
        let input = self
            .run_stage(Stage::Preprocess, move || model.preprocess(&req))
            .await?;
        let input = Arc::new(input);

        let model = Arc::clone(&self.model);
        let shared = Arc::clone(&input);
        let output = self
            .run_stage(Stage::Inference, move || model.inference(&shared))
            .await?;

        let model = Arc::clone(&self.model);
        let req = Arc::clone(request);
        let shared = Arc::clone(&input);
        self.run_stage(Stage::Postprocess, move || {
            let ret = model.postprocess(&req, &shared, output)?;
            // Serialize on the pool thread; the async side only moves the
            // finished value.
            serde_json::to_value(ret).context("encoding postprocess result")
        })
        .await
    }

    async fn run_stage<T, F>(&self, stage: Stage, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self
            .pools
            .pool(stage)
            .submit(f)
            .map_err(|_| PipelineError::Terminated)?;
        match handle.join().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(PipelineError::Stage { stage, source }),
            Err(err @ JobError::Panicked { .. }) => Err(PipelineError::Stage {
                stage,
                source: anyhow::Error::new(err),
            }),
            Err(JobError::Lost) => Err(PipelineError::Terminated),
        }
    }
}

#[async_trait]
impl<M: Model> Service for ModelService<M> {
    fn id(&self) -> &ServiceId {
        &self.id
    }

    async fn handle_request(
        &self,
        request: ServiceRequest,
    ) -> Result<ServiceResponse, PipelineError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(PipelineError::Terminated);
        }

        let request = Arc::new(request);
        let span = tracing::info_span!(
            "pipeline",
            service = %self.id,
            request_id = %request.id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let result = self.run_stages(&request).await;

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            let outcome = if result.is_ok() { "ok" } else { "error" };
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            match &result {
                Ok(_) => tracing::debug!("request completed"),
                Err(err) => tracing::warn!(error = %err, "request failed"),
            }

            result.map(|data| ServiceResponse::new(request.id, data))
        }
        .instrument(span)
        .await
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(service = %self.id, "tearing down stage pools");
        self.pools.shutdown().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
