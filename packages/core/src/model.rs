//! The model contract implemented by anything served through a pipeline.

use serde::Serialize;

use crate::message::ServiceRequest;

/// A servable model with a three-stage processing pipeline.
///
/// All four methods are blocking and run on dedicated worker pools, never
/// on the async runtime. Stages of a single request run in order; stages
/// of different requests run concurrently, so implementations must be safe
/// to call from several pool threads at once.
///
/// The associated types let preprocess hand inference a domain value (a
/// tensor, a token batch) without serialization in between; only `Ret` has
/// to be JSON-encodable, because it crosses back to the transport.
pub trait Model: Send + Sync + 'static {
    /// Value produced by [`preprocess`](Model::preprocess) and consumed by
    /// the later stages. Shared by reference with inference and
    /// postprocess, which may run on different pool threads.
    type Input: Send + Sync + 'static;
    /// Value produced by [`inference`](Model::inference).
    type Output: Send + 'static;
    /// Final value returned to the caller.
    type Ret: Serialize + Send + 'static;

    /// Loads weights and any other expensive state.
    ///
    /// Called at most once, before any request is processed. A failure
    /// here fails service startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be made ready to serve.
    fn load(&self) -> anyhow::Result<()>;

    /// Converts a raw request into the model's input representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be understood; the request
    /// is failed without reaching inference.
    fn preprocess(&self, request: &ServiceRequest) -> anyhow::Result<Self::Input>;

    /// Runs the model on a preprocessed input.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn inference(&self, input: &Self::Input) -> anyhow::Result<Self::Output>;

    /// Shapes the inference output into the value returned to the caller.
    ///
    /// Receives the original request and the preprocessed input alongside
    /// the output, so implementations can echo request fields or reuse
    /// derived state without recomputing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the output cannot be shaped into `Ret`.
    fn postprocess(
        &self,
        request: &ServiceRequest,
        input: &Self::Input,
        output: Self::Output,
    ) -> anyhow::Result<Self::Ret>;
}
