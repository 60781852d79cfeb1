//! Message types flowing between the dispatcher, the pipeline executor, and
//! the transport layer.
//!
//! A [`ServiceRequest`] carries an opaque JSON payload understood only by
//! the model. The request id assigned at creation survives all three
//! pipeline stages unchanged and appears on exactly one [`ServiceResponse`]
//! or [`ServiceError`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Service error codes carried in [`ServiceError::code`].
///
/// Values are aligned with the HTTP status the transport maps them to, so
/// the envelope and the status line never disagree.
pub mod codes {
    /// The request body could not be converted into a service request.
    pub const BAD_PAYLOAD: u16 = 400;
    /// No endpoint matched the (path, method) pair.
    pub const NOT_FOUND: u16 = 404;
    /// A pipeline stage failed; the original cause is in `details`.
    pub const STAGE_FAILURE: u16 = 500;
    /// The service is not accepting work (draining or terminated).
    pub const UNAVAILABLE: u16 = 503;
}

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// Unique identifier shared by a request and the single response produced
/// for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id from its string form (e.g. an `x-request-id` header).
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::try_parse(s)?))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// ServiceRequest
// ---------------------------------------------------------------------------

/// One unit of work handed to a pipeline executor.
///
/// Immutable once created: the dispatcher owns it until hand-off, after
/// which it is shared read-only with the executor for the duration of one
/// pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Identifier assigned at creation if not supplied.
    pub id: RequestId,
    /// Opaque payload; only the model interprets it.
    pub payload: serde_json::Value,
    /// Path-template parameters resolved at dispatch time
    /// (e.g. `{name}` -> `"alice"`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

impl ServiceRequest {
    /// Creates a request with a freshly generated id and no path parameters.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self::with_id(RequestId::generate(), payload)
    }

    /// Creates a request with a caller-supplied id.
    #[must_use]
    pub fn with_id(id: RequestId, payload: serde_json::Value) -> Self {
        Self {
            id,
            payload,
            params: HashMap::new(),
        }
    }

    /// Attaches resolved path-template parameters.
    #[must_use]
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Looks up a resolved path-template parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// ServiceResponse / ServiceError
// ---------------------------------------------------------------------------

/// Successful outcome of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    /// Identifier of the originating request.
    pub id: RequestId,
    /// JSON-encodable payload produced by the postprocess stage.
    pub data: serde_json::Value,
}

impl ServiceResponse {
    /// Creates a response keyed by the originating request's id.
    #[must_use]
    pub fn new(id: RequestId, data: serde_json::Value) -> Self {
        Self { id, data }
    }
}

/// Error outcome of one pipeline run, JSON-encodable for the transport.
///
/// Not a `std::error::Error`: this is a wire envelope, produced from the
/// typed errors at the transport boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceError {
    /// Identifier of the originating request.
    pub id: RequestId,
    /// One of the [`codes`] constants.
    pub code: u16,
    /// Human-readable description.
    pub message: String,
    /// Underlying cause chain, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ServiceError {
    /// Creates an error envelope without details.
    #[must_use]
    pub fn new(id: RequestId, code: u16, message: impl Into<String>) -> Self {
        Self {
            id,
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches the underlying cause chain.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
