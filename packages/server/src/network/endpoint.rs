//! Endpoint bindings and path normalization.
//!
//! An [`Endpoint`] ties one (path, method) pair to a request handler.
//! Paths are normalized and methods uppercased at construction, so two
//! spellings of the same route collide in the registry no matter how they
//! were written.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use conveyor_core::{ServiceRequest, ServiceResponse};

use crate::service::pipeline::{PipelineError, Service, ServiceId};

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Normalizes a route path to a canonical absolute form.
///
/// A leading `/` is coerced, empty and `.` segments collapse, `..` folds
/// lexically without ever escaping the root, and trailing slashes drop.
/// The empty path normalizes to `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

// ---------------------------------------------------------------------------
// EndpointKey
// ---------------------------------------------------------------------------

/// Registry key: uppercased method plus normalized path, compared as
/// literal strings (so `/{a}` and `/{b}` are distinct keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    /// Uppercased HTTP method name.
    pub method: String,
    /// Normalized absolute path, possibly containing `{name}` segments.
    pub path: String,
}

impl EndpointKey {
    /// Builds a key, normalizing the path and uppercasing the method.
    #[must_use]
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: normalize_path(path),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

// ---------------------------------------------------------------------------
// Endpoint trait / ServiceEndpoint
// ---------------------------------------------------------------------------

/// One routable binding: a (path, method) pair and the handler behind it.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Normalized route path, possibly containing `{name}` segments.
    fn path(&self) -> &str;

    /// Uppercased HTTP method.
    fn method(&self) -> &str;

    /// Handles one dispatched request.
    ///
    /// # Errors
    ///
    /// Returns the handler's pipeline error; the request produced no
    /// response.
    async fn handle_request(
        &self,
        request: ServiceRequest,
    ) -> Result<ServiceResponse, PipelineError>;

    /// Releases the resources behind this endpoint. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if those resources could not be released.
    async fn teardown(&self) -> anyhow::Result<()>;
}

/// An [`Endpoint`] backed by a [`Service`].
///
/// Several endpoints may share one service (e.g. a GET and a POST route
/// into the same model); the service's idempotent teardown absorbs the
/// repeated teardown calls that produces.
pub struct ServiceEndpoint {
    path: String,
    method: String,
    service: Arc<dyn Service>,
}

impl ServiceEndpoint {
    /// Binds a service to a route. The path is normalized and the method
    /// uppercased here, once.
    #[must_use]
    pub fn new(path: &str, method: &str, service: Arc<dyn Service>) -> Self {
        Self {
            path: normalize_path(path),
            method: method.to_ascii_uppercase(),
            service,
        }
    }

    /// Id of the backing service.
    #[must_use]
    pub fn service_id(&self) -> &ServiceId {
        self.service.id()
    }
}

#[async_trait]
impl Endpoint for ServiceEndpoint {
    fn path(&self) -> &str {
        &self.path
    }

    fn method(&self) -> &str {
        &self.method
    }

    async fn handle_request(
        &self,
        request: ServiceRequest,
    ) -> Result<ServiceResponse, PipelineError> {
        self.service.handle_request(request).await
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        self.service.teardown().await
    }
}

impl fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("service", &self.service.id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn normalize_collapses_redundant_segments() {
        assert_eq!(normalize_path("//a/./b"), "/a/b");
        assert_eq!(normalize_path("/a/b"), "/a/b");
        assert_eq!(normalize_path("a/b/"), "/a/b");
        assert_eq!(normalize_path("a//b///c"), "/a/b/c");
    }

    #[test]
    fn normalize_coerces_a_leading_slash() {
        assert_eq!(normalize_path("models/list"), "/models/list");
    }

    #[test]
    fn normalize_handles_degenerate_paths() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("."), "/");
        assert_eq!(normalize_path("//"), "/");
    }

    #[test]
    fn normalize_folds_parent_segments_without_escaping_root() {
        assert_eq!(normalize_path("/a/../b"), "/b");
        assert_eq!(normalize_path("/.."), "/");
        assert_eq!(normalize_path("/../../a"), "/a");
        assert_eq!(normalize_path("/a/b/.."), "/a");
    }

    #[test]
    fn normalize_keeps_template_segments() {
        assert_eq!(normalize_path("/models/{name}/"), "/models/{name}");
    }

    #[test]
    fn endpoint_key_canonicalizes_both_parts() {
        let a = EndpointKey::new("get", "//a/./b");
        let b = EndpointKey::new("GET", "/a/b");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET /a/b");
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(path in "[a-z{}./]{0,24}") {
            let once = normalize_path(&path);
            prop_assert_eq!(normalize_path(&once), once);
        }

        #[test]
        fn prop_normalized_paths_are_absolute(path in "[a-z{}./]{0,24}") {
            let normalized = normalize_path(&path);
            prop_assert!(normalized.starts_with('/'));
        }

        #[test]
        fn prop_normalized_output_has_clean_segments(path in "[a-z{}./]{0,24}") {
            let normalized = normalize_path(&path);
            if normalized != "/" {
                prop_assert!(!normalized.ends_with('/'));
                for segment in normalized[1..].split('/') {
                    prop_assert!(!segment.is_empty());
                    prop_assert_ne!(segment, ".");
                    prop_assert_ne!(segment, "..");
                }
            }
        }
    }
}
