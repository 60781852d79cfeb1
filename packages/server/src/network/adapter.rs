//! Conversion from raw transport bodies to service requests.
//!
//! The dispatch handler is body-format agnostic; an [`Adapter`] decides
//! how bytes become a [`ServiceRequest`] payload. [`JsonAdapter`] is the
//! default and the only one shipped.

use std::collections::HashMap;

use conveyor_core::{RequestId, ServiceRequest};

/// The body could not be converted. Maps to a 400 at the transport.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The body was present but not decodable.
    #[error("malformed request body: {0}")]
    MalformedBody(#[from] serde_json::Error),
}

/// Builds a [`ServiceRequest`] from the transport-level pieces: the
/// request id, the resolved path parameters, and the raw body bytes.
pub trait Adapter: Send + Sync + 'static {
    /// Converts one inbound body.
    ///
    /// # Errors
    ///
    /// Returns an [`AdapterError`] when the body cannot be decoded; the
    /// request is rejected before any pipeline work starts.
    fn convert(
        &self,
        id: RequestId,
        params: HashMap<String, String>,
        body: &[u8],
    ) -> Result<ServiceRequest, AdapterError>;
}

/// JSON bodies via `serde_json`. An empty body becomes `null`, so
/// body-less GETs dispatch without ceremony.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAdapter;

impl Adapter for JsonAdapter {
    fn convert(
        &self,
        id: RequestId,
        params: HashMap<String, String>,
        body: &[u8],
    ) -> Result<ServiceRequest, AdapterError> {
        let payload = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(body)?
        };
        Ok(ServiceRequest::with_id(id, payload).with_params(params))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_body_becomes_null_payload() {
        let id = RequestId::generate();
        let request = JsonAdapter.convert(id, HashMap::new(), b"").unwrap();
        assert_eq!(request.id, id);
        assert_eq!(request.payload, serde_json::Value::Null);
    }

    #[test]
    fn json_body_is_decoded() {
        let request = JsonAdapter
            .convert(RequestId::generate(), HashMap::new(), br#"{"text": "hi"}"#)
            .unwrap();
        assert_eq!(request.payload, json!({"text": "hi"}));
    }

    #[test]
    fn params_ride_along() {
        let params = HashMap::from([("name".to_string(), "alice".to_string())]);
        let request = JsonAdapter
            .convert(RequestId::generate(), params, b"null")
            .unwrap();
        assert_eq!(request.param("name"), Some("alice"));
    }

    #[test]
    fn malformed_body_is_rejected() {
        let err = JsonAdapter
            .convert(RequestId::generate(), HashMap::new(), b"{not json")
            .expect_err("must fail");
        assert!(err.to_string().contains("malformed request body"));
    }
}
