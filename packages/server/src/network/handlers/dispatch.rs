//! The fallback handler feeding every non-probe request into the
//! dispatcher.
//!
//! Outcome mapping keeps the HTTP status and the envelope `code` agreed:
//! adapter failures are 400, routing misses 404, stage failures 500, and
//! a non-serving dispatcher 503.

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use conveyor_core::{codes, RequestId, ServiceError};

use super::AppState;
use crate::network::dispatcher::DispatchError;
use crate::service::pipeline::PipelineError;

/// Routes one request through the dispatcher and the matched endpoint's
/// pipeline, producing the wire envelope.
///
/// An in-flight guard covers the whole body, so teardown's drain window
/// includes requests currently inside a pipeline.
pub async fn dispatch_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _guard = state.dispatcher.in_flight_guard();
    let request_id = request_id_from(&headers);

    let route = match state.dispatcher.dispatch(uri.path(), method.as_str()) {
        Ok(route) => route,
        Err(err) => return dispatch_error_response(request_id, &err),
    };

    let request = match state.adapter.convert(request_id, route.params, &body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ServiceError::new(request_id, codes::BAD_PAYLOAD, "malformed request body")
                    .with_details(err.to_string()),
            );
        }
    };

    match route.endpoint.handle_request(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => pipeline_error_response(request_id, &err),
    }
}

/// Reads the request id assigned by the middleware, falling back to a
/// fresh one when the header is missing or unparsable.
fn request_id_from(headers: &HeaderMap) -> RequestId {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| RequestId::parse(value).ok())
        .unwrap_or_else(RequestId::generate)
}

fn dispatch_error_response(id: RequestId, err: &DispatchError) -> Response {
    match err {
        DispatchError::NotFound { .. } => error_response(
            StatusCode::NOT_FOUND,
            ServiceError::new(id, codes::NOT_FOUND, err.to_string()),
        ),
        DispatchError::NotServing { .. } => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::new(id, codes::UNAVAILABLE, err.to_string()),
        ),
    }
}

fn pipeline_error_response(id: RequestId, err: &PipelineError) -> Response {
    match err {
        PipelineError::Stage { source, .. } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::new(id, codes::STAGE_FAILURE, err.to_string())
                .with_details(format!("{source:#}")),
        ),
        PipelineError::Terminated => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::new(id, codes::UNAVAILABLE, err.to_string()),
        ),
    }
}

fn error_response(status: StatusCode, envelope: ServiceError) -> Response {
    (status, Json(envelope)).into_response()
}
