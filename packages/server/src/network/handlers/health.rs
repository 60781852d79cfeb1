//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose server health information for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::dispatcher::LifecycleState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the server is actually serving. This lets monitoring tools
/// distinguish between "server is up but draining" vs "server is down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let lifecycle = state.dispatcher.state();
    let endpoints = state.dispatcher.endpoint_count();
    let in_flight = state.dispatcher.in_flight_count();
    let uptime_secs = state.start_time.elapsed().as_secs();

    Json(json!({
        "state": lifecycle.as_str(),
        "endpoints": endpoints,
        "in_flight": in_flight,
        "uptime_secs": uptime_secs,
    }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// The liveness probe only checks whether the process is running and
/// responsive. It intentionally does not check the dispatcher state,
/// because a failed liveness probe triggers a pod restart.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when serving, 503 otherwise.
///
/// Returns 503 before `mark_serving()`, during graceful shutdown
/// (Draining state), and after stop. This removes the pod from the
/// Service's endpoint list so no new traffic is routed to it.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.dispatcher.state() == LifecycleState::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use conveyor_core::{ServiceRequest, ServiceResponse};

    use super::*;
    use crate::network::adapter::JsonAdapter;
    use crate::network::dispatcher::Dispatcher;
    use crate::network::endpoint::ServiceEndpoint;
    use crate::service::pipeline::{PipelineError, Service, ServiceId};

    struct StubService {
        id: ServiceId,
    }

    #[async_trait]
    impl Service for StubService {
        fn id(&self) -> &ServiceId {
            &self.id
        }

        async fn handle_request(
            &self,
            request: ServiceRequest,
        ) -> Result<ServiceResponse, PipelineError> {
            Ok(ServiceResponse::new(request.id, serde_json::Value::Null))
        }

        async fn teardown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_state() -> AppState {
        AppState {
            dispatcher: Arc::new(Dispatcher::new()),
            adapter: Arc::new(JsonAdapter),
            start_time: Instant::now(),
        }
    }

    fn register_one(state: &AppState) {
        let service = Arc::new(StubService {
            id: ServiceId::new("stub"),
        });
        state
            .dispatcher
            .register(vec![Arc::new(ServiceEndpoint::new("/stub", "GET", service))])
            .unwrap();
    }

    #[tokio::test]
    async fn health_handler_returns_json_with_all_fields() {
        let state = test_state();
        register_one(&state);
        state.dispatcher.mark_serving().unwrap();

        let response = health_handler(State(state)).await;
        let json = response.0;

        assert_eq!(json["state"], "serving");
        assert_eq!(json["endpoints"], 1);
        assert_eq!(json["in_flight"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_handler_reports_unregistered_state() {
        let state = test_state();
        let response = health_handler(State(state)).await;
        assert_eq!(response.0["state"], "unregistered");
        assert_eq!(response.0["endpoints"], 0);
    }

    #[tokio::test]
    async fn health_handler_reports_in_flight_count() {
        let state = test_state();
        let _guard = state.dispatcher.in_flight_guard();

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["in_flight"], 1);
    }

    #[tokio::test]
    async fn liveness_handler_always_returns_200() {
        let status = liveness_handler().await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_handler_returns_503_before_serving() {
        let state = test_state();
        register_one(&state);

        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readiness_handler_returns_200_when_serving() {
        let state = test_state();
        register_one(&state);
        state.dispatcher.mark_serving().unwrap();

        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_handler_returns_503_after_teardown() {
        let state = test_state();
        register_one(&state);
        state.dispatcher.mark_serving().unwrap();
        state.dispatcher.teardown(Duration::from_secs(1)).await;

        let status = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
