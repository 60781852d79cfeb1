//! Request dispatcher with lifecycle management and in-flight tracking.
//!
//! Uses `ArcSwap` for lock-free state and registry reads on the request
//! path, a mutex to serialize lifecycle transitions, and an atomic counter
//! with RAII guards for accurate in-flight request tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::network::endpoint::{normalize_path, Endpoint, EndpointKey};
use crate::network::registry::{EndpointRegistry, RegistryError, RouteMatch};

// ---------------------------------------------------------------------------
// LifecycleState
// ---------------------------------------------------------------------------

/// Dispatcher lifecycle.
///
/// State machine: Unregistered -> Registered -> Serving -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No endpoints bound yet; registration is still possible.
    Unregistered,
    /// Endpoints bound and validated, not yet accepting requests.
    Registered,
    /// Accepting and routing requests.
    Serving,
    /// Refusing new requests while in-flight ones finish.
    Draining,
    /// Fully stopped; terminal.
    Stopped,
}

impl LifecycleState {
    /// State name as reported by health probes and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A lifecycle method was called in a state that does not allow it.
#[derive(Debug, thiserror::Error)]
#[error("cannot {action} while {state}")]
pub struct LifecycleError {
    /// What was attempted.
    pub action: &'static str,
    /// The state that refused it.
    pub state: LifecycleState,
}

/// Why [`Dispatcher::register`] failed. The dispatcher stays unregistered
/// either way, so a corrected set can be retried.
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    /// Registration attempted outside the `Unregistered` state.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// The endpoint set contains duplicate bindings.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why a request could not be routed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No binding matched the (path, method) pair.
    #[error("no endpoint for {method} {path}")]
    NotFound {
        /// Uppercased method of the miss.
        method: String,
        /// Normalized path of the miss.
        path: String,
    },
    /// The dispatcher is not in the `Serving` state.
    #[error("dispatcher is not serving (state: {state})")]
    NotServing {
        /// The state that refused the request.
        state: LifecycleState,
    },
}

// ---------------------------------------------------------------------------
// TeardownReport
// ---------------------------------------------------------------------------

/// One endpoint whose teardown failed.
#[derive(Debug)]
pub struct TeardownFailure {
    /// The endpoint's binding key.
    pub key: EndpointKey,
    /// What went wrong.
    pub error: anyhow::Error,
}

/// Aggregated outcome of a teardown pass. Returned, never raised.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Whether every in-flight request finished inside the drain window.
    pub drained: bool,
    /// Endpoints whose teardown failed or panicked.
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// True when the drain completed and every endpoint tore down cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.drained && self.failures.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes requests to registered endpoints and owns their shared lifecycle.
///
/// The request path (`dispatch`, `in_flight_guard`) is lock-free; lifecycle
/// transitions are serialized by a mutex. Teardown coordinates shutdown:
///
/// 1. Move to `Draining` and signal all shutdown receivers
/// 2. Wait for in-flight requests, bounded by the drain timeout
/// 3. Tear endpoints down concurrently, collecting failures
/// 4. Move to `Stopped` and return the report
pub struct Dispatcher {
    state: ArcSwap<LifecycleState>,
    transitions: Mutex<()>,
    registry: ArcSwapOption<EndpointRegistry>,
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Creates a dispatcher in the `Unregistered` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Unregistered),
            transitions: Mutex::new(()),
            registry: ArcSwapOption::from(None),
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Validates and publishes the endpoint set.
    ///
    /// Allowed only in the `Unregistered` state, and only once: success
    /// moves to `Registered`. On failure nothing is published and the
    /// state does not change, so a corrected set can be registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Lifecycle`] outside `Unregistered`, or
    /// [`RegisterError::Registry`] listing every duplicated binding.
    pub fn register(&self, endpoints: Vec<Arc<dyn Endpoint>>) -> Result<(), RegisterError> {
        let _guard = self.transitions.lock();
        let state = self.state();
        if state != LifecycleState::Unregistered {
            return Err(LifecycleError {
                action: "register endpoints",
                state,
            }
            .into());
        }

        let registry = EndpointRegistry::build(endpoints)?;
        tracing::info!(endpoints = registry.len(), "endpoints registered");
        self.registry.store(Some(Arc::new(registry)));
        self.state.store(Arc::new(LifecycleState::Registered));
        Ok(())
    }

    /// Opens the dispatcher for traffic: `Registered` -> `Serving`.
    ///
    /// # Errors
    ///
    /// Returns a [`LifecycleError`] from any other state.
    pub fn mark_serving(&self) -> Result<(), LifecycleError> {
        let _guard = self.transitions.lock();
        let state = self.state();
        if state != LifecycleState::Registered {
            return Err(LifecycleError {
                action: "start serving",
                state,
            });
        }
        self.state.store(Arc::new(LifecycleState::Serving));
        tracing::info!("dispatcher serving");
        Ok(())
    }

    /// Routes a (path, method) pair to its endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotServing`] outside the `Serving` state,
    /// or [`DispatchError::NotFound`] when nothing matches.
    pub fn dispatch(&self, path: &str, method: &str) -> Result<RouteMatch, DispatchError> {
        let state = self.state();
        if state != LifecycleState::Serving {
            return Err(DispatchError::NotServing { state });
        }

        let registry = self.registry.load();
        registry
            .as_ref()
            .and_then(|registry| registry.resolve(path, method))
            .ok_or_else(|| DispatchError::NotFound {
                method: method.to_ascii_uppercase(),
                path: normalize_path(path),
            })
    }

    /// Returns a receiver notified when teardown begins.
    ///
    /// Listeners should select on this alongside their main loop to
    /// initiate graceful shutdown.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Creates an RAII guard tracking one in-flight request.
    ///
    /// The counter is incremented on creation and decremented when the
    /// guard drops, even if the handler panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Current number of in-flight requests.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Registered binding keys, in registration order. Empty before
    /// registration.
    #[must_use]
    pub fn endpoint_keys(&self) -> Vec<EndpointKey> {
        self.registry
            .load()
            .as_ref()
            .map(|registry| registry.keys().to_vec())
            .unwrap_or_default()
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.registry
            .load()
            .as_ref()
            .map_or(0, |registry| registry.len())
    }

    /// Drains traffic and tears every endpoint down.
    ///
    /// Idempotent: once draining or stopped, further calls return an empty
    /// report immediately. The drain wait is bounded by `drain_timeout`;
    /// on expiry teardown proceeds anyway and the report says so.
    /// Endpoint teardowns run concurrently as spawned tasks; a failing or
    /// panicking endpoint is recorded without preventing its siblings from
    /// tearing down, and a cancelled teardown task counts as already torn
    /// down.
    pub async fn teardown(&self, drain_timeout: Duration) -> TeardownReport {
        {
            let _guard = self.transitions.lock();
            match self.state() {
                LifecycleState::Draining | LifecycleState::Stopped => {
                    return TeardownReport {
                        drained: true,
                        failures: Vec::new(),
                    };
                }
                _ => {}
            }
            self.state.store(Arc::new(LifecycleState::Draining));
        }
        // Ignore send errors -- receivers may have been dropped
        let _ = self.shutdown_signal.send(true);
        tracing::info!("draining in-flight requests");

        let drained = self.wait_for_drain(drain_timeout).await;
        if !drained {
            tracing::warn!(
                in_flight = self.in_flight_count(),
                "drain timeout expired, proceeding with teardown"
            );
        }

        let mut failures = Vec::new();
        if let Some(registry) = self.registry.load_full() {
            let tasks: Vec<_> = registry
                .endpoints()
                .iter()
                .map(|endpoint| {
                    let endpoint = Arc::clone(endpoint);
                    let key = EndpointKey::new(endpoint.method(), endpoint.path());
                    let task = tokio::spawn(async move { endpoint.teardown().await });
                    (key, task)
                })
                .collect();

            for (key, task) in tasks {
                match task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::error!(endpoint = %key, error = %error, "endpoint teardown failed");
                        failures.push(TeardownFailure { key, error });
                    }
                    Err(join_err) if join_err.is_cancelled() => {
                        // A cancelled teardown task counts as already torn down.
                    }
                    Err(join_err) => {
                        tracing::error!(endpoint = %key, error = %join_err, "endpoint teardown panicked");
                        failures.push(TeardownFailure {
                            key,
                            error: anyhow::Error::new(join_err),
                        });
                    }
                }
            }
        }

        {
            let _guard = self.transitions.lock();
            self.state.store(Arc::new(LifecycleState::Stopped));
        }
        tracing::info!(failures = failures.len(), drained, "dispatcher stopped");
        TeardownReport { drained, failures }
    }

    async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use conveyor_core::{ServiceRequest, ServiceResponse};

    use super::*;
    use crate::network::endpoint::ServiceEndpoint;
    use crate::service::pipeline::{PipelineError, Service, ServiceId};

    /// Service with controllable teardown behavior.
    struct ProbeService {
        id: ServiceId,
        teardown_calls: Arc<AtomicU32>,
        teardown_mode: TeardownMode,
    }

    #[derive(Clone, Copy)]
    enum TeardownMode {
        Ok,
        Fail,
        Panic,
    }

    impl ProbeService {
        fn new(name: &str, mode: TeardownMode) -> Self {
            Self {
                id: ServiceId::new(name),
                teardown_calls: Arc::new(AtomicU32::new(0)),
                teardown_mode: mode,
            }
        }
    }

    #[async_trait]
    impl Service for ProbeService {
        fn id(&self) -> &ServiceId {
            &self.id
        }

        async fn handle_request(
            &self,
            request: ServiceRequest,
        ) -> Result<ServiceResponse, PipelineError> {
            Ok(ServiceResponse::new(
                request.id,
                serde_json::json!({"service": self.id.as_str()}),
            ))
        }

        async fn teardown(&self) -> anyhow::Result<()> {
            self.teardown_calls.fetch_add(1, Ordering::SeqCst);
            match self.teardown_mode {
                TeardownMode::Ok => Ok(()),
                TeardownMode::Fail => anyhow::bail!("connection pool refused to close"),
                TeardownMode::Panic => panic!("teardown exploded"),
            }
        }
    }

    fn endpoint(path: &str, method: &str, service: ProbeService) -> Arc<dyn Endpoint> {
        Arc::new(ServiceEndpoint::new(path, method, Arc::new(service)))
    }

    fn ok_endpoint(path: &str, method: &str) -> Arc<dyn Endpoint> {
        endpoint(path, method, ProbeService::new(path, TeardownMode::Ok))
    }

    #[tokio::test]
    async fn full_lifecycle_happy_path() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.state(), LifecycleState::Unregistered);

        dispatcher
            .register(vec![ok_endpoint("/", "GET"), ok_endpoint("/{name}", "GET")])
            .unwrap();
        assert_eq!(dispatcher.state(), LifecycleState::Registered);
        assert_eq!(dispatcher.endpoint_count(), 2);

        dispatcher.mark_serving().unwrap();
        assert_eq!(dispatcher.state(), LifecycleState::Serving);

        let root = dispatcher.dispatch("/", "GET").unwrap();
        assert_eq!(root.endpoint.path(), "/");

        let named = dispatcher.dispatch("/alice", "GET").unwrap();
        assert_eq!(named.params.get("name").map(String::as_str), Some("alice"));

        assert!(matches!(
            dispatcher.dispatch("/", "POST"),
            Err(DispatchError::NotFound { .. })
        ));

        let report = dispatcher.teardown(Duration::from_secs(1)).await;
        assert!(report.is_clean());
        assert_eq!(dispatcher.state(), LifecycleState::Stopped);

        assert!(matches!(
            dispatcher.dispatch("/", "GET"),
            Err(DispatchError::NotServing {
                state: LifecycleState::Stopped
            })
        ));
    }

    #[tokio::test]
    async fn register_is_allowed_only_once() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(vec![ok_endpoint("/a", "GET")]).unwrap();

        let err = dispatcher
            .register(vec![ok_endpoint("/b", "GET")])
            .expect_err("second registration must fail");
        assert!(matches!(err, RegisterError::Lifecycle(_)));
        assert_eq!(dispatcher.endpoint_count(), 1);
    }

    #[tokio::test]
    async fn mark_serving_requires_registered() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher.mark_serving().expect_err("nothing registered");
        assert_eq!(err.state, LifecycleState::Unregistered);
        assert!(err.to_string().contains("unregistered"));
    }

    #[tokio::test]
    async fn dispatch_outside_serving_is_rejected() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(vec![ok_endpoint("/a", "GET")]).unwrap();

        assert!(matches!(
            dispatcher.dispatch("/a", "GET"),
            Err(DispatchError::NotServing {
                state: LifecycleState::Registered
            })
        ));
    }

    #[tokio::test]
    async fn failed_registration_is_retryable() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .register(vec![ok_endpoint("/a", "GET"), ok_endpoint("/a", "GET")])
            .expect_err("duplicates must fail");
        assert!(err.to_string().contains("GET /a"));
        assert_eq!(dispatcher.state(), LifecycleState::Unregistered);
        assert_eq!(dispatcher.endpoint_count(), 0);

        dispatcher
            .register(vec![ok_endpoint("/a", "GET"), ok_endpoint("/a", "POST")])
            .unwrap();
        assert_eq!(dispatcher.state(), LifecycleState::Registered);
    }

    #[tokio::test]
    async fn not_found_reports_the_canonical_key() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(vec![ok_endpoint("/a", "GET")]).unwrap();
        dispatcher.mark_serving().unwrap();

        let err = dispatcher
            .dispatch("//missing/./route", "post")
            .expect_err("no such route");
        assert_eq!(err.to_string(), "no endpoint for POST /missing/route");
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let service = ProbeService::new("svc", TeardownMode::Ok);
        let calls = service.teardown_calls.clone();
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(vec![endpoint("/a", "GET", service)])
            .unwrap();
        dispatcher.mark_serving().unwrap();

        let first = dispatcher.teardown(Duration::from_secs(1)).await;
        let second = dispatcher.teardown(Duration::from_secs(1)).await;

        assert!(first.is_clean());
        assert!(second.is_clean());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn teardown_collects_failures_without_stopping_siblings() {
        let healthy = ProbeService::new("healthy", TeardownMode::Ok);
        let healthy_calls = healthy.teardown_calls.clone();
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(vec![
                endpoint("/bad", "GET", ProbeService::new("bad", TeardownMode::Fail)),
                endpoint("/good", "GET", healthy),
                endpoint(
                    "/worse",
                    "GET",
                    ProbeService::new("worse", TeardownMode::Panic),
                ),
            ])
            .unwrap();
        dispatcher.mark_serving().unwrap();

        let report = dispatcher.teardown(Duration::from_secs(1)).await;

        assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures.len(), 2);
        let failed_keys: Vec<String> = report
            .failures
            .iter()
            .map(|failure| failure.key.to_string())
            .collect();
        assert!(failed_keys.contains(&"GET /bad".to_string()));
        assert!(failed_keys.contains(&"GET /worse".to_string()));
        assert!(report
            .failures
            .iter()
            .any(|failure| failure.error.to_string().contains("refused to close")));
    }

    #[tokio::test]
    async fn teardown_waits_for_in_flight_requests() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register(vec![ok_endpoint("/a", "GET")]).unwrap();
        dispatcher.mark_serving().unwrap();

        let guard = dispatcher.in_flight_guard();
        assert_eq!(dispatcher.in_flight_count(), 1);

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        let report = dispatcher.teardown(Duration::from_secs(2)).await;
        assert!(report.drained);
        assert_eq!(dispatcher.in_flight_count(), 0);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_timeout_still_stops_the_dispatcher() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(vec![ok_endpoint("/a", "GET")]).unwrap();
        dispatcher.mark_serving().unwrap();

        let _guard = dispatcher.in_flight_guard();
        let report = dispatcher.teardown(Duration::from_millis(50)).await;

        assert!(!report.drained);
        assert!(report.failures.is_empty());
        assert_eq!(dispatcher.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_receiver_is_notified() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(vec![ok_endpoint("/a", "GET")]).unwrap();
        dispatcher.mark_serving().unwrap();
        let mut rx = dispatcher.shutdown_receiver();
        assert!(!*rx.borrow());

        dispatcher.teardown(Duration::from_secs(1)).await;

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn in_flight_guard_tracks_drops() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.in_flight_count(), 0);

        let first = dispatcher.in_flight_guard();
        let second = dispatcher.in_flight_guard();
        assert_eq!(dispatcher.in_flight_count(), 2);

        drop(first);
        assert_eq!(dispatcher.in_flight_count(), 1);
        drop(second);
        assert_eq!(dispatcher.in_flight_count(), 0);
    }
}
