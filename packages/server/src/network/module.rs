//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! requests. This separation lets the application register endpoints on
//! the shared dispatcher between `new()` and `serve()`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::adapter::{Adapter, JsonAdapter};
use super::config::NetworkConfig;
use super::dispatcher::{Dispatcher, TeardownReport};
use super::handlers::{
    dispatch_handler, health_handler, liveness_handler, readiness_handler, AppState,
};
use super::middleware::build_http_layers;

/// Manages the full HTTP server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- takes the shared dispatcher and allocates state
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- marks the dispatcher serving and accepts requests
///    until shutdown is signalled, then drains and tears down
///
/// The dispatcher is shared via `Arc` so the application can register
/// endpoints and trigger teardown from outside the module.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    dispatcher: Arc<Dispatcher>,
    adapter: Arc<dyn Adapter>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    ///
    /// Bodies are converted with the [`JsonAdapter`] unless
    /// [`with_adapter`](Self::with_adapter) swaps it out.
    #[must_use]
    pub fn new(config: NetworkConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            listener: None,
            dispatcher,
            adapter: Arc::new(JsonAdapter),
        }
    }

    /// Replaces the body adapter.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Returns a shared reference to the dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- Kubernetes liveness probe
    /// - `GET /health/ready` -- Kubernetes readiness probe
    /// - everything else -- the dispatch fallback
    ///
    /// Built-in routes shadow user endpoints of the same path.
    #[must_use]
    pub fn build_router(&self) -> Router {
        assemble_router(
            &self.config,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.adapter),
        )
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves requests until either the given future resolves or the
    /// dispatcher's own shutdown signal fires, whichever happens first.
    ///
    /// Consumes `self` because the listener is moved into the server.
    /// On shutdown the dispatcher drains in-flight requests (bounded by
    /// `config.drain_timeout`), tears every endpoint down, and the
    /// aggregated report is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatcher has no registered endpoints or
    /// the server hits a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<TeardownReport> {
        let listener = self
            .listener
            .expect("start() must be called before serve()");
        let dispatcher = self.dispatcher;
        let adapter = self.adapter;
        let config = self.config;

        let router = assemble_router(&config, Arc::clone(&dispatcher), adapter);

        // Open for traffic so dispatch and readiness succeed.
        dispatcher.mark_serving()?;

        let stats = tokio::spawn(periodic_stats(
            Arc::clone(&dispatcher),
            config.stats_interval,
        ));

        let mut dispatcher_shutdown = dispatcher.shutdown_receiver();
        let graceful = async move {
            tokio::select! {
                () = shutdown => {}
                _ = dispatcher_shutdown.changed() => {}
            }
        };

        info!("Serving HTTP requests");
        axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await?;

        let report = dispatcher.teardown(config.drain_timeout).await;
        stats.abort();

        if report.is_clean() {
            info!("Server stopped cleanly");
        } else {
            warn!(
                drained = report.drained,
                failures = report.failures.len(),
                "Server stopped with teardown issues"
            );
        }
        Ok(report)
    }
}

/// Builds the router: probe routes, the dispatch fallback, and the
/// middleware stack, all sharing one [`AppState`].
fn assemble_router(
    config: &NetworkConfig,
    dispatcher: Arc<Dispatcher>,
    adapter: Arc<dyn Adapter>,
) -> Router {
    let state = AppState {
        dispatcher,
        adapter,
        start_time: Instant::now(),
    };

    let layers = build_http_layers(config);

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .fallback(dispatch_handler)
        .layer(layers)
        .with_state(state)
}

/// Logs dispatcher stats at a fixed interval until shutdown.
async fn periodic_stats(dispatcher: Arc<Dispatcher>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the first immediate tick so stats don't fire at startup.
    ticker.tick().await;
    let mut shutdown_rx = dispatcher.shutdown_receiver();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!(
                    state = %dispatcher.state(),
                    in_flight = dispatcher.in_flight_count(),
                    endpoints = dispatcher.endpoint_count(),
                    "server stats"
                );
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(NetworkConfig::default(), Arc::new(Dispatcher::new()));
        assert!(module.listener.is_none());
    }

    #[test]
    fn dispatcher_returns_shared_arc() {
        let dispatcher = Arc::new(Dispatcher::new());
        let module = NetworkModule::new(NetworkConfig::default(), Arc::clone(&dispatcher));
        assert!(Arc::ptr_eq(&module.dispatcher(), &dispatcher));
    }

    #[test]
    fn build_router_creates_router() {
        let module = NetworkModule::new(NetworkConfig::default(), Arc::new(Dispatcher::new()));
        let _router = module.build_router();
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(NetworkConfig::default(), Arc::new(Dispatcher::new()));
        let port = module.start().await.expect("start should succeed");
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "start() must be called before serve()")]
    async fn serve_panics_without_start() {
        let module = NetworkModule::new(NetworkConfig::default(), Arc::new(Dispatcher::new()));
        let _ = module.serve(std::future::pending::<()>()).await;
    }

    #[tokio::test]
    async fn serve_requires_registered_endpoints() {
        let mut module = NetworkModule::new(NetworkConfig::default(), Arc::new(Dispatcher::new()));
        module.start().await.unwrap();
        let err = module
            .serve(std::future::pending::<()>())
            .await
            .expect_err("unregistered dispatcher cannot serve");
        assert!(err.to_string().contains("start serving"));
    }
}
