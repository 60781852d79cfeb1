//! HTTP handler definitions for the Conveyor server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod dispatch;
pub mod health;

pub use dispatch::dispatch_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use crate::network::adapter::Adapter;
use crate::network::dispatcher::Dispatcher;

/// Shared application state passed to all axum handlers via `State`
/// extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Request router and lifecycle owner.
    pub dispatcher: Arc<Dispatcher>,
    /// Body-to-request converter used by the dispatch handler.
    pub adapter: Arc<dyn Adapter>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
