//! Conveyor Server -- staged model-serving pipeline behind an axum HTTP front.

pub mod network;
pub mod service;

pub use network::{Dispatcher, NetworkConfig, NetworkModule, ServiceEndpoint};
pub use service::{ModelService, Service, ServiceConfig};
