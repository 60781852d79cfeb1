//! HTTP transport: endpoint registry, dispatcher lifecycle, middleware,
//! and the server module.

pub mod adapter;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod registry;

pub use adapter::{Adapter, AdapterError, JsonAdapter};
pub use config::NetworkConfig;
pub use dispatcher::{
    DispatchError, Dispatcher, InFlightGuard, LifecycleError, LifecycleState, RegisterError,
    TeardownFailure, TeardownReport,
};
pub use endpoint::{normalize_path, Endpoint, EndpointKey, ServiceEndpoint};
pub use handlers::AppState;
pub use module::NetworkModule;
pub use registry::{EndpointRegistry, RegistryError, RouteMatch};
