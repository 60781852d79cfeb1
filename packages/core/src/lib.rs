//! Conveyor Core -- request/response message types and the model contract.

pub mod message;
pub mod model;

pub use message::{codes, RequestId, ServiceError, ServiceRequest, ServiceResponse};
pub use model::Model;
