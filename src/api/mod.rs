//! HTTP API layer

pub mod errors;
pub mod handlers;

pub use errors::GateError;
pub use handlers::AppState;
