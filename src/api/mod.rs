//! HTTP surface: router, handlers, and error mapping.

pub mod error;
pub mod server;

pub use error::ApiError;
pub use server::{AppState, create_router, run_server};
