// src/api/mod.rs
pub mod error;
pub mod routes;
pub mod service;

pub use error::ApiError;
pub use service::{ApiState, router, serve};
