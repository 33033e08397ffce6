// src/lib.rs
pub mod api;
pub mod config;
pub mod core;
pub mod recorder;
pub mod relay;
pub mod testing;
pub mod upstream;

pub use config::{Config, ConfigPatch};
pub use relay::{RelayEngine, RelayHandle, RelayStatus};
