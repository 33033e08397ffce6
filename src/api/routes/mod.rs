pub mod config;
pub mod recordings;
pub mod status;
pub mod websocket;
