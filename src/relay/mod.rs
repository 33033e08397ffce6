// src/relay/mod.rs
pub mod connector;
pub mod engine;
pub mod limiter;
pub mod messages;
pub mod sinks;

pub use connector::{ConnectionState, DisconnectKind, DisconnectOutcome, UpstreamConnector};
pub use engine::{RelayEngine, RelayEvent, RelayHandle, RelayStatus};
pub use limiter::RateLimiter;
pub use messages::{Outbound, StatusMessage};
pub use sinks::{Delivery, FrameSinkSet};
