//! Upstream frame feeds.
//!
//! An [`UpstreamSource`] turns an endpoint into a stream of connection
//! events. The relay engine owns the stream; dropping it must close the
//! underlying transport.

use bytes::Bytes;
use futures::stream::BoxStream;

pub mod ws;

pub use ws::WsUpstream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Open,
    Frame(Bytes),
    Error(String),
    /// Always the last event of a stream.
    Close,
}

pub trait UpstreamSource: Send + Sync {
    fn open(&self, endpoint: &str) -> BoxStream<'static, UpstreamEvent>;
}
