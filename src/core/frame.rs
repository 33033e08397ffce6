use std::fmt;

use bytes::Bytes;
use tokio::time::Instant;

/// One opaque upstream payload (a complete still image).
///
/// Cloning is cheap: the payload is reference counted and shared between
/// the last-frame cache, the recorder and every consumer queue.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Bytes,
    pub received_at: Instant,
}

impl Frame {
    pub fn new(payload: Bytes, received_at: Instant) -> Self {
        Self {
            payload,
            received_at,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Stable identity of an attached consumer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}
