use std::collections::BTreeMap;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::core::{ConsumerId, Frame};

use super::messages::{Outbound, StatusMessage};

#[derive(Debug)]
struct ConsumerSlot {
    tx: mpsc::Sender<Outbound>,
    frames_sent: u64,
    frames_dropped: u64,
}

/// Result of one non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full, the frame was skipped for this consumer only.
    Skipped,
    /// The consumer is gone and has been removed.
    Removed,
    Unknown,
}

/// Currently attached consumers. Every send is a `try_send` into the
/// consumer's own bounded queue, so one stalled viewer never holds up the
/// others.
#[derive(Debug, Default)]
pub struct FrameSinkSet {
    consumers: BTreeMap<ConsumerId, ConsumerSlot>,
}

impl FrameSinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn contains(&self, id: ConsumerId) -> bool {
        self.consumers.contains_key(&id)
    }

    /// Returns `true` if this is the first consumer.
    pub fn attach(&mut self, id: ConsumerId, tx: mpsc::Sender<Outbound>) -> bool {
        let was_empty = self.consumers.is_empty();
        self.consumers.insert(
            id,
            ConsumerSlot {
                tx,
                frames_sent: 0,
                frames_dropped: 0,
            },
        );
        was_empty
    }

    /// Returns `true` if the consumer was attached.
    pub fn detach(&mut self, id: ConsumerId) -> bool {
        match self.consumers.remove(&id) {
            Some(slot) => {
                log::debug!(
                    "[relay] {} detached (sent={}, dropped={})",
                    id,
                    slot.frames_sent,
                    slot.frames_dropped
                );
                true
            }
            None => false,
        }
    }

    pub fn send_to(&mut self, id: ConsumerId, message: Outbound) -> Delivery {
        let Some(slot) = self.consumers.get_mut(&id) else {
            return Delivery::Unknown;
        };

        let is_frame = message.is_frame();
        match slot.tx.try_send(message) {
            Ok(()) => {
                if is_frame {
                    slot.frames_sent += 1;
                }
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) if is_frame => {
                slot.frames_dropped += 1;
                Delivery::Skipped
            }
            Err(TrySendError::Full(_)) => {
                // A status update can't be skipped without the viewer
                // showing a wrong state; a consumer that far behind is dropped.
                log::warn!("[relay] {} queue full on status update, removing", id);
                self.consumers.remove(&id);
                Delivery::Removed
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("[relay] {} closed, removing", id);
                self.consumers.remove(&id);
                Delivery::Removed
            }
        }
    }

    /// Sends `frame` to every consumer attached when the round starts.
    /// Returns the ids removed during the round.
    pub fn broadcast(&mut self, frame: &Frame) -> Vec<ConsumerId> {
        self.fan_out(|| Outbound::Frame(frame.clone()))
    }

    pub fn notify(&mut self, status: &StatusMessage) -> Vec<ConsumerId> {
        self.fan_out(|| Outbound::Status(status.clone()))
    }

    fn fan_out<F>(&mut self, make: F) -> Vec<ConsumerId>
    where
        F: Fn() -> Outbound,
    {
        let snapshot: Vec<ConsumerId> = self.consumers.keys().copied().collect();
        let mut removed = Vec::new();
        for id in snapshot {
            if self.send_to(id, make()) == Delivery::Removed {
                removed.push(id);
            }
        }
        removed
    }

    pub fn frames_dropped(&self) -> u64 {
        self.consumers.values().map(|s| s.frames_dropped).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::time::Instant;

    fn frame(tag: u8) -> Frame {
        Frame::new(Bytes::from(vec![tag]), Instant::now())
    }

    #[test]
    fn first_attach_is_reported() {
        let mut sinks = FrameSinkSet::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        assert!(sinks.attach(ConsumerId(1), tx1));
        assert!(!sinks.attach(ConsumerId(2), tx2));
        assert_eq!(sinks.len(), 2);
    }

    #[test]
    fn closed_consumer_is_removed_without_affecting_others() {
        let mut sinks = FrameSinkSet::new();
        let (tx1, rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        sinks.attach(ConsumerId(1), tx1);
        sinks.attach(ConsumerId(2), tx2);
        sinks.attach(ConsumerId(3), tx3);

        drop(rx1);
        let removed = sinks.broadcast(&frame(7));

        assert_eq!(removed, vec![ConsumerId(1)]);
        assert!(!sinks.contains(ConsumerId(1)));
        assert!(matches!(rx2.try_recv(), Ok(Outbound::Frame(f)) if f.payload[0] == 7));
        assert!(matches!(rx3.try_recv(), Ok(Outbound::Frame(f)) if f.payload[0] == 7));
    }

    #[test]
    fn slow_consumer_skips_frames_but_stays_attached() {
        let mut sinks = FrameSinkSet::new();
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        sinks.attach(ConsumerId(1), slow_tx);
        sinks.attach(ConsumerId(2), fast_tx);

        for tag in 0..3 {
            assert!(sinks.broadcast(&frame(tag)).is_empty());
        }

        assert!(sinks.contains(ConsumerId(1)));
        assert_eq!(sinks.frames_dropped(), 2);
        assert!(matches!(slow_rx.try_recv(), Ok(Outbound::Frame(f)) if f.payload[0] == 0));
        assert!(slow_rx.try_recv().is_err());
        for tag in 0..3 {
            assert!(matches!(fast_rx.try_recv(), Ok(Outbound::Frame(f)) if f.payload[0] == tag));
        }
    }

    #[test]
    fn status_on_full_queue_removes_consumer() {
        let mut sinks = FrameSinkSet::new();
        let (tx, _rx) = mpsc::channel(1);
        sinks.attach(ConsumerId(1), tx);

        sinks.broadcast(&frame(1));
        let removed = sinks.notify(&StatusMessage::connection(false));

        assert_eq!(removed, vec![ConsumerId(1)]);
        assert!(sinks.is_empty());
    }

    #[test]
    fn detach_unknown_is_noop() {
        let mut sinks = FrameSinkSet::new();
        assert!(!sinks.detach(ConsumerId(42)));
        assert_eq!(sinks.send_to(ConsumerId(42), Outbound::Frame(frame(0))), Delivery::Unknown);
    }
}
