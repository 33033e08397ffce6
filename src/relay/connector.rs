use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    Close,
    Error,
}

/// What the caller must do after a close/error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Report from an older connection.
    Stale,
    /// Frames arrived inside the grace window; the report is absorbed.
    /// For a close, the window is re-checked once it has elapsed.
    Absorbed { recheck_after: Option<Duration> },
    /// Genuine loss: tear the connection down and reconnect after `delay`.
    Reconnect { generation: u64, delay: Duration },
    /// Genuine loss with nobody left to serve.
    Idle,
}

/// Lifecycle of the single upstream connection.
///
/// Pure state machine: it never touches sockets or timers. Each call that
/// (re)connects hands out a fresh `generation`; events and timers carry the
/// generation they were created for, and anything older than the current
/// one is ignored. Bumping the generation is how `stop()` cancels a pending
/// reconnect.
#[derive(Debug)]
pub struct UpstreamConnector {
    state: ConnectionState,
    generation: u64,
    reconnect_interval: Duration,
    last_frame_at: Option<Instant>,
    reconnects: u64,
}

impl UpstreamConnector {
    pub fn new(reconnect_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Idle,
            generation: 0,
            reconnect_interval,
            last_frame_at: None,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Idle
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }

    /// Returns the generation to connect with, or `None` when a connection
    /// is already being established or is up.
    pub fn start(&mut self) -> Option<u64> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => None,
            ConnectionState::Idle | ConnectionState::Reconnecting => Some(self.begin_connect()),
        }
    }

    /// Returns `true` if there was anything to stop.
    pub fn stop(&mut self) -> bool {
        let was_active = self.state != ConnectionState::Idle;
        self.state = ConnectionState::Idle;
        self.generation += 1;
        self.last_frame_at = None;
        was_active
    }

    /// Returns `true` on the Connecting → Connected transition.
    pub fn on_open(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        true
    }

    /// Records liveness. Returns `false` for frames of an old connection.
    pub fn on_frame(&mut self, generation: u64, now: Instant) -> bool {
        if generation != self.generation {
            return false;
        }
        match self.state {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => self.state = ConnectionState::Connected,
            ConnectionState::Idle | ConnectionState::Reconnecting => return false,
        }
        self.last_frame_at = Some(now);
        true
    }

    pub fn on_disconnect(
        &mut self,
        generation: u64,
        kind: DisconnectKind,
        now: Instant,
        has_demand: bool,
    ) -> DisconnectOutcome {
        if generation != self.generation
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            return DisconnectOutcome::Stale;
        }

        if let Some(last) = self.last_frame_at {
            let since = now.saturating_duration_since(last);
            if since < self.reconnect_interval {
                let recheck_after = match kind {
                    DisconnectKind::Close => Some(self.reconnect_interval - since),
                    DisconnectKind::Error => None,
                };
                return DisconnectOutcome::Absorbed { recheck_after };
            }
        }

        if !has_demand {
            self.stop();
            return DisconnectOutcome::Idle;
        }

        self.state = ConnectionState::Reconnecting;
        self.generation += 1;
        DisconnectOutcome::Reconnect {
            generation: self.generation,
            delay: self.reconnect_interval,
        }
    }

    /// Fires the reconnect timer armed by `on_disconnect`. Returns the
    /// generation of the new connection attempt.
    pub fn on_reconnect_due(&mut self, generation: u64) -> Option<u64> {
        if generation != self.generation || self.state != ConnectionState::Reconnecting {
            return None;
        }
        self.reconnects += 1;
        Some(self.begin_connect())
    }

    fn begin_connect(&mut self) -> u64 {
        self.state = ConnectionState::Connecting;
        self.generation += 1;
        self.last_frame_at = None;
        self.generation
    }
}
