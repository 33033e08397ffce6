// src/relay/engine.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Config, ConfigPatch};
use crate::core::{ConfigError, ConsumerId, Frame, RelayError};
use crate::recorder::{
    Encoder, Recorder, RecorderEvent, RecorderFault, RecorderSettings, RecordingStatus,
};
use crate::upstream::{UpstreamEvent, UpstreamSource};

use super::connector::{ConnectionState, DisconnectKind, DisconnectOutcome, UpstreamConnector};
use super::limiter::RateLimiter;
use super::messages::{Outbound, StatusMessage};
use super::sinks::{Delivery, FrameSinkSet};

const EVENT_QUEUE: usize = 1024;

/// Everything the engine reacts to. Requests come from `RelayHandle`;
/// the rest are completions of tasks the engine spawned itself.
#[derive(Debug)]
pub enum RelayEvent {
    Attach {
        id: ConsumerId,
        tx: mpsc::Sender<Outbound>,
    },
    Detach {
        id: ConsumerId,
    },
    GetConfig {
        reply: oneshot::Sender<Config>,
    },
    UpdateConfig {
        patch: ConfigPatch,
        reply: oneshot::Sender<Result<Config, ConfigError>>,
    },
    GetStatus {
        reply: oneshot::Sender<RelayStatus>,
    },
    Upstream {
        generation: u64,
        event: UpstreamEvent,
    },
    ReconnectDue {
        generation: u64,
    },
    LivenessCheck {
        generation: u64,
    },
    Recorder(RecorderEvent),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub state: ConnectionState,
    pub source: String,
    pub consumers: usize,
    pub has_last_frame: bool,
    pub last_frame_age_ms: Option<u64>,
    pub generation: u64,
    pub reconnects: u64,
    pub max_fps: u32,
    pub frames_received: u64,
    pub frames_admitted: u64,
    pub frames_dropped: u64,
    pub consumer_drops: u64,
    pub recording: RecordingStatus,
}

/// Cloneable front door to the engine task.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayEvent>,
    next_id: Arc<AtomicU64>,
    consumer_queue: usize,
}

impl RelayHandle {
    /// Registers a new consumer. The receiver yields the current connection
    /// status first, then frames and notifications.
    pub async fn attach(&self) -> Result<(ConsumerId, mpsc::Receiver<Outbound>), RelayError> {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(self.consumer_queue);
        self.send(RelayEvent::Attach { id, tx }).await?;
        Ok((id, rx))
    }

    pub async fn detach(&self, id: ConsumerId) -> Result<(), RelayError> {
        self.send(RelayEvent::Detach { id }).await
    }

    pub async fn config(&self) -> Result<Config, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayEvent::GetConfig { reply }).await?;
        rx.await.map_err(|_| RelayError::Stopped)
    }

    pub async fn update_config(&self, patch: ConfigPatch) -> Result<Config, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayEvent::UpdateConfig { patch, reply }).await?;
        Ok(rx.await.map_err(|_| RelayError::Stopped)??)
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayEvent::GetStatus { reply }).await?;
        rx.await.map_err(|_| RelayError::Stopped)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RelayEvent::Shutdown).await;
    }

    async fn send(&self, event: RelayEvent) -> Result<(), RelayError> {
        self.tx.send(event).await.map_err(|_| RelayError::Stopped)
    }
}

/// Owner of all relay state.
///
/// Runs as a single task; every handler below is synchronous and runs to
/// completion before the next event is looked at, so the connector,
/// consumer set, last frame and recorder are never observed half-updated.
pub struct RelayEngine {
    config: Config,
    saves: Option<mpsc::UnboundedSender<Config>>,
    events: mpsc::Sender<RelayEvent>,
    upstream: Arc<dyn UpstreamSource>,
    connector: UpstreamConnector,
    limiter: RateLimiter,
    sinks: FrameSinkSet,
    recorder: Recorder,
    last_frame: Option<Frame>,
    pump: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    frames_received: u64,
    stats_mark: (u64, u64, u64),
}

impl RelayEngine {
    /// Starts the engine task. `config_path`, when given, receives the
    /// config after every accepted update, written by one saver task in
    /// the order the updates were accepted.
    pub fn spawn(
        config: Config,
        upstream: Arc<dyn UpstreamSource>,
        encoder: Arc<dyn Encoder>,
        config_path: Option<PathBuf>,
    ) -> (RelayHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);

        let handle = RelayHandle {
            tx: tx.clone(),
            next_id: Arc::new(AtomicU64::new(0)),
            consumer_queue: config.relay.consumer_queue.max(1),
        };

        let saves = config_path.map(|path| {
            let (save_tx, save_rx) = mpsc::unbounded_channel();
            tokio::spawn(save_configs(path, save_rx));
            save_tx
        });

        let engine = RelayEngine {
            connector: UpstreamConnector::new(config.source.reconnect_interval()),
            limiter: RateLimiter::new(config.relay.max_fps),
            sinks: FrameSinkSet::new(),
            recorder: Recorder::new(
                encoder,
                RecorderSettings::from_config(&config.recording),
                tx.clone(),
            ),
            events: tx,
            upstream,
            config,
            saves,
            last_frame: None,
            pump: None,
            timer: None,
            frames_received: 0,
            stats_mark: (0, 0, 0),
        };

        let task = tokio::spawn(engine.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RelayEvent>) {
        log::info!(
            "[relay] started: source={} max_fps={} reconnect={:?}",
            self.config.source.url,
            self.config.relay.max_fps,
            self.connector.reconnect_interval()
        );

        if self.config.recording.enabled {
            self.recorder.enable();
        }
        self.reconcile();

        let period = self.config.relay.stats_interval();
        let mut stats = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(RelayEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event),
                },
                _ = stats.tick() => self.log_stats(),
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Attach { id, tx } => self.attach(id, tx),
            RelayEvent::Detach { id } => self.detach(id),
            RelayEvent::GetConfig { reply } => {
                let _ = reply.send(self.config.clone());
            }
            RelayEvent::UpdateConfig { patch, reply } => {
                let result = self.update_config(patch);
                let _ = reply.send(result);
            }
            RelayEvent::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
            RelayEvent::Upstream { generation, event } => self.on_upstream(generation, event),
            RelayEvent::ReconnectDue { generation } => self.on_reconnect_due(generation),
            RelayEvent::LivenessCheck { generation } => {
                if generation == self.connector.generation() {
                    self.timer = None;
                    self.on_disconnect(generation, DisconnectKind::Close);
                }
            }
            RelayEvent::Recorder(event) => self.on_recorder_event(event),
            RelayEvent::Shutdown => {}
        }
    }

    fn has_demand(&self) -> bool {
        !self.sinks.is_empty() || self.recorder.is_enabled()
    }

    /// Keeps the connector running exactly while there is demand.
    fn reconcile(&mut self) {
        let demand = self.has_demand();
        if demand && self.connector.is_idle() {
            if let Some(generation) = self.connector.start() {
                self.connect(generation);
            }
        } else if !demand && !self.connector.is_idle() {
            self.stop_upstream("no demand");
        }
    }

    fn connect(&mut self, generation: u64) {
        log::info!(
            "[relay] connecting to {} (generation {})",
            self.config.source.url,
            generation
        );

        self.abort_pump();
        let mut stream = self.upstream.open(&self.config.source.url);
        let events = self.events.clone();
        self.pump = Some(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if events
                    .send(RelayEvent::Upstream { generation, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    fn stop_upstream(&mut self, reason: &str) {
        if self.connector.stop() {
            log::info!("[relay] upstream stopped ({})", reason);
        }
        self.last_frame = None;
        self.abort_pump();
        self.cancel_timer();
    }

    fn abort_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn arm_timer(&mut self, delay: Duration, event: RelayEvent) {
        self.cancel_timer();
        let events = self.events.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event).await;
        }));
    }

    fn attach(&mut self, id: ConsumerId, tx: mpsc::Sender<Outbound>) {
        let first = self.sinks.attach(id, tx);
        log::info!(
            "[relay] {} attached ({} consumers{})",
            id,
            self.sinks.len(),
            if first { ", first" } else { "" }
        );

        let connected = self.connector.is_connected();
        let greeting = Outbound::Status(StatusMessage::connection(connected));
        if self.sinks.send_to(id, greeting) == Delivery::Removed {
            self.reconcile();
            return;
        }

        if self.connector.is_idle() {
            self.reconcile();
        } else if connected {
            if let Some(frame) = self.last_frame.clone() {
                self.sinks.send_to(id, Outbound::Frame(frame));
            }
        }
    }

    fn detach(&mut self, id: ConsumerId) {
        if self.sinks.detach(id) {
            log::info!("[relay] {} detached ({} consumers)", id, self.sinks.len());
        }
        self.reconcile();
    }

    fn announce(&mut self, status: StatusMessage) {
        let removed = self.sinks.notify(&status);
        if !removed.is_empty() {
            self.reconcile();
        }
    }

    fn on_upstream(&mut self, generation: u64, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Open => {
                if self.connector.on_open(generation) {
                    log::info!("[relay] upstream connected: {}", self.config.source.url);
                    self.announce(StatusMessage::connection(true));
                }
            }
            UpstreamEvent::Frame(payload) => self.on_frame(generation, payload),
            UpstreamEvent::Error(reason) => {
                if generation == self.connector.generation() {
                    log::warn!("[relay] upstream error: {}", reason);
                }
                self.on_disconnect(generation, DisconnectKind::Error);
            }
            UpstreamEvent::Close => self.on_disconnect(generation, DisconnectKind::Close),
        }
    }

    fn on_frame(&mut self, generation: u64, payload: Bytes) {
        let now = Instant::now();
        let was_connected = self.connector.is_connected();
        if !self.connector.on_frame(generation, now) {
            return;
        }
        if !was_connected {
            log::info!("[relay] upstream connected: {}", self.config.source.url);
            self.announce(StatusMessage::connection(true));
            if self.connector.is_idle() {
                return;
            }
        }

        self.frames_received += 1;
        if !self.limiter.admit(now) {
            return;
        }

        let frame = Frame::new(payload, now);
        self.recorder.feed(&frame);
        let removed = self.sinks.broadcast(&frame);
        self.last_frame = Some(frame);

        if !removed.is_empty() {
            self.reconcile();
        }
    }

    fn on_disconnect(&mut self, generation: u64, kind: DisconnectKind) {
        let outcome =
            self.connector
                .on_disconnect(generation, kind, Instant::now(), self.has_demand());

        match outcome {
            DisconnectOutcome::Stale => {}
            DisconnectOutcome::Absorbed { recheck_after } => {
                log::debug!("[relay] upstream {:?} inside grace window, ignored", kind);
                if let Some(delay) = recheck_after {
                    self.arm_timer(delay, RelayEvent::LivenessCheck { generation });
                }
            }
            DisconnectOutcome::Reconnect { generation, delay } => {
                log::warn!("[relay] upstream lost, reconnecting in {:?}", delay);
                self.last_frame = None;
                self.abort_pump();
                self.announce(StatusMessage::connection(false));
                self.arm_timer(delay, RelayEvent::ReconnectDue { generation });
            }
            DisconnectOutcome::Idle => {
                log::info!("[relay] upstream lost with no demand, staying idle");
                self.last_frame = None;
                self.abort_pump();
                self.cancel_timer();
            }
        }
    }

    fn on_reconnect_due(&mut self, generation: u64) {
        if let Some(next) = self.connector.on_reconnect_due(generation) {
            self.timer = None;
            self.connect(next);
        }
    }

    fn update_config(&mut self, patch: ConfigPatch) -> Result<Config, ConfigError> {
        if patch.is_empty() {
            return Ok(self.config.clone());
        }

        let previous_url = self.config.source.url.clone();
        self.config.apply_patch(&patch)?;

        self.recorder
            .update_settings(RecorderSettings::from_config(&self.config.recording));
        if self.config.recording.enabled {
            self.recorder.enable();
        } else {
            self.recorder.disable();
        }

        if self.config.source.url != previous_url {
            log::info!(
                "[relay] source changed: {} → {}",
                previous_url,
                self.config.source.url
            );
            self.replace_source();
        }

        self.reconcile();
        self.persist();
        Ok(self.config.clone())
    }

    /// Viewers are told before the old connection goes away, so no frame
    /// from the new endpoint can reach them ahead of the notice. A running
    /// recording moves on to a fresh segment.
    fn replace_source(&mut self) {
        let _ = self.sinks.notify(&StatusMessage::source_changed());
        self.stop_upstream("source changed");
        if let Some(fault) = self.recorder.start_new_segment("source changed") {
            self.on_recorder_fault(fault);
        }
        self.reconcile();
    }

    fn on_recorder_event(&mut self, event: RecorderEvent) {
        if let Some(fault) = self.recorder.handle(event) {
            self.on_recorder_fault(fault);
        }
    }

    fn on_recorder_fault(&mut self, fault: RecorderFault) {
        log::error!("[relay] recording stopped: {}", fault.message);
        let _ = self
            .sinks
            .notify(&StatusMessage::recording_error(fault.message));

        if self.config.recording.enabled != self.recorder.is_enabled() {
            self.config.recording.enabled = self.recorder.is_enabled();
            self.persist();
        }
        self.reconcile();
    }

    fn persist(&self) {
        if let Some(saves) = &self.saves {
            let _ = saves.send(self.config.clone());
        }
    }

    fn status(&self) -> RelayStatus {
        let now = Instant::now();
        RelayStatus {
            state: self.connector.state(),
            source: self.config.source.url.clone(),
            consumers: self.sinks.len(),
            has_last_frame: self.last_frame.is_some(),
            last_frame_age_ms: self
                .connector
                .last_frame_at()
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            generation: self.connector.generation(),
            reconnects: self.connector.reconnects(),
            max_fps: self.config.relay.max_fps,
            frames_received: self.frames_received,
            frames_admitted: self.limiter.admitted(),
            frames_dropped: self.limiter.dropped(),
            consumer_drops: self.sinks.frames_dropped(),
            recording: self.recorder.status(),
        }
    }

    fn log_stats(&mut self) {
        let (received, admitted, dropped) = self.stats_mark;
        let now = (
            self.frames_received,
            self.limiter.admitted(),
            self.limiter.dropped(),
        );
        if now.0 == received {
            return;
        }
        log::info!(
            "[relay] frames: received={} admitted={} dropped={} consumers={} state={}",
            now.0 - received,
            now.1 - admitted,
            now.2 - dropped,
            self.sinks.len(),
            self.connector.state()
        );
        self.stats_mark = now;
    }

    fn shutdown(&mut self) {
        log::info!("[relay] shutting down");
        self.stop_upstream("shutdown");
        self.recorder.disable();
    }
}

/// Writes configs one at a time. When several are queued only the newest
/// is written.
async fn save_configs(path: PathBuf, mut configs: mpsc::UnboundedReceiver<Config>) {
    while let Some(mut config) = configs.recv().await {
        while let Ok(newer) = configs.try_recv() {
            config = newer;
        }
        let target = path.clone();
        match tokio::task::spawn_blocking(move || config.save(&target)).await {
            Ok(Ok(())) => log::debug!("[relay] config saved to {}", path.display()),
            Ok(Err(err)) => log::warn!("[relay] could not save config: {:#}", err),
            Err(err) => log::warn!("[relay] config save task failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{ScriptedEncoder, ScriptedUpstream};

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn engine_config() -> Config {
        let mut config = Config::default();
        config.source.url = "ws://camera.local/ws".to_string();
        config.recording.dir = std::env::temp_dir()
            .join("frame-relay-engine-tests")
            .to_string_lossy()
            .into_owned();
        config
    }

    #[tokio::test(start_paused = true)]
    async fn update_with_invalid_url_is_rejected_and_nothing_changes() {
        let upstream = Arc::new(ScriptedUpstream::new());
        let encoder = Arc::new(ScriptedEncoder::available());
        let (relay, _task) = RelayEngine::spawn(engine_config(), upstream.clone(), encoder, None);

        let patch = ConfigPatch {
            source_web_socket: Some("http://camera.local".to_string()),
            ..ConfigPatch::default()
        };
        let err = relay.update_config(patch).await.unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));

        let config = relay.config().await.unwrap();
        assert_eq!(config.source.url, "ws://camera.local/ws");
        settle().await;
        assert_eq!(upstream.opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_interval_is_rejected_and_engine_keeps_running() {
        let upstream = Arc::new(ScriptedUpstream::new());
        let encoder = Arc::new(ScriptedEncoder::available());
        let (relay, _task) = RelayEngine::spawn(engine_config(), upstream, encoder, None);

        let patch = ConfigPatch {
            recording_interval: Some(u64::MAX / 30),
            ..ConfigPatch::default()
        };
        let err = relay.update_config(patch).await.unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));

        let config = relay.config().await.unwrap();
        assert_eq!(config.recording.interval_minutes, 5);
        assert!(relay.status().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_counters() {
        let upstream = Arc::new(ScriptedUpstream::new());
        let encoder = Arc::new(ScriptedEncoder::available());
        let (relay, _task) = RelayEngine::spawn(engine_config(), upstream.clone(), encoder, None);

        let (_id, _rx) = relay.attach().await.unwrap();
        settle().await;
        upstream.push(0, UpstreamEvent::Open);
        upstream.push(0, UpstreamEvent::Frame(Bytes::from_static(b"a")));
        upstream.push(0, UpstreamEvent::Frame(Bytes::from_static(b"b")));
        settle().await;

        let status = relay.status().await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.consumers, 1);
        assert_eq!(status.frames_received, 2);
        assert_eq!(status.frames_admitted, 1);
        assert_eq!(status.frames_dropped, 1);
        assert!(status.has_last_frame);
        assert!(!status.recording.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_reports_stopped_engine() {
        let upstream = Arc::new(ScriptedUpstream::new());
        let encoder = Arc::new(ScriptedEncoder::available());
        let (relay, task) = RelayEngine::spawn(engine_config(), upstream, encoder, None);

        relay.shutdown().await;
        task.await.unwrap();

        assert!(matches!(relay.status().await, Err(RelayError::Stopped)));
    }
}
