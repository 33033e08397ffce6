// src/recorder/recorder.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::RecordingConfig;
use crate::core::Frame;
use crate::core::timestamp::recording_file_name;
use crate::relay::RelayEvent;

use super::{Encoder, sweep_recordings};

/// Frames buffered between the relay and the encoder's stdin.
const INPUT_QUEUE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderSettings {
    pub dir: PathBuf,
    pub segment_length: Duration,
    pub max_recordings: usize,
    pub restart_delay: Duration,
}

impl RecorderSettings {
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            dir: config.dir_path(),
            segment_length: config.segment_length(),
            max_recordings: config.max_recordings,
            restart_delay: config.restart_delay(),
        }
    }
}

/// Completions of recorder background work, delivered through the relay
/// event loop. Session ids tie them to the session that started them.
#[derive(Debug)]
pub enum RecorderEvent {
    Probed { attempt: u64, result: Result<String, String> },
    WriteFailed { session: u64, reason: String },
    Exited { session: u64, result: Result<(), String> },
    RestartDue,
    RotateDue { session: u64 },
}

/// Recording failed for good and has been switched off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderFault {
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub file: String,
    pub started_at: String,
    pub frames: u64,
    pub bytes: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub enabled: bool,
    pub probing: bool,
    pub restart_pending: bool,
    pub session: Option<SessionSummary>,
}

struct ActiveSession {
    id: u64,
    path: PathBuf,
    started_at: DateTime<Local>,
    frames: u64,
    bytes: u64,
    skipped: u64,
    input: mpsc::Sender<Bytes>,
    rotation: JoinHandle<()>,
}

/// Optional recording sink.
///
/// `session` is the single authority on whether frames are written: `feed`
/// checks it before every write and `disable` clears it, both from the
/// relay's event loop.
pub struct Recorder {
    encoder: Arc<dyn Encoder>,
    events: mpsc::Sender<RelayEvent>,
    settings: RecorderSettings,
    enabled: bool,
    probing: bool,
    probe_attempt: u64,
    session: Option<ActiveSession>,
    next_session: u64,
    restart: Option<JoinHandle<()>>,
    names: SegmentNames,
}

/// Picks segment file names without touching the disk. A timestamp name
/// that repeats gets a `-N` suffix.
#[derive(Debug, Default)]
struct SegmentNames {
    last: Option<String>,
    repeats: u32,
}

impl SegmentNames {
    fn next(&mut self, name: String) -> String {
        if self.last.as_deref() == Some(name.as_str()) {
            self.repeats += 1;
            let (stem, ext) = name.rsplit_once('.').unwrap_or((name.as_str(), ""));
            format!("{}-{}.{}", stem, self.repeats, ext)
        } else {
            self.repeats = 0;
            self.last = Some(name.clone());
            name
        }
    }
}

impl Recorder {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        settings: RecorderSettings,
        events: mpsc::Sender<RelayEvent>,
    ) -> Self {
        Self {
            encoder,
            events,
            settings,
            enabled: false,
            probing: false,
            probe_attempt: 0,
            session: None,
            next_session: 0,
            restart: None,
            names: SegmentNames::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Turns recording on. The encoder is probed first; the session starts
    /// when the probe result comes back.
    pub fn enable(&mut self) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        self.probing = true;
        self.probe_attempt += 1;

        log::info!("[recorder] enabled, probing encoder");

        let attempt = self.probe_attempt;
        let probe = self.encoder.probe();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = probe.await.map_err(|e| format!("{:#}", e));
            let _ = events
                .send(RelayEvent::Recorder(RecorderEvent::Probed { attempt, result }))
                .await;
        });
    }

    /// Turns recording off. The encoder's input is closed, not killed, so
    /// the current file is finalized.
    pub fn disable(&mut self) {
        if !self.enabled && self.session.is_none() {
            return;
        }
        self.enabled = false;
        self.probing = false;
        self.cancel_restart();
        self.close_session("recording disabled");
    }

    pub fn feed(&mut self, frame: &Frame) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.input.try_send(frame.payload.clone()) {
            Ok(()) => {
                session.frames += 1;
                session.bytes += frame.len() as u64;
            }
            Err(TrySendError::Full(_)) => {
                session.skipped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                let id = session.id;
                self.on_write_failed(id, "encoder input closed");
            }
        }
    }

    pub fn update_settings(&mut self, settings: RecorderSettings) {
        let retention_changed = settings.max_recordings != self.settings.max_recordings;
        self.settings = settings;
        if retention_changed {
            log::info!(
                "[recorder] keeping at most {} recordings",
                self.settings.max_recordings
            );
            self.sweep();
        }
    }

    pub fn handle(&mut self, event: RecorderEvent) -> Option<RecorderFault> {
        match event {
            RecorderEvent::Probed { attempt, result } => {
                if attempt != self.probe_attempt || !self.probing {
                    return None;
                }
                self.probing = false;
                if !self.enabled {
                    return None;
                }
                match result {
                    Ok(version) => {
                        log::info!("[recorder] encoder ok: {}", version);
                        self.open_or_fail()
                    }
                    Err(reason) => {
                        log::warn!("[recorder] encoder probe failed: {}", reason);
                        Some(self.fail(format!("encoder not available: {}", reason)))
                    }
                }
            }
            RecorderEvent::WriteFailed { session, reason } => {
                if self.is_current(session) {
                    self.on_write_failed(session, &reason);
                }
                None
            }
            RecorderEvent::Exited { session, result } => {
                if self.is_current(session) {
                    match result {
                        Err(reason) => {
                            log::error!("[recorder] encoder died: {}", reason);
                            Some(self.fail(format!("encoder failed: {}", reason)))
                        }
                        Ok(()) => {
                            log::warn!("[recorder] encoder exited on its own");
                            self.close_session("encoder exited");
                            self.schedule_restart();
                            None
                        }
                    }
                } else {
                    match result {
                        Ok(()) => log::info!("[recorder] segment {} finalized", session),
                        Err(reason) => {
                            log::warn!("[recorder] segment {} ended badly: {}", session, reason)
                        }
                    }
                    self.sweep();
                    None
                }
            }
            RecorderEvent::RestartDue => {
                self.restart = None;
                if self.enabled && !self.probing && self.session.is_none() {
                    log::info!("[recorder] restarting after write failure");
                    self.open_or_fail()
                } else {
                    None
                }
            }
            RecorderEvent::RotateDue { session } => {
                if !self.is_current(session) {
                    return None;
                }
                self.start_new_segment("segment complete")
            }
        }
    }

    /// Closes the running segment and opens a fresh file. No-op when no
    /// session is active.
    pub fn start_new_segment(&mut self, reason: &str) -> Option<RecorderFault> {
        if self.session.is_none() {
            return None;
        }
        self.close_session(reason);
        self.open_or_fail()
    }

    pub fn status(&self) -> RecordingStatus {
        RecordingStatus {
            enabled: self.enabled,
            probing: self.probing,
            restart_pending: self.restart.is_some(),
            session: self.session.as_ref().map(|s| SessionSummary {
                file: s
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                started_at: s.started_at.to_rfc3339(),
                frames: s.frames,
                bytes: s.bytes,
                skipped: s.skipped,
            }),
        }
    }

    /// Runs the retention sweep off the event loop.
    pub fn sweep(&self) {
        let dir = self.settings.dir.clone();
        let max = self.settings.max_recordings;
        let active = self.session.as_ref().map(|s| s.path.clone());
        tokio::task::spawn_blocking(move || {
            if let Err(err) = sweep_recordings(&dir, max, active.as_deref()) {
                log::warn!("[retention] sweep of {} failed: {}", dir.display(), err);
            }
        });
    }

    fn is_current(&self, session: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session)
    }

    fn on_write_failed(&mut self, session: u64, reason: &str) {
        log::warn!("[recorder] write to session {} failed: {}", session, reason);
        self.close_session("write failed");
        self.schedule_restart();
    }

    fn open_or_fail(&mut self) -> Option<RecorderFault> {
        match self.open_session() {
            Ok(()) => None,
            Err(reason) => {
                log::error!("[recorder] could not start encoder: {}", reason);
                Some(self.fail(format!("could not start recording: {}", reason)))
            }
        }
    }

    fn fail(&mut self, message: String) -> RecorderFault {
        self.enabled = false;
        self.probing = false;
        self.cancel_restart();
        self.close_session("recording failed");
        RecorderFault { message }
    }

    /// Runs on the event loop, so nothing here touches the disk. The
    /// directory is created when the relay starts.
    fn open_session(&mut self) -> Result<(), String> {
        let started_at = Local::now();
        let path = self
            .settings
            .dir
            .join(self.names.next(recording_file_name(started_at)));
        let pipeline = self.encoder.start(&path).map_err(|e| format!("{:#}", e))?;

        self.next_session += 1;
        let id = self.next_session;
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);

        tokio::spawn(write_frames(id, pipeline.input, input_rx, self.events.clone()));

        let exit = pipeline.exit;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = exit.await.map_err(|e| format!("{:#}", e));
            let _ = events
                .send(RelayEvent::Recorder(RecorderEvent::Exited { session: id, result }))
                .await;
        });

        let segment = self.settings.segment_length;
        let events = self.events.clone();
        let rotation = tokio::spawn(async move {
            tokio::time::sleep(segment).await;
            let _ = events
                .send(RelayEvent::Recorder(RecorderEvent::RotateDue { session: id }))
                .await;
        });

        log::info!("[recorder] session {} → {}", id, path.display());

        self.session = Some(ActiveSession {
            id,
            path,
            started_at,
            frames: 0,
            bytes: 0,
            skipped: 0,
            input: input_tx,
            rotation,
        });
        Ok(())
    }

    fn close_session(&mut self, reason: &str) {
        if let Some(session) = self.session.take() {
            session.rotation.abort();
            log::info!(
                "[recorder] session {} closed ({}): frames={} bytes={} skipped={}",
                session.id,
                reason,
                session.frames,
                session.bytes,
                session.skipped
            );
            // Dropping `session.input` ends the writer, which closes stdin.
        }
    }

    /// One delayed restart per failure; no retry loop.
    fn schedule_restart(&mut self) {
        if !self.enabled || self.restart.is_some() {
            return;
        }
        let delay = self.settings.restart_delay;
        let events = self.events.clone();
        self.restart = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events
                .send(RelayEvent::Recorder(RecorderEvent::RestartDue))
                .await;
        }));
    }

    fn cancel_restart(&mut self) {
        if let Some(restart) = self.restart.take() {
            restart.abort();
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.cancel_restart();
        if let Some(session) = self.session.take() {
            session.rotation.abort();
        }
    }
}

async fn write_frames(
    session: u64,
    mut input: Box<dyn AsyncWrite + Send + Unpin>,
    mut frames: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<RelayEvent>,
) {
    while let Some(chunk) = frames.recv().await {
        if let Err(err) = input.write_all(&chunk).await {
            let _ = events
                .send(RelayEvent::Recorder(RecorderEvent::WriteFailed {
                    session,
                    reason: err.to_string(),
                }))
                .await;
            return;
        }
    }

    if let Err(err) = input.shutdown().await {
        log::debug!("[recorder] closing encoder input of session {}: {}", session, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::ScriptedEncoder;
    use std::path::Path;
    use tokio::io::AsyncReadExt;
    use tokio::time::Instant;

    fn settings(dir: &Path) -> RecorderSettings {
        RecorderSettings {
            dir: dir.to_path_buf(),
            segment_length: Duration::from_secs(60),
            max_recordings: 10,
            restart_delay: Duration::from_millis(1000),
        }
    }

    fn frame(bytes: &'static [u8]) -> Frame {
        Frame::new(Bytes::from_static(bytes), Instant::now())
    }

    async fn next_recorder_event(rx: &mut mpsc::Receiver<RelayEvent>) -> RecorderEvent {
        match rx.recv().await {
            Some(RelayEvent::Recorder(event)) => event,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn probe_failure_disables_with_fault() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::missing("ffmpeg: not found"));
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        recorder.enable();
        assert!(recorder.is_enabled());

        let event = next_recorder_event(&mut rx).await;
        let fault = recorder.handle(event).expect("fault");

        assert!(fault.message.contains("ffmpeg: not found"));
        assert!(!recorder.is_enabled());
        assert!(!recorder.is_active());
        assert_eq!(encoder.started(), 0);
    }

    #[tokio::test]
    async fn enable_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::available());
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        recorder.enable();
        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        assert!(recorder.handle(event).is_none());
        recorder.enable();

        assert_eq!(encoder.probes(), 1);
        assert_eq!(encoder.started(), 1);
        assert!(recorder.is_active());
    }

    #[tokio::test]
    async fn feeds_frames_to_encoder_input() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::available());
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        recorder.handle(event);

        recorder.feed(&frame(b"abc"));
        recorder.feed(&frame(b"def"));

        let mut output = encoder.take_output(0).unwrap();
        let mut buf = [0u8; 6];
        output.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdef");

        let status = recorder.status();
        let session = status.session.unwrap();
        assert_eq!(session.frames, 2);
        assert_eq!(session.bytes, 6);
        assert!(session.file.starts_with("recording-"));
    }

    #[tokio::test]
    async fn disable_closes_encoder_input() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::available());
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        recorder.handle(event);
        recorder.feed(&frame(b"xy"));
        recorder.disable();

        assert!(!recorder.is_active());
        assert!(!recorder.is_enabled());

        // EOF after the buffered frame: the encoder can finalize.
        let mut output = encoder.take_output(0).unwrap();
        let mut rest = Vec::new();
        output.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"xy");
    }

    #[tokio::test]
    async fn start_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::available());
        encoder.fail_start(Some("spawn refused"));
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        let fault = recorder.handle(event).expect("fault");

        assert!(fault.message.contains("spawn refused"));
        assert!(!recorder.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_restarts_once() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::available());
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        recorder.handle(event);

        encoder.break_pipe(0);
        recorder.feed(&frame(b"lost"));

        let event = next_recorder_event(&mut rx).await;
        assert!(matches!(event, RecorderEvent::WriteFailed { session: 1, .. }));
        assert!(recorder.handle(event).is_none());
        assert!(!recorder.is_active());
        assert!(recorder.status().restart_pending);

        let event = next_recorder_event(&mut rx).await;
        assert!(matches!(event, RecorderEvent::RestartDue));
        assert!(recorder.handle(event).is_none());

        assert!(recorder.is_active());
        assert_eq!(encoder.started(), 2);
        assert_eq!(encoder.probes(), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_disables_recording() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::available());
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        recorder.handle(event);

        encoder.exit(0, Err("exit status: 1".to_string()));
        let event = next_recorder_event(&mut rx).await;
        let fault = recorder.handle(event).expect("fault");

        assert!(fault.message.contains("exit status: 1"));
        assert!(!recorder.is_enabled());
        assert!(!recorder.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_starts_a_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::available());
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        recorder.handle(event);

        let event = next_recorder_event(&mut rx).await;
        assert!(matches!(event, RecorderEvent::RotateDue { session: 1 }));
        assert!(recorder.handle(event).is_none());

        assert_eq!(encoder.started(), 2);
        let paths = encoder.paths();
        assert_ne!(paths[0], paths[1]);
        assert!(recorder.is_active());
    }

    #[tokio::test]
    async fn new_segment_replaces_running_one() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = Arc::new(ScriptedEncoder::available());
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(dir.path()), tx);

        assert!(recorder.start_new_segment("source changed").is_none());
        assert_eq!(encoder.started(), 0);

        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        recorder.handle(event);
        recorder.feed(&frame(b"old"));

        assert!(recorder.start_new_segment("source changed").is_none());
        assert!(recorder.is_active());
        assert_eq!(encoder.started(), 2);
        assert_eq!(recorder.status().session.unwrap().frames, 0);

        let mut first = encoder.take_output(0).unwrap();
        let mut rest = Vec::new();
        first.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"old");
    }

    #[tokio::test]
    async fn missing_directory_is_reported_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone");
        let encoder = Arc::new(ScriptedEncoder::available());
        let (tx, mut rx) = mpsc::channel(16);
        let mut recorder = Recorder::new(encoder.clone(), settings(&gone), tx);

        recorder.enable();
        let event = next_recorder_event(&mut rx).await;
        let fault = recorder.handle(event).expect("fault");

        assert!(fault.message.contains("could not start recording"));
        assert!(!gone.exists());
        assert!(!recorder.is_enabled());
    }

    #[test]
    fn repeated_names_get_a_counter() {
        let mut names = SegmentNames::default();
        let name = "recording-20240101-000000.mp4";

        assert_eq!(names.next(name.to_string()), name);
        assert_eq!(names.next(name.to_string()), "recording-20240101-000000-1.mp4");
        assert_eq!(names.next(name.to_string()), "recording-20240101-000000-2.mp4");
        assert_eq!(
            names.next("recording-20240101-000001.mp4".to_string()),
            "recording-20240101-000001.mp4"
        );
    }
}
