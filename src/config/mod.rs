use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::core::ConfigError;

pub const MAX_RECORDINGS_LIMIT: usize = 1000;
/// Longest recording segment: one day.
pub const MAX_INTERVAL_MINUTES: u64 = 24 * 60;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host_ip: String,
    pub port: u16,
    pub static_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub url: String,
    /// Fixed reconnect delay; also the grace window for close/error events.
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub max_fps: u32,
    /// Outbound messages buffered per consumer before frames are dropped.
    pub consumer_queue: usize,
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub dir: String,
    pub interval_minutes: u64,
    pub max_recordings: usize,
    pub ffmpeg: String,
    pub preset: String,
    pub restart_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub relay: RelayConfig,
    pub recording: RecordingConfig,
}

/// Partial update accepted by the control API. Field names follow the
/// viewer UI's JSON.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_web_socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_recording_enabled: Option<bool>,
    /// Minutes per recording segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_recordings: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_ip: "0.0.0.0".to_string(),
            port: 10000,
            static_dir: "public".to_string(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8888/ws".to_string(),
            reconnect_interval_ms: 5000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_fps: 30,
            consumer_queue: 8,
            stats_interval_secs: 5,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: "recordings".to_string(),
            interval_minutes: 5,
            max_recordings: 10,
            ffmpeg: "ffmpeg".to_string(),
            preset: "veryfast".to_string(),
            restart_delay_ms: 1000,
        }
    }
}

impl SourceConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl RelayConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl RecordingConfig {
    pub fn segment_length(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn dir_path(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate().context("config validation failed")?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise starts from defaults.
    /// Returns whether a file was read.
    pub fn load_or_default(path: &Path) -> anyhow::Result<(Self, bool)> {
        if path.exists() {
            Ok((Self::load(path)?, true))
        } else {
            Ok((Self::default(), false))
        }
    }

    /// Writes to a sibling temp file and renames it over `path`, so readers
    /// never see a half-written config.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        let tmp = temp_path(path);
        fs::write(&tmp, content).with_context(|| format!("writing config {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing config {}", path.display()))?;
        Ok(())
    }

    /// Applies the process environment on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SOURCE_WEBSOCKET") {
            self.source.url = url;
        }
        if let Some(host) = lookup("HOST_IP") {
            self.server.host_ip = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(interval) = lookup("RECONNECT_INTERVAL") {
            self.source.reconnect_interval_ms = parse_env("RECONNECT_INTERVAL", &interval)?;
        }
        if let Some(dir) = lookup("RECORDINGS_DIR") {
            self.recording.dir = dir;
        }
        if let Some(fps) = lookup("MAX_FPS") {
            self.relay.max_fps = parse_env("MAX_FPS", &fps)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_source_url(&self.source.url)?;

        if self.server.host_ip.trim().is_empty() {
            return Err(ConfigError::invalid("server.host_ip must not be empty"));
        }
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server.port must be > 0"));
        }
        if self.source.reconnect_interval_ms == 0 {
            return Err(ConfigError::invalid("source.reconnect_interval_ms must be > 0"));
        }
        if self.source.connect_timeout_ms == 0 {
            return Err(ConfigError::invalid("source.connect_timeout_ms must be > 0"));
        }
        if self.relay.max_fps == 0 {
            return Err(ConfigError::invalid("relay.max_fps must be > 0"));
        }
        if self.relay.consumer_queue == 0 {
            return Err(ConfigError::invalid("relay.consumer_queue must be > 0"));
        }
        if self.relay.stats_interval_secs == 0 {
            return Err(ConfigError::invalid("relay.stats_interval_secs must be > 0"));
        }
        if self.recording.dir.trim().is_empty() {
            return Err(ConfigError::invalid("recording.dir must not be empty"));
        }
        if !(1..=MAX_INTERVAL_MINUTES).contains(&self.recording.interval_minutes) {
            return Err(ConfigError::invalid(format!(
                "recording interval must be between 1 and {} minutes",
                MAX_INTERVAL_MINUTES
            )));
        }
        if self.recording.max_recordings == 0 || self.recording.max_recordings > MAX_RECORDINGS_LIMIT {
            return Err(ConfigError::invalid(format!(
                "max recordings must be between 1 and {}",
                MAX_RECORDINGS_LIMIT
            )));
        }
        if self.recording.ffmpeg.trim().is_empty() {
            return Err(ConfigError::invalid("recording.ffmpeg must not be empty"));
        }
        Ok(())
    }

    /// Validates the patched result before committing it; on error `self`
    /// is left untouched.
    pub fn apply_patch(&mut self, patch: &ConfigPatch) -> Result<(), ConfigError> {
        let mut next = self.clone();
        patch.apply_to(&mut next);
        next.validate()?;
        *self = next;
        Ok(())
    }
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.source_web_socket.is_none()
            && self.is_recording_enabled.is_none()
            && self.recording_interval.is_none()
            && self.max_recordings.is_none()
    }

    fn apply_to(&self, config: &mut Config) {
        if let Some(ref url) = self.source_web_socket {
            config.source.url = url.trim().to_string();
        }
        if let Some(enabled) = self.is_recording_enabled {
            config.recording.enabled = enabled;
        }
        if let Some(minutes) = self.recording_interval {
            config.recording.interval_minutes = minutes;
        }
        if let Some(max) = self.max_recordings {
            config.recording.max_recordings = max;
        }
    }
}

fn validate_source_url(url: &str) -> Result<(), ConfigError> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| ConfigError::invalid(format!("source url '{}' must start with ws:// or wss://", url)))?;

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(ConfigError::invalid(format!("source url '{}' has no valid host", url)));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::with_context(format!("environment variable {}", key), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.source.reconnect_interval(), Duration::from_millis(5000));
        assert_eq!(config.relay.max_fps, 30);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [source]
            url = "ws://camera.local:8888/ws"

            [recording]
            enabled = true
            max_recordings = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.source.url, "ws://camera.local:8888/ws");
        assert_eq!(config.source.reconnect_interval_ms, 5000);
        assert!(config.recording.enabled);
        assert_eq!(config.recording.max_recordings, 3);
        assert_eq!(config.recording.interval_minutes, 5);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("SOURCE_WEBSOCKET", "wss://feed.example/ws"),
            ("PORT", "9000"),
            ("RECONNECT_INTERVAL", "250"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.source.url, "wss://feed.example/ws");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.source.reconnect_interval_ms, 250);
    }

    #[test]
    fn bad_env_number_is_reported() {
        let mut config = Config::default();
        let err = config
            .apply_env_from(|key| (key == "PORT").then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn patch_is_all_or_nothing() {
        let mut config = Config::default();
        let patch = ConfigPatch {
            source_web_socket: Some("ws://new-host/ws".to_string()),
            max_recordings: Some(0),
            ..ConfigPatch::default()
        };

        assert!(config.apply_patch(&patch).is_err());
        assert_eq!(config.source.url, SourceConfig::default().url);
        assert_eq!(config.recording.max_recordings, 10);
    }

    #[test]
    fn patch_uses_ui_field_names() {
        let patch: ConfigPatch = serde_json::from_str(
            r#"{"sourceWebSocket":"ws://10.0.0.2:8888/ws","isRecordingEnabled":true,"recordingInterval":15,"maxRecordings":4}"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_patch(&patch).unwrap();

        assert_eq!(config.source.url, "ws://10.0.0.2:8888/ws");
        assert!(config.recording.enabled);
        assert_eq!(config.recording.segment_length(), Duration::from_secs(15 * 60));
        assert_eq!(config.recording.max_recordings, 4);
    }

    #[test]
    fn rejects_non_websocket_sources() {
        assert!(validate_source_url("http://camera/ws").is_err());
        assert!(validate_source_url("ws://").is_err());
        assert!(validate_source_url("ws://camera:8888/ws").is_ok());
        assert!(validate_source_url("wss://camera/ws").is_ok());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");

        let mut config = Config::default();
        config.recording.max_recordings = 7;
        config.save(&path).unwrap();

        let (loaded, from_file) = Config::load_or_default(&path).unwrap();
        assert!(from_file);
        assert_eq!(loaded.recording.max_recordings, 7);
    }

    #[test]
    fn save_replaces_existing_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        fs::write(&path, "# hand written\n").unwrap();

        let mut config = Config::default();
        config.recording.interval_minutes = 30;
        config.save(&path).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["relay.toml".to_string()]);
        assert_eq!(Config::load(&path).unwrap().recording.interval_minutes, 30);
    }

    #[test]
    fn oversized_interval_is_rejected() {
        let mut config = Config::default();
        for minutes in [MAX_INTERVAL_MINUTES + 1, u64::MAX / 30, u64::MAX] {
            let patch = ConfigPatch {
                recording_interval: Some(minutes),
                ..ConfigPatch::default()
            };
            let err = config.apply_patch(&patch).unwrap_err();
            assert!(err.to_string().contains("recording interval"), "{}", err);
        }
        assert_eq!(config.recording.interval_minutes, 5);

        let patch = ConfigPatch {
            recording_interval: Some(MAX_INTERVAL_MINUTES),
            ..ConfigPatch::default()
        };
        config.apply_patch(&patch).unwrap();
        assert_eq!(config.recording.segment_length(), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn segment_length_saturates() {
        let recording = RecordingConfig {
            interval_minutes: u64::MAX,
            ..RecordingConfig::default()
        };
        assert_eq!(recording.segment_length(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(ConfigPatch::default().is_empty());
        let patch: ConfigPatch = serde_json::from_str(r#"{"maxRecordings":3}"#).unwrap();
        assert!(!patch.is_empty());
    }
}
