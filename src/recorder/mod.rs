// src/recorder/mod.rs

use std::path::Path;

use futures::future::BoxFuture;
use tokio::io::AsyncWrite;

/// A running encoder process fed through `input`.
///
/// Dropping `input` closes the encoder's stdin, which lets it flush and
/// finalize the container. `exit` resolves once the process is gone; a
/// non-zero exit is an error.
pub struct EncoderPipeline {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub exit: BoxFuture<'static, anyhow::Result<()>>,
}

/// The external encoder toolchain.
pub trait Encoder: Send + Sync {
    /// Checks that the toolchain is usable; returns its version line.
    fn probe(&self) -> BoxFuture<'static, anyhow::Result<String>>;

    /// Launches a pipeline writing a new file at `output`.
    fn start(&self, output: &Path) -> anyhow::Result<EncoderPipeline>;
}

pub mod ffmpeg;
pub mod recorder;
pub mod retention_fs;

pub use ffmpeg::FfmpegEncoder;
pub use recorder::{
    Recorder, RecorderEvent, RecorderFault, RecorderSettings, RecordingStatus, SessionSummary,
};
pub use retention_fs::{RecordingFile, list_recordings, select_evictions, sweep_recordings};
