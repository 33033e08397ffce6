// src/recorder/ffmpeg.rs
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, anyhow, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::process::Command;

use crate::config::RecordingConfig;

use super::{Encoder, EncoderPipeline};

/// MJPEG on stdin, H.264 in a fragmented MP4 on disk.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: String,
    preset: String,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<String>, preset: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            preset: preset.into(),
        }
    }

    pub fn from_config(config: &RecordingConfig) -> Self {
        Self::new(config.ffmpeg.clone(), config.preset.clone())
    }

    fn args(&self, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel", "error",
            "-y",
            "-use_wallclock_as_timestamps", "1",
            "-f", "mjpeg",
            "-i", "pipe:0",
            "-c:v", "libx264",
            "-preset", self.preset.as_str(),
            "-pix_fmt", "yuv420p",
            "-movflags", "+frag_keyframe+empty_moov+default_base_moof",
            "-f", "mp4",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

impl Encoder for FfmpegEncoder {
    fn probe(&self) -> BoxFuture<'static, anyhow::Result<String>> {
        let program = self.program.clone();
        async move {
            let output = Command::new(&program)
                .arg("-version")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output()
                .await
                .map_err(|e| anyhow!("{} is not available: {}", program, e))?;

            if !output.status.success() {
                bail!("{} -version exited with {}", program, output.status);
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let version = stdout.lines().next().unwrap_or_default().trim().to_string();
            if version.is_empty() {
                bail!("{} -version printed nothing", program);
            }
            Ok(version)
        }
        .boxed()
    }

    fn start(&self, output: &Path) -> anyhow::Result<EncoderPipeline> {
        log::info!("[recorder] ffmpeg → {}", output.display());

        let mut child = Command::new(&self.program)
            .args(self.args(output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawning {}", self.program))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("{} stdin not captured", self.program))?;

        let exit = async move {
            let status = child.wait().await.context("waiting for encoder")?;
            if !status.success() {
                bail!("encoder exited with {}", status);
            }
            Ok(())
        }
        .boxed();

        Ok(EncoderPipeline {
            input: Box::new(stdin),
            exit,
        })
    }
}
