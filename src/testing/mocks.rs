use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::recorder::{Encoder, EncoderPipeline};
use crate::upstream::{UpstreamEvent, UpstreamSource};

const PIPE_CAPACITY: usize = 64 * 1024;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ScriptedConnection {
    endpoint: String,
    tx: mpsc::UnboundedSender<UpstreamEvent>,
}

/// Upstream whose connections are driven by the test: every `open` is
/// recorded, and events are injected per connection index.
#[derive(Default)]
pub struct ScriptedUpstream {
    connections: Mutex<Vec<ScriptedConnection>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections opened so far.
    pub fn opened(&self) -> usize {
        locked(&self.connections).len()
    }

    pub fn endpoint(&self, index: usize) -> Option<String> {
        locked(&self.connections)
            .get(index)
            .map(|c| c.endpoint.clone())
    }

    /// Returns `false` if the relay already dropped that connection.
    pub fn push(&self, index: usize, event: UpstreamEvent) -> bool {
        locked(&self.connections)
            .get(index)
            .is_some_and(|c| c.tx.send(event).is_ok())
    }

    /// Whether the relay still holds the connection's stream.
    pub fn is_open(&self, index: usize) -> bool {
        locked(&self.connections)
            .get(index)
            .is_some_and(|c| !c.tx.is_closed())
    }
}

impl UpstreamSource for ScriptedUpstream {
    fn open(&self, endpoint: &str) -> BoxStream<'static, UpstreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        locked(&self.connections).push(ScriptedConnection {
            endpoint: endpoint.to_string(),
            tx,
        });
        UnboundedReceiverStream::new(rx).boxed()
    }
}

struct ScriptedPipeline {
    path: PathBuf,
    output: Option<DuplexStream>,
    exit: Option<oneshot::Sender<Result<(), String>>>,
}

/// Encoder double. Each started pipeline creates its (empty) output file,
/// writes into an in-memory pipe the test can read, and exits only when the
/// test says so.
pub struct ScriptedEncoder {
    probe_error: Option<String>,
    start_error: Mutex<Option<String>>,
    probes: AtomicU64,
    pipelines: Mutex<Vec<ScriptedPipeline>>,
}

impl ScriptedEncoder {
    pub fn available() -> Self {
        Self {
            probe_error: None,
            start_error: Mutex::new(None),
            probes: AtomicU64::new(0),
            pipelines: Mutex::new(Vec::new()),
        }
    }

    /// An encoder whose probe fails with `reason`.
    pub fn missing(reason: &str) -> Self {
        Self {
            probe_error: Some(reason.to_string()),
            ..Self::available()
        }
    }

    /// Makes every following `start` fail with `reason`; `None` heals it.
    pub fn fail_start(&self, reason: Option<&str>) {
        *locked(&self.start_error) = reason.map(str::to_string);
    }

    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Number of pipelines started.
    pub fn started(&self) -> usize {
        locked(&self.pipelines).len()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        locked(&self.pipelines)
            .iter()
            .map(|p| p.path.clone())
            .collect()
    }

    /// The read end of pipeline `index`'s input, once.
    pub fn take_output(&self, index: usize) -> Option<DuplexStream> {
        locked(&self.pipelines)
            .get_mut(index)
            .and_then(|p| p.output.take())
    }

    /// Drops the read end so further writes fail.
    pub fn break_pipe(&self, index: usize) {
        if let Some(pipeline) = locked(&self.pipelines).get_mut(index) {
            pipeline.output = None;
        }
    }

    /// Ends pipeline `index` with `result`.
    pub fn exit(&self, index: usize, result: Result<(), String>) {
        if let Some(exit) = locked(&self.pipelines)
            .get_mut(index)
            .and_then(|p| p.exit.take())
        {
            let _ = exit.send(result);
        }
    }
}

impl Encoder for ScriptedEncoder {
    fn probe(&self) -> BoxFuture<'static, Result<String>> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        let result = match &self.probe_error {
            Some(reason) => Err(anyhow!("{}", reason)),
            None => Ok("scripted encoder 1.0".to_string()),
        };
        async move { result }.boxed()
    }

    fn start(&self, output: &Path) -> Result<EncoderPipeline> {
        if let Some(reason) = locked(&self.start_error).clone() {
            return Err(anyhow!("{}", reason));
        }
        std::fs::File::create(output)?;

        let (input, read_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        locked(&self.pipelines).push(ScriptedPipeline {
            path: output.to_path_buf(),
            output: Some(read_end),
            exit: Some(exit_tx),
        });

        let exit = async move {
            match exit_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(anyhow!("{}", reason)),
                // The double was dropped; treat it as a clean exit.
                Err(_) => Ok(()),
            }
        }
        .boxed();

        Ok(EncoderPipeline {
            input: Box::new(input),
            exit,
        })
    }
}
