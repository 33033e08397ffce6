use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{UpstreamEvent, UpstreamSource};

const EVENT_BUFFER: usize = 4;

/// WebSocket client for the source feed. Each binary message is one frame.
#[derive(Debug, Clone)]
pub struct WsUpstream {
    connect_timeout: Duration,
}

impl WsUpstream {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsUpstream {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl UpstreamSource for WsUpstream {
    fn open(&self, endpoint: &str) -> BoxStream<'static, UpstreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run_connection(endpoint.to_string(), self.connect_timeout, tx));
        ReceiverStream::new(rx).boxed()
    }
}

async fn run_connection(url: String, connect_timeout: Duration, tx: mpsc::Sender<UpstreamEvent>) {
    info!("[upstream] connecting to {}", url);

    let mut socket = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(err)) => {
            warn!("[upstream] connect to {} failed: {}", url, err);
            let _ = tx.send(UpstreamEvent::Error(err.to_string())).await;
            let _ = tx.send(UpstreamEvent::Close).await;
            return;
        }
        Err(_) => {
            warn!("[upstream] connect to {} timed out after {:?}", url, connect_timeout);
            let _ = tx.send(UpstreamEvent::Error("connect timed out".to_string())).await;
            let _ = tx.send(UpstreamEvent::Close).await;
            return;
        }
    };

    info!("[upstream] connected to {}", url);
    if tx.send(UpstreamEvent::Open).await.is_err() {
        return;
    }

    let mut skipped = 0u64;
    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!("[upstream] receiver dropped, closing {}", url);
                let _ = socket.close(None).await;
                return;
            }
            message = socket.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    // Frames are never queued behind a busy relay.
                    match tx.try_send(UpstreamEvent::Frame(Bytes::from(data))) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            skipped += 1;
                            if skipped % 100 == 1 {
                                debug!("[upstream] relay busy, skipped {} frames", skipped);
                            }
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    debug!("[upstream] ignoring text message ({} bytes)", text.len());
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = socket.send(Message::Pong(payload)).await {
                        let _ = tx.send(UpstreamEvent::Error(err.to_string())).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("[upstream] source closed connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("[upstream] receive error: {}", err);
                    let _ = tx.send(UpstreamEvent::Error(err.to_string())).await;
                    break;
                }
                None => break,
            }
        }
    }

    let _ = tx.send(UpstreamEvent::Close).await;
}
