//! Point-to-point transport over local stream sockets.
//!
//! Every send opens a fresh connection to each peer endpoint, writes one
//! whole message and closes; end-of-stream delimits the message. The server
//! side serves one inbound connection at a time.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::codec::MAX_FRAME_LENGTH;
use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Endpoint this node listens on.
    pub server_path: PathBuf,
    /// Endpoints of the peers this node sends to.
    pub client_paths: Vec<PathBuf>,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
}

impl PipeConfig {
    pub fn new(server_path: impl Into<PathBuf>, client_paths: Vec<PathBuf>) -> Self {
        Self {
            server_path: server_path.into(),
            client_paths,
            connect_timeout: Duration::from_millis(100),
            connect_attempts: 5,
        }
    }
}

pub struct PipeTransport {
    config: PipeConfig,
    cancel: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl PipeTransport {
    pub fn new(config: PipeConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn start(&self, inbound: mpsc::Sender<Bytes>) -> Result<(), TransportError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let listener = bind(&self.config.server_path).await?;
        tracing::info!(path = %self.config.server_path.display(), "pipe transport listening");
        *server = Some(tokio::spawn(serve(listener, inbound, self.cancel.clone())));
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> usize {
        let mut delivered = 0;
        for path in &self.config.client_paths {
            if send_one(path, &payload, &self.config).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.server.lock().await.take() {
            let _ = handle.await;
            let _ = std::fs::remove_file(&self.config.server_path);
        }
    }
}

/// Bind `path`, clearing a stale socket file left by a dead process.
async fn bind(path: &Path) -> Result<UnixListener, TransportError> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(TransportError::Bind {
                endpoint: path.display().to_string(),
                source: std::io::Error::new(ErrorKind::AddrInUse, "endpoint has a live listener"),
            });
        }
        let _ = std::fs::remove_file(path);
    }
    UnixListener::bind(path).map_err(|source| TransportError::Bind {
        endpoint: path.display().to_string(),
        source,
    })
}

async fn serve(listener: UnixListener, inbound: mpsc::Sender<Bytes>, cancel: CancellationToken) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!("pipe accept failed: {e}");
                    continue;
                }
            },
        };

        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_message(stream) => read,
        };
        match payload {
            Ok(Some(payload)) if payload.is_empty() => {}
            Ok(Some(payload)) => {
                if inbound.send(payload).await.is_err() {
                    break;
                }
            }
            Ok(None) => tracing::warn!("dropping pipe message above {MAX_FRAME_LENGTH} bytes"),
            Err(e) => tracing::warn!("pipe read failed: {e}"),
        }
    }
    tracing::debug!("pipe server stopped");
}

/// Read until end-of-stream. `None` when the message is too large.
async fn read_message(stream: UnixStream) -> std::io::Result<Option<Bytes>> {
    let mut buf = Vec::new();
    stream
        .take(MAX_FRAME_LENGTH as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    if buf.len() > MAX_FRAME_LENGTH {
        return Ok(None);
    }
    Ok(Some(Bytes::from(buf)))
}

/// Deliver one message to `path`. A missing endpoint or a connect timeout
/// gives up at once; a refused connection is retried.
async fn send_one(path: &Path, payload: &[u8], config: &PipeConfig) -> bool {
    for attempt in 1..=config.connect_attempts.max(1) {
        let stream =
            match tokio::time::timeout(config.connect_timeout, UnixStream::connect(path)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "pipe peer absent");
                    return false;
                }
                Ok(Err(e)) => {
                    tracing::debug!(path = %path.display(), attempt, "pipe peer busy: {e}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                Err(_) => {
                    tracing::debug!(path = %path.display(), "pipe connect timed out");
                    return false;
                }
            };
        return match write_message(stream, payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), "pipe write failed: {e}");
                false
            }
        };
    }
    tracing::warn!(path = %path.display(), "pipe peer still busy, message dropped");
    false
}

async fn write_message(mut stream: UnixStream, payload: &[u8]) -> std::io::Result<()> {
    stream.write_all(payload).await?;
    stream.shutdown().await
}
