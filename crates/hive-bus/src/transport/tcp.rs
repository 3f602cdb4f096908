//! TCP mesh: one listening socket for inbound peers plus one reconnecting
//! outbound link per configured endpoint.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, future::join_all};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::Transport;
use crate::codec::frame_codec;
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerEndpoint {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for PeerEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone)]
pub struct TcpMeshConfig {
    pub bind_host: String,
    /// Port 0 binds an ephemeral port; see [`TcpMeshTransport::local_addr`].
    pub server_port: u16,
    pub peers: Vec<PeerEndpoint>,
    /// Delay between redials of an unreachable peer. Also caps a single write.
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
}

impl TcpMeshConfig {
    pub fn new(server_port: u16, peers: Vec<PeerEndpoint>) -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            server_port,
            peers,
            retry_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

pub struct TcpMeshTransport {
    config: TcpMeshConfig,
    links: Vec<Arc<PeerLink>>,
    cancel: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl TcpMeshTransport {
    pub fn new(config: TcpMeshConfig) -> Self {
        let links = config
            .peers
            .iter()
            .cloned()
            .map(|endpoint| Arc::new(PeerLink::new(endpoint, config.retry_interval)))
            .collect();
        Self {
            config,
            links,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(None),
            local_addr: StdMutex::new(None),
        }
    }

    /// Address of the listening socket once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of outbound links that currently hold a live connection.
    pub async fn connected_peers(&self) -> usize {
        let mut count = 0;
        for link in &self.links {
            if link.is_connected().await {
                count += 1;
            }
        }
        count
    }
}

#[async_trait]
impl Transport for TcpMeshTransport {
    async fn start(&self, inbound: mpsc::Sender<Bytes>) -> Result<(), TransportError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let endpoint = format!("{}:{}", self.config.bind_host, self.config.server_port);
        let listener = TcpListener::bind(&endpoint)
            .await
            .map_err(|source| TransportError::Bind {
                endpoint: endpoint.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        tracing::info!(%addr, peers = self.links.len(), "tcp mesh listening");

        let mut set = JoinSet::new();
        set.spawn(accept_loop(listener, inbound, self.cancel.clone()));
        for link in &self.links {
            set.spawn(link.clone().run(
                self.cancel.clone(),
                self.config.retry_interval,
                self.config.connect_timeout,
            ));
        }
        *tasks = Some(set);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> usize {
        join_all(self.links.iter().map(|link| link.try_send(payload.clone())))
            .await
            .into_iter()
            .filter(|sent| *sent)
            .count()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(mut set) = self.tasks.lock().await.take() {
            while set.join_next().await.is_some() {}
        }
        tracing::debug!("tcp mesh stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(peer = %addr, "inbound peer connected");
                    readers.spawn(read_loop(stream, addr, inbound.clone(), cancel.clone()));
                }
                Err(e) => {
                    tracing::warn!("tcp accept failed: {e}");
                }
            },
        }
    }
    while readers.join_next().await.is_some() {}
}

async fn read_loop(
    stream: TcpStream,
    addr: SocketAddr,
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, frame_codec());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                if inbound.send(frame.freeze()).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(peer = %addr, "closing inbound link: {e}");
                break;
            }
            None => {
                tracing::debug!(peer = %addr, "inbound peer closed");
                break;
            }
        }
    }
}

struct Session {
    sink: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    /// Cancelled when a write fails so the link redials.
    broken: CancellationToken,
}

/// Outbound connection to one peer. Writes are serialized by `session`.
struct PeerLink {
    endpoint: PeerEndpoint,
    write_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl PeerLink {
    fn new(endpoint: PeerEndpoint, write_timeout: Duration) -> Self {
        Self {
            endpoint,
            write_timeout,
            session: Mutex::new(None),
        }
    }

    async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Write one frame. Returns false when the peer is not connected or the
    /// write fails; a failed write drops the connection.
    async fn try_send(&self, payload: Bytes) -> bool {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return false;
        };
        let result = tokio::time::timeout(self.write_timeout, session.sink.send(payload)).await;
        let err = match result {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "write timed out".to_string(),
        };
        tracing::warn!(peer = %self.endpoint, "peer write failed: {err}");
        if let Some(session) = guard.take() {
            session.broken.cancel();
        }
        false
    }

    async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        retry_interval: Duration,
        connect_timeout: Duration,
    ) {
        loop {
            let target = (self.endpoint.host.as_str(), self.endpoint.port);
            let dialed = tokio::select! {
                _ = cancel.cancelled() => break,
                dialed = tokio::time::timeout(connect_timeout, TcpStream::connect(target)) => dialed,
            };
            match dialed {
                Ok(Ok(stream)) => {
                    self.hold(stream, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    tracing::info!(peer = %self.endpoint, "peer link lost, reconnecting");
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %self.endpoint, "peer unreachable: {e}");
                }
                Err(_) => {
                    tracing::debug!(peer = %self.endpoint, "peer connect timed out");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(retry_interval) => {}
            }
        }
        self.session.lock().await.take();
    }

    /// Publish a connected stream for senders and wait until it closes.
    async fn hold(&self, stream: TcpStream, cancel: &CancellationToken) {
        let _ = stream.set_nodelay(true);
        let (mut read_half, write_half) = stream.into_split();
        let broken = cancel.child_token();
        *self.session.lock().await = Some(Session {
            sink: FramedWrite::new(write_half, frame_codec()),
            broken: broken.clone(),
        });
        tracing::info!(peer = %self.endpoint, "peer link connected");

        // Peers never write on this direction; reading only detects close.
        let mut scratch = [0u8; 256];
        loop {
            tokio::select! {
                _ = broken.cancelled() => break,
                read = read_half.read(&mut scratch) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                },
            }
        }
        self.session.lock().await.take();
    }
}
