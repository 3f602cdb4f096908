use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub mod local;
#[cfg(unix)]
pub mod pipe;
pub mod tcp;

/// Moves encoded containers between nodes.
///
/// Sending is best effort: a peer that can't be reached is skipped and the
/// failure is logged, never returned to the producer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin accepting payloads from peers and forwarding them to `inbound`.
    async fn start(&self, inbound: mpsc::Sender<Bytes>) -> Result<(), TransportError>;

    /// Deliver `payload` to every reachable peer. Returns how many were reached.
    async fn send(&self, payload: Bytes) -> usize;

    /// Cancel every background task and wait for them to finish.
    async fn shutdown(&self);
}
