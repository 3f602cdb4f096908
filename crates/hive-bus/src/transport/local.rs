use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::Transport;
use crate::error::TransportError;

type Slot = Arc<Mutex<Option<mpsc::Sender<Bytes>>>>;

/// In-process transport: either no peers at all, or two linked halves.
pub struct LocalTransport {
    inbound: Slot,
    peer: Option<Slot>,
}

impl LocalTransport {
    /// A single node with nobody to talk to. Remote sends reach zero peers.
    pub fn standalone() -> Self {
        Self {
            inbound: Slot::default(),
            peer: None,
        }
    }

    /// Two transports whose sends arrive at each other.
    pub fn pair() -> (Self, Self) {
        let a = Slot::default();
        let b = Slot::default();
        (
            Self {
                inbound: a.clone(),
                peer: Some(b.clone()),
            },
            Self {
                inbound: b,
                peer: Some(a),
            },
        )
    }
}

fn current(slot: &Slot) -> Option<mpsc::Sender<Bytes>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

#[async_trait]
impl Transport for LocalTransport {
    async fn start(&self, inbound: mpsc::Sender<Bytes>) -> Result<(), TransportError> {
        let mut slot = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        *slot = Some(inbound);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> usize {
        let Some(peer) = self.peer.as_ref().and_then(current) else {
            return 0;
        };
        match peer.send(payload).await {
            Ok(()) => 1,
            Err(_) => {
                tracing::debug!("local peer stopped, dropping message");
                0
            }
        }
    }

    async fn shutdown(&self) {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
