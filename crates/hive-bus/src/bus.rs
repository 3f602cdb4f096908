use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::error::TransportError;
use crate::message::{BusEvent, BusMessage, MessageKind};
use crate::transport::Transport;

type Subscriber = Arc<dyn Fn(BusMessage) -> anyhow::Result<()> + Send + Sync>;

const INBOUND_BUFFER: usize = 1024;

/// Typed publish/subscribe registry bound to one transport.
///
/// `notify` runs local subscribers on the blocking worker pool and sends the
/// encoded message to peers. Messages received from peers are dispatched to
/// local subscribers only, never forwarded again.
pub struct MessageBus {
    subscribers: RwLock<HashMap<MessageKind, Vec<Subscriber>>>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    /// Start `transport` and the task that drains its inbound payloads.
    pub async fn start(transport: Arc<dyn Transport>) -> Result<Arc<Self>, TransportError> {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        transport.start(tx).await?;

        let bus = Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            transport,
            cancel: CancellationToken::new(),
            receiver: Mutex::new(None),
        });
        let handle = tokio::spawn(receive_loop(
            Arc::downgrade(&bus),
            rx,
            bus.cancel.clone(),
        ));
        *bus.receiver.lock().await = Some(handle);
        Ok(bus)
    }

    /// Register `handler` for every message of type `T`, local or remote.
    pub fn subscribe<T, F>(&self, handler: F)
    where
        T: BusEvent,
        F: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Arc::new(move |message| match T::from_message(message) {
            Some(event) => handler(event),
            None => Ok(()),
        });
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(T::KIND)
            .or_default()
            .push(subscriber);
    }

    /// Publish `event` to local subscribers and every reachable peer.
    /// Returns the number of peers the message was handed to.
    pub async fn notify<T: BusEvent>(&self, event: T) -> usize {
        let message = event.into_message();
        self.dispatch_local(&message);
        let sent = self.transport.send(codec::encode(&message)).await;
        tracing::trace!(kind = %message.kind(), peers = sent, "bus notify");
        sent
    }

    /// Stop receiving and shut the transport down.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.receiver.lock().await.take() {
            let _ = handle.await;
        }
        self.transport.shutdown().await;
    }

    fn dispatch_local(&self, message: &BusMessage) {
        let kind = message.kind();
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for subscriber in subscribers {
            let message = message.clone();
            tokio::task::spawn_blocking(move || {
                match catch_unwind(AssertUnwindSafe(|| subscriber(message))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(%kind, "bus subscriber failed: {e:#}"),
                    Err(_) => tracing::error!(%kind, "bus subscriber panicked"),
                }
            });
        }
    }

    fn handle_remote(&self, payload: &[u8]) {
        match codec::decode(payload) {
            Ok(message) => self.dispatch_local(&message),
            Err(e) => tracing::warn!(len = payload.len(), "dropping bus message: {e}"),
        }
    }
}

async fn receive_loop(
    bus: Weak<MessageBus>,
    mut inbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            payload = inbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let Some(bus) = bus.upgrade() else {
            break;
        };
        bus.handle_remote(&payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeviceCommandAdded, DeviceNotificationAdded};
    use crate::transport::local::LocalTransport;
    use std::time::Duration;

    fn command(id: i64) -> DeviceCommandAdded {
        DeviceCommandAdded {
            device_id: 1,
            device_guid: "D1".into(),
            command_id: id,
        }
    }

    #[tokio::test]
    async fn local_subscriber_receives_notified_event() {
        let bus = MessageBus::start(Arc::new(LocalTransport::standalone()))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |event: DeviceCommandAdded| {
            tx.send(event.command_id)?;
            Ok(())
        });

        assert_eq!(bus.notify(command(42)).await, 0);
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(42));
        bus.stop().await;
    }

    #[tokio::test]
    async fn subscribers_only_see_their_type() {
        let bus = MessageBus::start(Arc::new(LocalTransport::standalone()))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |event: DeviceNotificationAdded| {
            tx.send(event.notification_id)?;
            Ok(())
        });

        bus.notify(command(1)).await;
        bus.notify(DeviceNotificationAdded {
            device_id: 1,
            device_guid: "D1".into(),
            notification_id: 5,
        })
        .await;
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(5));
        bus.stop().await;
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let bus = MessageBus::start(Arc::new(LocalTransport::standalone()))
            .await
            .unwrap();
        bus.subscribe(|_: DeviceCommandAdded| anyhow::bail!("boom"));
        bus.subscribe(|_: DeviceCommandAdded| -> anyhow::Result<()> { panic!("worse") });
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |event: DeviceCommandAdded| {
            tx.send(event.command_id)?;
            Ok(())
        });

        bus.notify(command(7)).await;
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(7));

        bus.notify(command(8)).await;
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(8));
        bus.stop().await;
    }

    #[tokio::test]
    async fn remote_delivery_is_not_echoed_back() {
        let (a, b) = LocalTransport::pair();
        let bus_a = MessageBus::start(Arc::new(a)).await.unwrap();
        let bus_b = MessageBus::start(Arc::new(b)).await.unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        bus_a.subscribe(move |event: DeviceCommandAdded| {
            tx_a.send(event.command_id)?;
            Ok(())
        });
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        bus_b.subscribe(move |event: DeviceCommandAdded| {
            tx_b.send(event.command_id)?;
            Ok(())
        });

        assert_eq!(bus_a.notify(command(42)).await, 1);
        let on_b = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap();
        assert_eq!(on_b, Some(42));
        let on_a = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
            .await
            .unwrap();
        assert_eq!(on_a, Some(42));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        bus_a.stop().await;
        bus_b.stop().await;
    }

    #[tokio::test]
    async fn corrupt_remote_payload_is_dropped() {
        let (a, b) = LocalTransport::pair();
        let bus_b = MessageBus::start(Arc::new(b)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus_b.subscribe(move |event: DeviceCommandAdded| {
            tx.send(event.command_id)?;
            Ok(())
        });

        assert_eq!(a.send(Bytes::from_static(&[0xff, 0x01, 0x02])).await, 1);
        assert_eq!(a.send(codec::encode(&command(3).into())).await, 1);
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(3));
        bus_b.stop().await;
    }
}
