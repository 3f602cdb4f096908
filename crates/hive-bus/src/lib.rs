//! Typed publish/subscribe bus shared by every node of a hive cluster.
//!
//! A [`MessageBus`] delivers each notified event to its local subscribers and
//! hands an encoded [`MessageContainer`] to a [`Transport`] for the other
//! nodes. Events arriving from peers are decoded and dispatched locally only.

pub mod bus;
pub mod codec;
pub mod error;
pub mod message;
pub mod transport;

pub use bus::MessageBus;
pub use error::{CodecError, TransportError};
pub use message::{
    BusEvent, BusMessage, DeviceCommandAdded, DeviceCommandUpdated, DeviceNotificationAdded,
    MessageContainer, MessageKind,
};
pub use transport::Transport;
pub use transport::local::LocalTransport;
#[cfg(unix)]
pub use transport::pipe::{PipeConfig, PipeTransport};
pub use transport::tcp::{PeerEndpoint, TcpMeshConfig, TcpMeshTransport};
