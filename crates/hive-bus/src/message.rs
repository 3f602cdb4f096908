//! Bus message kinds and the container that carries them between nodes.
//!
//! Every message identifies the device and the entity it concerns so a
//! receiving node can reload full state from its own persistence.

use std::fmt;

/// A notification was persisted for a device.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct DeviceNotificationAdded {
    #[prost(int64, tag = "1")]
    pub device_id: i64,
    #[prost(string, tag = "2")]
    pub device_guid: String,
    #[prost(int64, tag = "3")]
    pub notification_id: i64,
}

/// A command was persisted for a device.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct DeviceCommandAdded {
    #[prost(int64, tag = "1")]
    pub device_id: i64,
    #[prost(string, tag = "2")]
    pub device_guid: String,
    #[prost(int64, tag = "3")]
    pub command_id: i64,
}

/// A device reported status or result for an existing command.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct DeviceCommandUpdated {
    #[prost(int64, tag = "1")]
    pub device_id: i64,
    #[prost(string, tag = "2")]
    pub device_guid: String,
    #[prost(int64, tag = "3")]
    pub command_id: i64,
}

/// Closed set of message kinds. The oneof field number is the wire discriminant.
#[derive(Clone, PartialEq, Eq, Hash, prost::Oneof)]
pub enum BusMessage {
    #[prost(message, tag = "10")]
    DeviceNotificationAdded(DeviceNotificationAdded),
    #[prost(message, tag = "11")]
    DeviceCommandAdded(DeviceCommandAdded),
    #[prost(message, tag = "12")]
    DeviceCommandUpdated(DeviceCommandUpdated),
}

/// Envelope written to the wire: the type tag plus the tagged payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MessageContainer {
    #[prost(string, tag = "1")]
    pub type_name: String,
    #[prost(oneof = "BusMessage", tags = "10, 11, 12")]
    pub message: Option<BusMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    DeviceNotificationAdded,
    DeviceCommandAdded,
    DeviceCommandUpdated,
}

impl MessageKind {
    pub const fn type_name(self) -> &'static str {
        match self {
            MessageKind::DeviceNotificationAdded => "DeviceNotificationAdded",
            MessageKind::DeviceCommandAdded => "DeviceCommandAdded",
            MessageKind::DeviceCommandUpdated => "DeviceCommandUpdated",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl BusMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            BusMessage::DeviceNotificationAdded(_) => MessageKind::DeviceNotificationAdded,
            BusMessage::DeviceCommandAdded(_) => MessageKind::DeviceCommandAdded,
            BusMessage::DeviceCommandUpdated(_) => MessageKind::DeviceCommandUpdated,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind().type_name()
    }

    pub fn device_guid(&self) -> &str {
        match self {
            BusMessage::DeviceNotificationAdded(m) => &m.device_guid,
            BusMessage::DeviceCommandAdded(m) => &m.device_guid,
            BusMessage::DeviceCommandUpdated(m) => &m.device_guid,
        }
    }
}

/// A payload that can be published on the bus and subscribed to by type.
pub trait BusEvent: Sized + Send + 'static {
    const KIND: MessageKind;

    fn into_message(self) -> BusMessage;

    fn from_message(message: BusMessage) -> Option<Self>;
}

macro_rules! bus_event {
    ($ty:ident) => {
        impl BusEvent for $ty {
            const KIND: MessageKind = MessageKind::$ty;

            fn into_message(self) -> BusMessage {
                BusMessage::$ty(self)
            }

            fn from_message(message: BusMessage) -> Option<Self> {
                match message {
                    BusMessage::$ty(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for BusMessage {
            fn from(value: $ty) -> Self {
                BusMessage::$ty(value)
            }
        }
    };
}

bus_event!(DeviceNotificationAdded);
bus_event!(DeviceCommandAdded);
bus_event!(DeviceCommandUpdated);
