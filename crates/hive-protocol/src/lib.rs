pub mod model;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use model::{
    AccessKey, AccessKeyPermission, Device, DeviceClass, DeviceCommand, DeviceEquipment,
    DeviceNotification, Network, User, UserRole, UserStatus, parse_guid,
};

/// API version reported by `server/info`.
pub const API_VERSION: &str = "1.3.0";

/// Upper bound for a single inbound text frame.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Notification names with built-in server semantics.
pub mod special_notifications {
    pub const DEVICE_ADD: &str = "$device-add";
    pub const DEVICE_UPDATE: &str = "$device-update";
    pub const EQUIPMENT: &str = "equipment";
    pub const DEVICE_STATUS: &str = "device-status";
}

/// Outcome of a solicited request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// Response envelope sent for every action request.
///
/// The envelope echoes the request's `action` and `requestId` so clients can
/// correlate responses on a connection that also carries push messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActionResponse {
    pub action: Option<String>,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ActionResponse {
    pub fn success(
        action: Option<String>,
        request_id: Option<Value>,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            action,
            request_id,
            status: Status::Success,
            error: None,
            fields,
        }
    }

    pub fn error(action: Option<String>, request_id: Option<Value>, message: String) -> Self {
        Self {
            action,
            request_id,
            status: Status::Error,
            error: Some(message),
            fields: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

/// Unsolicited server push (`notification/insert`, `command/insert`, `command/update`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub action: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PushMessage {
    pub fn new(action: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            action: action.into(),
            fields,
        }
    }
}

/// Build a JSON object from `(key, value)` pairs.
pub fn fields<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
