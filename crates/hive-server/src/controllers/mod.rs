//! Controllers mounted on the WebSocket paths.

pub mod client;
pub mod device;

use hive_protocol::{API_VERSION, now_ms};
use serde_json::{Map, Value, json};

pub use client::ClientController;
pub use device::DeviceController;

/// What `server/info` reports.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub api_version: String,
    pub rest_server_url: Option<String>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            rest_server_url: None,
        }
    }
}

impl ServerInfo {
    pub(crate) fn response(&self) -> Map<String, Value> {
        hive_protocol::fields([(
            "info",
            json!({
                "apiVersion": self.api_version,
                "serverTimestamp": now_ms(),
                "restServerUrl": self.rest_server_url,
            }),
        )])
    }
}
