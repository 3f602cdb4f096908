//! Domain entities shared by the server and its persistence layer.

use std::net::{IpAddr, Ipv4Addr};

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Administrator,
    #[default]
    Client,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Active,
    LockedOut,
    Disabled,
    Deleted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: i64,
    pub login: String,
    #[serde(default, skip_serializing)]
    pub password_hash: String,
    #[serde(default, skip_serializing)]
    pub password_salt: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub login_attempts: u32,
    #[serde(default)]
    pub last_login_ms: Option<u64>,
    /// Networks the user was granted access to.
    #[serde(default)]
    pub network_ids: Vec<i64>,
}

impl User {
    pub fn new(login: impl Into<String>, role: UserRole) -> Self {
        Self {
            login: login.into(),
            role,
            ..Default::default()
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Administrator
    }

    /// Replace the stored hash with one derived from `password` and a fresh salt.
    pub fn set_password(&mut self, password: &str) {
        let mut salt = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut salt);
        self.password_salt = STANDARD.encode(salt);
        self.password_hash = hash_password(&self.password_salt, password);
    }

    pub fn has_password(&self) -> bool {
        !self.password_hash.is_empty()
    }

    pub fn is_valid_password(&self, password: &str) -> bool {
        self.has_password() && hash_password(&self.password_salt, password) == self.password_hash
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// One grant inside an access key. `None` on any list means "no restriction".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeyPermission {
    #[serde(default)]
    pub subnets: Option<Vec<String>>,
    #[serde(default)]
    pub actions: Option<Vec<String>>,
    #[serde(default)]
    pub networks: Option<Vec<i64>>,
    #[serde(default)]
    pub devices: Option<Vec<String>>,
}

impl AccessKeyPermission {
    pub fn is_action_allowed(&self, action: &str) -> bool {
        match &self.actions {
            None => true,
            Some(actions) => actions.iter().any(|a| a.eq_ignore_ascii_case(action)),
        }
    }

    pub fn is_network_allowed(&self, network_id: i64) -> bool {
        match &self.networks {
            None => true,
            Some(networks) => networks.contains(&network_id),
        }
    }

    pub fn is_device_allowed(&self, device_guid: &Uuid) -> bool {
        match &self.devices {
            None => true,
            Some(devices) => devices
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&device_guid.to_string())),
        }
    }

    pub fn is_address_allowed(&self, addr: IpAddr) -> bool {
        match &self.subnets {
            None => true,
            Some(subnets) => subnets.iter().any(|s| subnet_contains(s, addr)),
        }
    }
}

/// Parse `a.b.c.d[/bits]` and test membership. Unparsable entries match nothing.
fn subnet_contains(subnet: &str, addr: IpAddr) -> bool {
    let addr = match addr {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4,
            None => return false,
        },
    };
    let (base, bits) = match subnet.split_once('/') {
        Some((base, bits)) => match bits.trim().parse::<u32>() {
            Ok(bits) if bits <= 32 => (base, bits),
            _ => return false,
        },
        None => (subnet, 32),
    };
    let Ok(base) = base.trim().parse::<Ipv4Addr>() else {
        return false;
    };
    let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    u32::from(base) & mask == u32::from(addr) & mask
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccessKey {
    #[serde(default)]
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub expiration_ms: Option<u64>,
    #[serde(default)]
    pub permissions: Vec<AccessKeyPermission>,
}

impl AccessKey {
    /// Generate a random base64 key.
    pub fn generate_key() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        STANDARD.encode(bytes)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_ms.is_some_and(|exp| exp <= now_ms)
    }

    /// Permissions that allow `action` from `addr`.
    pub fn permissions_for<'a>(
        &'a self,
        action: &'a str,
        addr: Option<IpAddr>,
    ) -> impl Iterator<Item = &'a AccessKeyPermission> + 'a {
        self.permissions.iter().filter(move |p| {
            p.is_action_allowed(action) && addr.is_none_or(|a| p.is_address_allowed(a))
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClass {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub is_permanent: bool,
    #[serde(default)]
    pub offline_timeout: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(default)]
    pub id: i64,
    pub guid: Uuid,
    #[serde(default, skip_serializing)]
    pub key: Option<String>,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub network_id: Option<i64>,
    pub device_class_id: i64,
    #[serde(default)]
    pub last_online_ms: Option<u64>,
}

impl Device {
    /// Devices without a key can't authenticate over the device channel.
    pub fn is_valid_key(&self, key: &str) -> bool {
        self.key.as_deref().is_some_and(|k| k == key)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNotification {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub timestamp_ms: u64,
    pub notification: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing)]
    pub device_id: i64,
}

impl DeviceNotification {
    pub fn new(notification: impl Into<String>, device_id: i64) -> Self {
        Self {
            notification: notification.into(),
            device_id,
            ..Default::default()
        }
    }

    /// String parameter `name`, if the parameters are an object holding one.
    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameters.as_ref()?.get(name)?.as_str()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub timestamp_ms: u64,
    pub command: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub lifetime: Option<u32>,
    #[serde(default)]
    pub flags: Option<i32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing)]
    pub device_id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
}

impl DeviceCommand {
    pub fn new(command: impl Into<String>, device_id: i64) -> Self {
        Self {
            command: command.into(),
            device_id,
            ..Default::default()
        }
    }
}

/// Last reported state of one piece of device equipment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEquipment {
    #[serde(default)]
    pub id: i64,
    pub code: String,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub parameters: Option<Value>,
    pub device_id: i64,
}

/// Parse a GUID the way clients send it (any case, with or without braces).
pub fn parse_guid(text: &str) -> Option<Uuid> {
    let trimmed = text.trim().trim_start_matches('{').trim_end_matches('}');
    Uuid::parse_str(trimmed).ok()
}
