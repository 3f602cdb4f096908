use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use hive_bus::{LocalTransport, PeerEndpoint, TcpMeshConfig, TcpMeshTransport, Transport};
use hive_protocol::{
    API_VERSION, AccessKey, AccessKeyPermission, Device, DeviceClass, Network, User, UserRole,
    UserStatus, parse_guid,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::controllers::ServerInfo;
use crate::messages::{DeviceStatusHandler, EquipmentHandler, HandlerFilter, MessageHandlerInfo};
use crate::store::DataContext;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub rest_server_url: Option<String>,
    pub api_version: String,
    pub bus: BusConfig,
    pub authentication: AuthenticationConfig,
    pub message_handlers: Vec<HandlerConfig>,
    pub seed: SeedConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8010)),
            rest_server_url: None,
            api_version: API_VERSION.to_string(),
            bus: BusConfig::default(),
            authentication: AuthenticationConfig::default(),
            message_handlers: Vec::new(),
            seed: SeedConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read `path`, or use defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            api_version: self.api_version.clone(),
            rest_server_url: self.rest_server_url.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Single node; events stay in process.
    #[default]
    Local,
    Tcp,
    Pipe,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    pub bind_host: String,
    pub server_port: u16,
    pub client_endpoints: Vec<PeerEndpoint>,
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub pipe_server: Option<PathBuf>,
    pub pipe_clients: Vec<PathBuf>,
    pub pipe_connect_timeout_ms: u64,
    pub pipe_connect_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Local,
            bind_host: "0.0.0.0".to_string(),
            server_port: 8011,
            client_endpoints: Vec::new(),
            retry_interval_ms: 5_000,
            connect_timeout_ms: 2_000,
            pipe_server: None,
            pipe_clients: Vec::new(),
            pipe_connect_timeout_ms: 100,
            pipe_connect_attempts: 5,
        }
    }
}

impl BusConfig {
    pub fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        match self.kind {
            BusKind::Local => Ok(Arc::new(LocalTransport::standalone())),
            BusKind::Tcp => {
                let mut config = TcpMeshConfig::new(self.server_port, self.client_endpoints.clone());
                config.bind_host = self.bind_host.clone();
                config.retry_interval = Duration::from_millis(self.retry_interval_ms);
                config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
                Ok(Arc::new(TcpMeshTransport::new(config)))
            }
            BusKind::Pipe => self.pipe_transport(),
        }
    }

    #[cfg(unix)]
    fn pipe_transport(&self) -> Result<Arc<dyn Transport>> {
        let Some(server) = &self.pipe_server else {
            bail!("bus.kind = \"pipe\" requires bus.pipe_server");
        };
        let mut config = hive_bus::PipeConfig::new(server, self.pipe_clients.clone());
        config.connect_timeout = Duration::from_millis(self.pipe_connect_timeout_ms);
        config.connect_attempts = self.pipe_connect_attempts;
        Ok(Arc::new(hive_bus::PipeTransport::new(config)))
    }

    #[cfg(not(unix))]
    fn pipe_transport(&self) -> Result<Arc<dyn Transport>> {
        bail!("pipe transport is only available on unix")
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthenticationConfig {
    /// Failed password attempts before a user is locked out; 0 disables.
    pub max_login_attempts: u32,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: 10,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerKind {
    DeviceStatus,
    Equipment,
}

/// One `[[message_handlers]]` entry. Empty lists mean no restriction.
#[derive(Deserialize, Debug, Clone)]
pub struct HandlerConfig {
    pub kind: HandlerKind,
    #[serde(default)]
    pub notification_names: Vec<String>,
    #[serde(default)]
    pub command_names: Vec<String>,
    #[serde(default)]
    pub device_guids: Vec<String>,
    #[serde(default)]
    pub device_class_ids: Vec<i64>,
    #[serde(default)]
    pub network_ids: Vec<i64>,
}

fn non_empty<T: Eq + std::hash::Hash>(items: impl IntoIterator<Item = T>) -> Option<HashSet<T>> {
    let set: HashSet<T> = items.into_iter().collect();
    if set.is_empty() { None } else { Some(set) }
}

impl HandlerConfig {
    pub fn filter(&self) -> Result<HandlerFilter> {
        let guids = self
            .device_guids
            .iter()
            .map(|g| parse_guid(g).with_context(|| format!("invalid device guid {g:?} in message handler")))
            .collect::<Result<Vec<Uuid>>>()?;
        Ok(HandlerFilter {
            notification_names: non_empty(self.notification_names.iter().cloned()),
            command_names: non_empty(self.command_names.iter().cloned()),
            device_guids: non_empty(guids),
            device_class_ids: non_empty(self.device_class_ids.iter().copied()),
            network_ids: non_empty(self.network_ids.iter().copied()),
        })
    }

    pub fn build(&self, store: Arc<dyn DataContext>) -> Result<MessageHandlerInfo> {
        let filter = self.filter()?;
        Ok(match self.kind {
            HandlerKind::DeviceStatus => {
                MessageHandlerInfo::new("device-status", Arc::new(DeviceStatusHandler::new(store)), filter)
            }
            HandlerKind::Equipment => {
                MessageHandlerInfo::new("equipment", Arc::new(EquipmentHandler::new(store)), filter)
            }
        })
    }
}

/// Build the configured handlers in order.
pub fn build_handlers(configs: &[HandlerConfig], store: &Arc<dyn DataContext>) -> Result<Vec<MessageHandlerInfo>> {
    configs.iter().map(|c| c.build(store.clone())).collect()
}

#[derive(Deserialize, Debug, Clone)]
pub struct SeedUser {
    #[serde(default)]
    pub id: i64,
    pub login: String,
    pub password: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub network_ids: Vec<i64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SeedDevice {
    #[serde(default)]
    pub id: i64,
    pub guid: String,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub network_id: Option<i64>,
    #[serde(default)]
    pub device_class_id: i64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SeedAccessKey {
    pub login: String,
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub permissions: Vec<AccessKeyPermission>,
}

/// Records loaded into the store at startup.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct SeedConfig {
    pub users: Vec<SeedUser>,
    pub networks: Vec<Network>,
    pub device_classes: Vec<DeviceClass>,
    pub devices: Vec<SeedDevice>,
    pub access_keys: Vec<SeedAccessKey>,
}

impl SeedConfig {
    pub fn apply(&self, store: &dyn DataContext) -> Result<()> {
        for seed in &self.users {
            let mut user = User::new(&seed.login, seed.role);
            user.id = seed.id;
            user.status = UserStatus::Active;
            user.network_ids = seed.network_ids.clone();
            user.set_password(&seed.password);
            store
                .users()
                .save(&mut user)
                .with_context(|| format!("failed to seed user {}", seed.login))?;
        }
        for network in &self.networks {
            store.networks().save(&mut network.clone())?;
        }
        for class in &self.device_classes {
            store.device_classes().save(&mut class.clone())?;
        }
        for seed in &self.devices {
            let guid = parse_guid(&seed.guid).with_context(|| format!("invalid device guid {:?}", seed.guid))?;
            let mut device = Device {
                id: seed.id,
                guid,
                key: Some(seed.key.clone()),
                name: seed.name.clone(),
                network_id: seed.network_id,
                device_class_id: seed.device_class_id,
                ..Default::default()
            };
            store
                .devices()
                .save(&mut device)
                .with_context(|| format!("failed to seed device {}", seed.name))?;
        }
        for seed in &self.access_keys {
            let user = store
                .users()
                .get_by_login(&seed.login)?
                .with_context(|| format!("access key references unknown user {}", seed.login))?;
            let mut key = AccessKey {
                user_id: user.id,
                key: seed.key.clone(),
                label: seed.label.clone(),
                permissions: seed.permissions.clone(),
                ..Default::default()
            };
            store.access_keys().save(&mut key)?;
        }
        tracing::info!(
            users = self.users.len(),
            devices = self.devices.len(),
            access_keys = self.access_keys.len(),
            "seeded store"
        );
        Ok(())
    }
}
