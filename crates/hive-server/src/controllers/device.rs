use std::sync::Arc;

use anyhow::Context;
use hive_bus::DeviceCommandAdded;
use hive_protocol::special_notifications::{DEVICE_ADD, DEVICE_UPDATE};
use hive_protocol::{Device, DeviceClass, DeviceNotification, Network, now_ms, parse_guid};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::ServerInfo;
use crate::actions::{
    ActionContext, ActionError, ActionInfo, ActionResult, ActionTable, Controller, ParamKind, ParamSpec,
};
use crate::filters::{AuthenticateDevice, AuthorizeDevice, AuthorizeDeviceRegistration};
use crate::messages::MessageManager;
use crate::session::Connection;
use crate::store::DataContext;
use crate::subscriptions::SubscriptionManager;

/// Fields a device may change on its command.
#[derive(Deserialize)]
struct CommandUpdate {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkRef {
    name: String,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceClassRef {
    name: String,
    version: String,
    #[serde(default)]
    is_permanent: Option<bool>,
    #[serde(default)]
    offline_timeout: Option<u32>,
}

/// Body of `device/save`. Absent fields keep their stored value.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRegistration {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    network: Option<NetworkRef>,
    #[serde(default)]
    device_class: Option<DeviceClassRef>,
}

/// Serves devices on `/device`.
pub struct DeviceController {
    store: Arc<dyn DataContext>,
    messages: Arc<MessageManager>,
    info: ServerInfo,
    command_subscriptions: SubscriptionManager<Uuid>,
}

impl DeviceController {
    pub fn new(store: Arc<dyn DataContext>, messages: Arc<MessageManager>, info: ServerInfo) -> Self {
        Self {
            store,
            messages,
            info,
            command_subscriptions: SubscriptionManager::new(),
        }
    }

    pub fn action_table(&self) -> ActionTable<Self> {
        let authenticate = Arc::new(AuthenticateDevice::new(self.store.clone()));
        let authorize = Arc::new(AuthorizeDevice);
        ActionTable::new("device")
            .action(ActionInfo::new("authenticate", |c: Arc<Self>, ctx| c.authenticate(ctx)).filter(authenticate.clone()))
            .action(
                ActionInfo::new("notification/insert", |c: Arc<Self>, ctx| c.insert_notification(ctx))
                    .filter(authenticate.clone())
                    .filter(authorize.clone())
                    .param(ParamSpec::required("notification", ParamKind::Object)),
            )
            .action(
                ActionInfo::new("command/update", |c: Arc<Self>, ctx| c.update_command(ctx))
                    .filter(authenticate.clone())
                    .filter(authorize.clone())
                    .param(ParamSpec::required("commandId", ParamKind::Integer))
                    .param(ParamSpec::required("command", ParamKind::Object)),
            )
            .action(
                ActionInfo::new("command/subscribe", |c: Arc<Self>, ctx| c.subscribe_commands(ctx))
                    .filter(authenticate.clone())
                    .filter(authorize.clone())
                    .param(ParamSpec::optional("timestamp", ParamKind::Timestamp)),
            )
            .action(
                ActionInfo::new("command/unsubscribe", |c: Arc<Self>, ctx| c.unsubscribe_commands(ctx))
                    .filter(authenticate.clone())
                    .filter(authorize.clone()),
            )
            .action(
                ActionInfo::new("device/get", |c: Arc<Self>, ctx| c.get_device(ctx))
                    .filter(authenticate.clone())
                    .filter(authorize),
            )
            .action(
                ActionInfo::new("device/save", |c: Arc<Self>, ctx| c.save_device(ctx))
                    .filter(authenticate)
                    .filter(Arc::new(AuthorizeDeviceRegistration::new(self.store.clone())))
                    .param(ParamSpec::required("deviceId", ParamKind::Guid))
                    .param(ParamSpec::required("device", ParamKind::Object)),
            )
            .action(ActionInfo::new("server/info", |c: Arc<Self>, ctx| c.server_info(ctx)))
            .on_ping(ActionInfo::new("ping", |c: Arc<Self>, ctx| c.ping(ctx)))
    }

    fn current_device(ctx: &ActionContext) -> Result<Device, ActionError> {
        ctx.device()
            .ok_or_else(|| ActionError::request("Please authenticate to invoke this action"))
    }

    async fn authenticate(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let Some(state) = ctx.auth.clone() else {
            return Err(ActionError::request("Please specify valid authentication data"));
        };
        if let Some(device) = state.device() {
            tracing::info!(connection = %ctx.connection.id(), device = %device.guid, "device authenticated");
        }
        ctx.connection.set_session(state);
        Ok(Map::new())
    }

    async fn insert_notification(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let device = Self::current_device(&ctx)?;
        let mut notification: DeviceNotification = ctx.required("notification")?;
        notification.id = 0;
        notification.timestamp_ms = 0;
        notification.device_id = device.id;

        let notification = self
            .messages
            .handle_notification(device, notification.clone(), None)
            .await?
            .unwrap_or(notification);
        Ok(hive_protocol::fields([("notification", json!(notification))]))
    }

    async fn update_command(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let device = Self::current_device(&ctx)?;
        let command_id: i64 = ctx.param("commandId")?;
        if command_id == 0 {
            return Err(ActionError::request("Please specify valid commandId"));
        }
        let update: CommandUpdate = ctx.required("command")?;

        let mut command = self
            .store
            .commands()
            .get(command_id)?
            .filter(|c| c.device_id == device.id)
            .ok_or_else(|| ActionError::request("Device command not found"))?;
        if update.status.is_some() {
            command.status = update.status;
        }
        if update.result.is_some() {
            command.result = update.result;
        }

        self.messages.handle_command_update(device, command, None).await?;
        Ok(Map::new())
    }

    async fn subscribe_commands(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let device = Self::current_device(&ctx)?;
        let since: Option<u64> = ctx.optional("timestamp")?;
        let Some(since) = since else {
            self.command_subscriptions
                .subscribe(&ctx.connection, Some(device.guid));
            return Ok(Map::new());
        };

        // Subscribe under the replay lock: a command saved after the query
        // below is delivered live once the lock is released.
        let mut replayed = ctx.connection.replayed_commands.lock();
        self.command_subscriptions
            .subscribe(&ctx.connection, Some(device.guid));
        for command in self.store.commands().get_by_device(device.id, since)? {
            ctx.connection.send_push(
                "command/insert",
                hive_protocol::fields([("deviceGuid", json!(device.guid)), ("command", json!(command))]),
            );
            replayed.insert(command.id);
        }
        drop(replayed);
        Ok(Map::new())
    }

    async fn unsubscribe_commands(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let device = Self::current_device(&ctx)?;
        self.command_subscriptions
            .unsubscribe(ctx.connection.id(), Some(&device.guid));
        ctx.connection.replayed_commands.clear();
        Ok(Map::new())
    }

    async fn get_device(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let device = Self::current_device(&ctx)?;
        let device = self.store.devices().get(device.id)?.unwrap_or(device);
        Ok(hive_protocol::fields([("device", json!(device))]))
    }

    /// Register a new device or update the caller's own record.
    async fn save_device(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let guid = ctx.guid("deviceId")?.ok_or_else(|| ActionError::missing("deviceId"))?;
        let body: DeviceRegistration = ctx.required("device")?;
        let existing = self.store.devices().get_by_guid(&guid)?;
        let is_new = existing.is_none();

        let mut device = match existing {
            Some(device) => device,
            None => {
                if body.key.is_none() {
                    return Err(ActionError::missing("device.key"));
                }
                if body.name.is_none() {
                    return Err(ActionError::missing("device.name"));
                }
                if body.device_class.is_none() {
                    return Err(ActionError::missing("device.deviceClass"));
                }
                Device {
                    guid,
                    ..Default::default()
                }
            }
        };

        if let Some(key) = body.key {
            device.key = Some(key);
        }
        if let Some(name) = body.name {
            device.name = name;
        }
        if body.status.is_some() {
            device.status = body.status;
        }
        if body.data.is_some() {
            device.data = body.data;
        }
        if let Some(network) = body.network {
            device.network_id = Some(self.resolve_network(network)?.id);
        }
        if let Some(class) = body.device_class {
            device.device_class_id = self.resolve_device_class(class)?.id;
        }
        self.store.devices().save(&mut device)?;
        tracing::info!(device = %device.guid, new = is_new, "device saved");

        let mut notification = DeviceNotification::new(if is_new { DEVICE_ADD } else { DEVICE_UPDATE }, device.id);
        notification.parameters = Some(json!(device));
        self.messages
            .handle_notification(device, notification, None)
            .await?;
        Ok(Map::new())
    }

    async fn server_info(self: Arc<Self>, _ctx: ActionContext) -> ActionResult {
        Ok(self.info.response())
    }

    async fn ping(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let Some(device) = ctx.connection.session().device().cloned() else {
            return Ok(Map::new());
        };
        if let Some(mut stored) = self.store.devices().get(device.id)? {
            stored.last_online_ms = Some(now_ms());
            self.store.devices().save(&mut stored)?;
        }
        Ok(Map::new())
    }

    fn resolve_network(&self, reference: NetworkRef) -> Result<Network, ActionError> {
        if let Some(network) = self.store.networks().get_by_name(&reference.name)? {
            if network.key.is_some() && network.key != reference.key {
                return Err(ActionError::request("Invalid network key"));
            }
            return Ok(network);
        }
        let mut network = Network {
            name: reference.name,
            key: reference.key,
            description: reference.description,
            ..Default::default()
        };
        self.store.networks().save(&mut network)?;
        Ok(network)
    }

    fn resolve_device_class(&self, reference: DeviceClassRef) -> Result<DeviceClass, ActionError> {
        let mut class = self
            .store
            .device_classes()
            .get_by_name_and_version(&reference.name, &reference.version)?
            .unwrap_or_else(|| DeviceClass {
                name: reference.name,
                version: reference.version,
                ..Default::default()
            });
        if let Some(permanent) = reference.is_permanent {
            class.is_permanent = permanent;
        }
        if reference.offline_timeout.is_some() {
            class.offline_timeout = reference.offline_timeout;
        }
        self.store.device_classes().save(&mut class)?;
        Ok(class)
    }

    /// Push a new command to the connections of its device.
    pub fn handle_device_command(&self, event: DeviceCommandAdded) -> anyhow::Result<()> {
        let guid = parse_guid(&event.device_guid)
            .with_context(|| format!("bad device guid {}", event.device_guid))?;
        let connections = self.command_subscriptions.get_connections(Some(&guid));
        if connections.is_empty() {
            return Ok(());
        }
        let command = self
            .store
            .commands()
            .get(event.command_id)?
            .with_context(|| format!("command {} not found", event.command_id))?;

        let push = hive_protocol::fields([("deviceGuid", json!(guid)), ("command", json!(command))]);
        for connection in connections {
            if connection.replayed_commands.contains(command.id) {
                continue;
            }
            connection.send_push("command/insert", push.clone());
        }
        Ok(())
    }
}

impl Controller for DeviceController {
    fn cleanup_connection(&self, connection: &Connection) {
        self.command_subscriptions.cleanup(connection.id());
    }
}
