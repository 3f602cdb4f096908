use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use hive_bus::{DeviceCommandUpdated, DeviceNotificationAdded};
use hive_protocol::{Device, DeviceCommand, parse_guid};
use serde_json::{Map, json};
use uuid::Uuid;

use super::ServerInfo;
use crate::access::is_device_accessible;
use crate::actions::{
    ActionContext, ActionError, ActionInfo, ActionResult, ActionTable, Controller, ParamKind, ParamSpec,
};
use crate::filters::{AuthenticateClient, AuthorizeClient};
use crate::messages::MessageManager;
use crate::session::{Connection, SessionState};
use crate::store::DataContext;
use crate::subscriptions::SubscriptionManager;

const GET_NOTIFICATION: &str = "GetDeviceNotification";
const CREATE_COMMAND: &str = "CreateDeviceCommand";

/// Serves user clients on `/client`.
pub struct ClientController {
    store: Arc<dyn DataContext>,
    messages: Arc<MessageManager>,
    info: ServerInfo,
    max_login_attempts: u32,
    notification_subscriptions: SubscriptionManager<Uuid>,
    command_update_subscriptions: SubscriptionManager<i64>,
}

impl ClientController {
    pub fn new(
        store: Arc<dyn DataContext>,
        messages: Arc<MessageManager>,
        info: ServerInfo,
        max_login_attempts: u32,
    ) -> Self {
        Self {
            store,
            messages,
            info,
            max_login_attempts,
            notification_subscriptions: SubscriptionManager::new(),
            command_update_subscriptions: SubscriptionManager::new(),
        }
    }

    pub fn action_table(&self) -> ActionTable<Self> {
        let authenticate = Arc::new(AuthenticateClient::new(self.store.clone(), self.max_login_attempts));
        ActionTable::new("client")
            .action(ActionInfo::new("authenticate", |c: Arc<Self>, ctx| c.authenticate(ctx)).filter(authenticate.clone()))
            .action(
                ActionInfo::new("command/insert", |c: Arc<Self>, ctx| c.insert_command(ctx))
                    .filter(authenticate.clone())
                    .filter(Arc::new(AuthorizeClient::new(Some(CREATE_COMMAND))))
                    .param(ParamSpec::required("deviceGuid", ParamKind::Guid))
                    .param(ParamSpec::required("command", ParamKind::Object)),
            )
            .action(
                ActionInfo::new("notification/subscribe", |c: Arc<Self>, ctx| c.subscribe_notifications(ctx))
                    .filter(authenticate.clone())
                    .filter(Arc::new(AuthorizeClient::new(Some(GET_NOTIFICATION))))
                    .param(ParamSpec::optional("deviceGuids", ParamKind::Any))
                    .param(ParamSpec::optional("timestamp", ParamKind::Timestamp)),
            )
            .action(
                ActionInfo::new("notification/unsubscribe", |c: Arc<Self>, ctx| c.unsubscribe_notifications(ctx))
                    .filter(authenticate.clone())
                    .filter(Arc::new(AuthorizeClient::new(Some(GET_NOTIFICATION))))
                    .param(ParamSpec::optional("deviceGuids", ParamKind::Any)),
            )
            .action(ActionInfo::new("server/info", |c: Arc<Self>, ctx| c.server_info(ctx)))
    }

    async fn authenticate(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let Some(state) = ctx.auth.clone() else {
            return Err(ActionError::request("Please specify 'login' and 'password' or 'accessKey'"));
        };
        if let Some(user) = state.user() {
            tracing::info!(connection = %ctx.connection.id(), login = %user.login, "client authenticated");
        }
        ctx.connection.set_session(state);
        Ok(Map::new())
    }

    async fn insert_command(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let guid = ctx.guid("deviceGuid")?.ok_or_else(|| ActionError::missing("deviceGuid"))?;
        let mut command: DeviceCommand = ctx.required("command")?;
        let session = ctx.principal();

        let device = self
            .store
            .devices()
            .get_by_guid(&guid)?
            .filter(|d| is_device_accessible(self.store.as_ref(), &ctx.connection, &session, d, CREATE_COMMAND))
            .ok_or_else(|| ActionError::request("Device not found"))?;

        command.id = 0;
        command.timestamp_ms = 0;
        command.user_id = session.user().map(|u| u.id);
        command.device_id = device.id;

        let user = session.user().cloned();
        let command = match self.messages.handle_command(device, command.clone(), user).await? {
            Some(saved) => {
                self.command_update_subscriptions
                    .subscribe(&ctx.connection, Some(saved.id));
                saved
            }
            None => command,
        };
        Ok(hive_protocol::fields([("command", json!(command))]))
    }

    async fn subscribe_notifications(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let guids = ctx.guid_list("deviceGuids")?;
        let since: Option<u64> = ctx.optional("timestamp")?;
        let session = ctx.principal();
        let devices = self.accessible_devices(&ctx.connection, &session, guids.as_deref())?;

        match since {
            Some(since) => self.replay_and_subscribe(&ctx.connection, &session, devices.as_deref(), since)?,
            None => self.subscribe(&ctx.connection, devices.as_deref()),
        }
        Ok(Map::new())
    }

    async fn unsubscribe_notifications(self: Arc<Self>, ctx: ActionContext) -> ActionResult {
        let id = ctx.connection.id();
        match ctx.guid_list("deviceGuids")? {
            None => self.notification_subscriptions.unsubscribe(id, None),
            Some(guids) => {
                for guid in &guids {
                    self.notification_subscriptions.unsubscribe(id, Some(guid));
                }
            }
        }
        ctx.connection.replayed_notifications.clear();
        Ok(Map::new())
    }

    async fn server_info(self: Arc<Self>, _ctx: ActionContext) -> ActionResult {
        Ok(self.info.response())
    }

    /// Resolve requested guids to devices the session may read.
    fn accessible_devices(
        &self,
        connection: &Connection,
        session: &SessionState,
        guids: Option<&[Uuid]>,
    ) -> Result<Option<Vec<Device>>, ActionError> {
        let Some(guids) = guids else {
            return Ok(None);
        };
        guids
            .iter()
            .map(|guid| -> Result<Device, ActionError> {
                self.store
                    .devices()
                    .get_by_guid(guid)?
                    .filter(|d| is_device_accessible(self.store.as_ref(), connection, session, d, GET_NOTIFICATION))
                    .ok_or_else(|| ActionError::request(format!("Invalid deviceGuid: {guid}")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    fn subscribe(&self, connection: &Arc<Connection>, devices: Option<&[Device]>) {
        match devices {
            None => self.notification_subscriptions.subscribe(connection, None),
            Some(devices) => {
                for device in devices {
                    self.notification_subscriptions
                        .subscribe(connection, Some(device.guid));
                }
            }
        }
    }

    /// Subscribe, then push stored notifications newer than `since`. Live
    /// deliveries wait on the replay set and skip what was replayed.
    fn replay_and_subscribe(
        &self,
        connection: &Arc<Connection>,
        session: &SessionState,
        devices: Option<&[Device]>,
        since: u64,
    ) -> Result<(), ActionError> {
        let mut replayed = connection.replayed_notifications.lock();
        self.subscribe(connection, devices);
        let ids: Option<Vec<i64>> = devices.map(|ds| ds.iter().map(|d| d.id).collect());
        let notifications = self.store.notifications().get_by_devices(ids.as_deref(), since)?;

        let mut known: HashMap<i64, Option<Device>> = devices
            .unwrap_or_default()
            .iter()
            .map(|d| (d.id, Some(d.clone())))
            .collect();
        for notification in notifications {
            if !known.contains_key(&notification.device_id) {
                let device = self
                    .store
                    .devices()
                    .get(notification.device_id)?
                    .filter(|d| is_device_accessible(self.store.as_ref(), connection, session, d, GET_NOTIFICATION));
                known.insert(notification.device_id, device);
            }
            let Some(Some(device)) = known.get(&notification.device_id) else {
                continue;
            };
            connection.send_push(
                "notification/insert",
                hive_protocol::fields([
                    ("deviceGuid", json!(device.guid)),
                    ("notification", json!(notification)),
                ]),
            );
            replayed.insert(notification.id);
        }
        Ok(())
    }

    /// Fan a stored notification out to subscribed client connections.
    pub fn handle_device_notification(&self, event: DeviceNotificationAdded) -> anyhow::Result<()> {
        let guid = parse_guid(&event.device_guid)
            .with_context(|| format!("bad device guid {}", event.device_guid))?;
        let connections = self.notification_subscriptions.get_connections(Some(&guid));
        if connections.is_empty() {
            return Ok(());
        }
        let notification = self
            .store
            .notifications()
            .get(event.notification_id)?
            .with_context(|| format!("notification {} not found", event.notification_id))?;
        let device = self
            .store
            .devices()
            .get(event.device_id)?
            .with_context(|| format!("device {} not found", event.device_id))?;

        let push = hive_protocol::fields([
            ("deviceGuid", json!(device.guid)),
            ("notification", json!(notification)),
        ]);
        for connection in connections {
            if connection.replayed_notifications.contains(notification.id) {
                continue;
            }
            let session = connection.session();
            if !is_device_accessible(self.store.as_ref(), &connection, &session, &device, GET_NOTIFICATION) {
                continue;
            }
            connection.send_push("notification/insert", push.clone());
        }
        Ok(())
    }

    /// Tell the client that created a command about its new state.
    pub fn handle_command_update(&self, event: DeviceCommandUpdated) -> anyhow::Result<()> {
        let connections = self
            .command_update_subscriptions
            .get_connections(Some(&event.command_id));
        if connections.is_empty() {
            return Ok(());
        }
        let command = self
            .store
            .commands()
            .get(event.command_id)?
            .with_context(|| format!("command {} not found", event.command_id))?;
        for connection in connections {
            connection.send_push("command/update", hive_protocol::fields([("command", json!(command))]));
        }
        Ok(())
    }
}

impl Controller for ClientController {
    fn cleanup_connection(&self, connection: &Connection) {
        self.notification_subscriptions.cleanup(connection.id());
        self.command_update_subscriptions.cleanup(connection.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionController, ControllerDispatch};
    use crate::session::test_connection;
    use crate::store::MemoryStore;
    use hive_bus::{LocalTransport, MessageBus};
    use hive_protocol::{DeviceNotification, User, UserRole};
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        controller: ActionController<ClientController>,
        device: Device,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut admin = User::new("admin", UserRole::Administrator);
        admin.set_password("pw");
        store.users().save(&mut admin).unwrap();
        let mut client = User::new("client", UserRole::Client);
        client.set_password("pw");
        store.users().save(&mut client).unwrap();
        let mut device = Device {
            guid: Uuid::new_v4(),
            name: "lamp".into(),
            network_id: Some(5),
            ..Default::default()
        };
        store.devices().save(&mut device).unwrap();

        let bus = MessageBus::start(Arc::new(LocalTransport::standalone())).await.unwrap();
        let messages = Arc::new(MessageManager::new(Vec::new(), store.clone(), bus));
        let client = Arc::new(ClientController::new(store.clone(), messages, ServerInfo::default(), 3));
        let table = client.action_table();
        Fixture {
            store,
            controller: ActionController::new(client, table),
            device,
        }
    }

    async fn call(f: &Fixture, conn: &Arc<Connection>, rx: &mut mpsc::Receiver<String>, request: Value) -> Value {
        let Value::Object(map) = request else {
            panic!("object expected")
        };
        f.controller.dispatch(conn, map).await;
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    async fn login(f: &Fixture, login: &str) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let (conn, mut rx) = test_connection("/client");
        let resp = call(f, &conn, &mut rx, json!({"action": "authenticate", "login": login, "password": "pw"})).await;
        assert_eq!(resp["status"], "success", "{resp}");
        (conn, rx)
    }

    #[tokio::test]
    async fn authenticate_requires_credentials() {
        let f = fixture().await;
        let (conn, mut rx) = test_connection("/client");
        let resp = call(&f, &conn, &mut rx, json!({"action": "authenticate"})).await;
        assert_eq!(resp["error"], "Please specify 'login' and 'password' or 'accessKey'");
        let resp = call(&f, &conn, &mut rx, json!({"action": "authenticate", "login": "admin", "password": "x"})).await;
        assert_eq!(resp["error"], "Invalid login or password");
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn actions_require_a_session() {
        let f = fixture().await;
        let (conn, mut rx) = test_connection("/client");
        let resp = call(&f, &conn, &mut rx, json!({"action": "notification/subscribe"})).await;
        assert_eq!(resp["error"], "Please authenticate to invoke this action");
    }

    #[tokio::test]
    async fn insert_command_saves_and_tracks_updates() {
        let f = fixture().await;
        let (conn, mut rx) = login(&f, "admin").await;
        let resp = call(
            &f,
            &conn,
            &mut rx,
            json!({"action": "command/insert", "deviceGuid": f.device.guid.to_string(), "command": {"command": "on"}}),
        )
        .await;
        assert_eq!(resp["status"], "success", "{resp}");
        let id = resp["command"]["id"].as_i64().unwrap();
        let stored = f.store.commands().get(id).unwrap().unwrap();
        assert_eq!(stored.device_id, f.device.id);
        assert!(stored.user_id.is_some());

        let mut updated = stored.clone();
        updated.status = Some("done".into());
        f.store.commands().save(&mut updated).unwrap();
        f.controller
            .controller()
            .handle_command_update(DeviceCommandUpdated {
                device_id: f.device.id,
                device_guid: f.device.guid.to_string(),
                command_id: id,
            })
            .unwrap();
        let push: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(push["action"], "command/update");
        assert_eq!(push["command"]["status"], "done");
    }

    #[tokio::test]
    async fn client_outside_network_cannot_reach_device() {
        let f = fixture().await;
        let (conn, mut rx) = login(&f, "client").await;
        let resp = call(
            &f,
            &conn,
            &mut rx,
            json!({"action": "command/insert", "deviceGuid": f.device.guid.to_string(), "command": {"command": "on"}}),
        )
        .await;
        assert_eq!(resp["error"], "Device not found");

        let resp = call(
            &f,
            &conn,
            &mut rx,
            json!({"action": "notification/subscribe", "deviceGuids": [f.device.guid.to_string()]}),
        )
        .await;
        assert_eq!(resp["error"], format!("Invalid deviceGuid: {}", f.device.guid));
    }

    #[tokio::test]
    async fn replay_then_live_delivery_without_duplicates() {
        let f = fixture().await;
        let mut old = DeviceNotification::new("temp", f.device.id);
        old.timestamp_ms = 100;
        f.store.notifications().save(&mut old).unwrap();

        let (conn, mut rx) = login(&f, "admin").await;
        f.controller
            .dispatch(
                &conn,
                json!({"action": "notification/subscribe", "timestamp": 50})
                    .as_object()
                    .unwrap()
                    .clone(),
            )
            .await;
        let replay: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(replay["action"], "notification/insert");
        assert_eq!(replay["notification"]["id"], old.id);
        let resp: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(resp["status"], "success");

        let client = f.controller.controller();
        let event = |id| DeviceNotificationAdded {
            device_id: f.device.id,
            device_guid: f.device.guid.to_string(),
            notification_id: id,
        };
        client.handle_device_notification(event(old.id)).unwrap();
        assert!(rx.try_recv().is_err());

        let mut fresh = DeviceNotification::new("temp", f.device.id);
        f.store.notifications().save(&mut fresh).unwrap();
        client.handle_device_notification(event(fresh.id)).unwrap();
        let live: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(live["notification"]["id"], fresh.id);
        assert_eq!(live["deviceGuid"], f.device.guid.to_string());

        assert_eq!(conn.replayed_notifications.len(), 1);
        let resp = call(&f, &conn, &mut rx, json!({"action": "notification/unsubscribe"})).await;
        assert_eq!(resp["status"], "success");
        assert!(conn.replayed_notifications.is_empty());
    }

    #[tokio::test]
    async fn cleanup_stops_delivery() {
        let f = fixture().await;
        let (conn, mut rx) = login(&f, "admin").await;
        let resp = call(&f, &conn, &mut rx, json!({"action": "notification/subscribe"})).await;
        assert_eq!(resp["status"], "success");
        f.controller.cleanup_connection(&conn);

        let mut n = DeviceNotification::new("temp", f.device.id);
        f.store.notifications().save(&mut n).unwrap();
        f.controller
            .controller()
            .handle_device_notification(DeviceNotificationAdded {
                device_id: f.device.id,
                device_guid: f.device.guid.to_string(),
                notification_id: n.id,
            })
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_info_reports_version() {
        let f = fixture().await;
        let (conn, mut rx) = test_connection("/client");
        let resp = call(&f, &conn, &mut rx, json!({"action": "server/info", "requestId": 1})).await;
        assert_eq!(resp["info"]["apiVersion"], hive_protocol::API_VERSION);
        assert_eq!(resp["requestId"], 1);
    }
}
