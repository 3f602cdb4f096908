use std::sync::Arc;

use async_trait::async_trait;
use hive_protocol::ActionResponse;
use serde_json::{Map, Value};

use super::{ActionContext, ActionError, ActionTable};
use crate::session::Connection;

/// Hooks a controller type exposes besides its actions.
pub trait Controller: Send + Sync + 'static {
    /// Release whatever the controller holds for a closed connection.
    fn cleanup_connection(&self, _connection: &Connection) {}
}

/// What the router needs from the controller mounted on a path.
#[async_trait]
pub trait ControllerDispatch: Send + Sync {
    fn name(&self) -> &str;

    /// Run one parsed request and send its response envelope.
    async fn dispatch(&self, connection: &Arc<Connection>, request: Map<String, Value>);

    async fn ping(&self, connection: &Arc<Connection>);

    fn cleanup_connection(&self, connection: &Connection);
}

/// Binds one controller instance to its action table.
pub struct ActionController<C> {
    controller: Arc<C>,
    table: ActionTable<C>,
}

impl<C: Controller> ActionController<C> {
    pub fn new(controller: Arc<C>, table: ActionTable<C>) -> Self {
        Self { controller, table }
    }

    pub fn controller(&self) -> &Arc<C> {
        &self.controller
    }

    async fn run(&self, connection: &Arc<Connection>, action: &str, request: Map<String, Value>) -> super::ActionResult {
        let info = self
            .table
            .get(action)
            .ok_or_else(|| ActionError::UnknownAction {
                action: action.to_string(),
                controller: self.table.controller().to_string(),
            })?;
        let ctx = ActionContext::new(connection.clone(), action, request);
        info.invoke(self.controller.clone(), ctx).await
    }
}

#[async_trait]
impl<C: Controller> ControllerDispatch for ActionController<C> {
    fn name(&self) -> &str {
        self.table.controller()
    }

    async fn dispatch(&self, connection: &Arc<Connection>, request: Map<String, Value>) {
        let action = request
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let request_id = request.get("requestId").filter(|v| !v.is_null()).cloned();

        let result = match action.as_deref() {
            Some(name) => self.run(connection, name, request).await,
            None => Err(ActionError::missing("action")),
        };

        let envelope = match result {
            Ok(fields) => ActionResponse::success(action, request_id, fields),
            Err(e) => {
                if e.is_request_error() {
                    tracing::debug!(connection = %connection.id(), action = ?action, "request rejected: {e}");
                } else {
                    tracing::error!(connection = %connection.id(), action = ?action, "action failed: {e}");
                }
                ActionResponse::error(action, request_id, e.client_message())
            }
        };
        connection.send_response(&envelope).await;
    }

    async fn ping(&self, connection: &Arc<Connection>) {
        let Some(info) = self.table.ping() else {
            return;
        };
        let ctx = ActionContext::new(connection.clone(), info.name(), Map::new());
        if let Err(e) = info.invoke(self.controller.clone(), ctx).await {
            tracing::debug!(connection = %connection.id(), "ping handler failed: {e}");
        }
    }

    fn cleanup_connection(&self, connection: &Connection) {
        self.controller.cleanup_connection(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionInfo, ActionResult};
    use crate::session::{test_connection, test_connection_with_capacity};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Probe {
        pings: AtomicUsize,
        cleaned: AtomicUsize,
    }

    impl Controller for Probe {
        fn cleanup_connection(&self, _connection: &Connection) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn echo(_p: Arc<Probe>, ctx: ActionContext) -> ActionResult {
        let text: String = ctx.required("text")?;
        Ok(hive_protocol::fields([("text", json!(text))]))
    }

    async fn explode(_p: Arc<Probe>, _ctx: ActionContext) -> ActionResult {
        Err(anyhow::anyhow!("disk on fire").into())
    }

    async fn ping(p: Arc<Probe>, _ctx: ActionContext) -> ActionResult {
        p.pings.fetch_add(1, Ordering::SeqCst);
        Ok(Map::new())
    }

    fn controller() -> ActionController<Probe> {
        let table = ActionTable::new("probe")
            .action(ActionInfo::new("echo", echo))
            .action(ActionInfo::new("explode", explode))
            .on_ping(ActionInfo::new("ping", ping));
        ActionController::new(Arc::new(Probe::default()), table)
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    async fn reply(c: &ActionController<Probe>, request: Value) -> Value {
        let (conn, mut rx) = test_connection("/probe");
        c.dispatch(&conn, object(request)).await;
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn success_echoes_action_and_request_id() {
        let c = controller();
        let resp = reply(&c, json!({"action": "echo", "requestId": "r1", "text": "hi"})).await;
        assert_eq!(resp["action"], "echo");
        assert_eq!(resp["requestId"], "r1");
        assert_eq!(resp["status"], "success");
        assert_eq!(resp["text"], "hi");
    }

    #[tokio::test]
    async fn unknown_action_is_a_request_error() {
        let c = controller();
        let resp = reply(&c, json!({"action": "fly", "requestId": 9})).await;
        assert_eq!(resp["status"], "error");
        assert_eq!(resp["requestId"], 9);
        assert_eq!(resp["error"], "Can't find action fly in controller probe");
    }

    #[tokio::test]
    async fn missing_action_field() {
        let c = controller();
        let resp = reply(&c, json!({"text": "hi"})).await;
        assert_eq!(resp["status"], "error");
        assert!(resp["action"].is_null());
        assert_eq!(resp["error"], "Please specify 'action'");
    }

    #[tokio::test]
    async fn internal_failure_is_reported_as_server_error() {
        let c = controller();
        let resp = reply(&c, json!({"action": "explode"})).await;
        assert_eq!(resp["status"], "error");
        assert_eq!(resp["error"], "Server error");
    }

    #[tokio::test]
    async fn response_waits_behind_a_full_push_queue() {
        let c = controller();
        let (conn, mut rx) = test_connection_with_capacity("/probe", 2);
        assert!(conn.send_push("notification/insert", Map::new()));
        assert!(conn.send_push("notification/insert", Map::new()));
        assert!(!conn.send_push("notification/insert", Map::new()));

        let dispatched = {
            let conn = conn.clone();
            tokio::spawn(async move {
                c.dispatch(&conn, object(json!({"action": "echo", "requestId": 1, "text": "hi"})))
                    .await;
            })
        };

        let mut frames = Vec::new();
        while frames.len() < 3 {
            let frame = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            frames.push(serde_json::from_str::<Value>(&frame).unwrap());
        }
        dispatched.await.unwrap();

        assert_eq!(frames[0]["action"], "notification/insert");
        assert_eq!(frames[1]["action"], "notification/insert");
        assert_eq!(frames[2]["requestId"], 1);
        assert_eq!(frames[2]["status"], "success");
    }

    #[tokio::test]
    async fn ping_and_cleanup_reach_controller() {
        let c = controller();
        let (conn, _rx) = test_connection("/probe");
        c.ping(&conn).await;
        c.cleanup_connection(&conn);
        assert_eq!(c.controller().pings.load(Ordering::SeqCst), 1);
        assert_eq!(c.controller().cleaned.load(Ordering::SeqCst), 1);
    }
}
