use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use hive_protocol::ActionResponse;
use serde_json::Value;
use uuid::Uuid;

use super::ControllerDispatch;
use crate::session::Connection;

/// Maps socket paths to controllers and tracks which controller owns
/// each live connection.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn ControllerDispatch>>,
    connections: DashMap<Uuid, (Arc<Connection>, Arc<dyn ControllerDispatch>)>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
    trimmed.to_ascii_lowercase()
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_controller(&mut self, path: &str, controller: Arc<dyn ControllerDispatch>) {
        tracing::debug!(path, controller = controller.name(), "registered controller");
        self.routes.insert(normalize(path), controller);
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<dyn ControllerDispatch>> {
        self.routes.get(&normalize(path)).cloned()
    }

    /// Bind a new connection to the controller serving its path. Returns
    /// false if no controller is mounted there; the caller closes the socket.
    pub fn handle_new_connection(&self, connection: &Arc<Connection>) -> bool {
        let Some(controller) = self.resolve(connection.path()) else {
            tracing::debug!(path = connection.path(), "no controller for path");
            return false;
        };
        tracing::info!(
            connection = %connection.id(),
            path = connection.path(),
            host = ?connection.host(),
            "connection opened"
        );
        self.connections
            .insert(connection.id(), (connection.clone(), controller));
        true
    }

    fn controller_for(&self, id: Uuid) -> Option<Arc<dyn ControllerDispatch>> {
        self.connections.get(&id).map(|entry| entry.value().1.clone())
    }

    /// Parse one text frame and hand it to the connection's controller.
    pub async fn route_request(&self, connection: &Arc<Connection>, text: &str) {
        let Some(controller) = self.controller_for(connection.id()) else {
            tracing::warn!(connection = %connection.id(), "request on unregistered connection");
            return;
        };
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(request)) => controller.dispatch(connection, request).await,
            Ok(_) => {
                connection
                    .send_response(&ActionResponse::error(
                        None,
                        None,
                        "Request must be a JSON object".to_string(),
                    ))
                    .await;
            }
            Err(e) => {
                tracing::debug!(connection = %connection.id(), "malformed request: {e}");
                connection
                    .send_response(&ActionResponse::error(
                        None,
                        None,
                        "Malformed JSON request".to_string(),
                    ))
                    .await;
            }
        }
    }

    pub async fn handle_ping(&self, connection: &Arc<Connection>) {
        if let Some(controller) = self.controller_for(connection.id()) {
            controller.ping(connection).await;
        }
    }

    /// Forget a closed connection. Safe to call more than once.
    pub fn cleanup_connection(&self, id: Uuid) {
        if let Some((_, (connection, controller))) = self.connections.remove(&id) {
            connection.close();
            controller.cleanup_connection(&connection);
            tracing::info!(connection = %id, path = connection.path(), "connection closed");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionContext, ActionController, ActionInfo, ActionResult, ActionTable, Controller};
    use crate::session::test_connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        cleaned: AtomicUsize,
    }

    impl Controller for Counter {
        fn cleanup_connection(&self, _connection: &Connection) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn hello(_c: Arc<Counter>, _ctx: ActionContext) -> ActionResult {
        Ok(hive_protocol::fields([("hello", Value::Bool(true))]))
    }

    fn router() -> (Router, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let table = ActionTable::new("client").action(ActionInfo::new("hello", hello));
        let mut router = Router::new();
        router.register_controller("/client", Arc::new(ActionController::new(counter.clone(), table)));
        (router, counter)
    }

    #[test]
    fn paths_are_case_and_slash_insensitive() {
        let (router, _) = router();
        assert!(router.resolve("/Client/").is_some());
        assert!(router.resolve("/client").is_some());
        assert!(router.resolve("/device").is_none());
    }

    #[tokio::test]
    async fn unknown_path_is_rejected() {
        let (router, _) = router();
        let (conn, _rx) = test_connection("/nowhere");
        assert!(!router.handle_new_connection(&conn));
        assert_eq!(router.connection_count(), 0);
    }

    #[tokio::test]
    async fn routes_frames_to_the_bound_controller() {
        let (router, _) = router();
        let (conn, mut rx) = test_connection("/client");
        assert!(router.handle_new_connection(&conn));
        router.route_request(&conn, r#"{"action":"hello"}"#).await;
        let resp: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(resp["hello"], true);
    }

    #[tokio::test]
    async fn malformed_json_gets_error_envelope() {
        let (router, _) = router();
        let (conn, mut rx) = test_connection("/client");
        router.handle_new_connection(&conn);
        router.route_request(&conn, "{not json").await;
        let resp: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(resp["status"], "error");
        assert!(resp["action"].is_null());

        router.route_request(&conn, "[1,2]").await;
        let resp: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(resp["status"], "error");
    }

    #[tokio::test]
    async fn cleanup_runs_once() {
        let (router, counter) = router();
        let (conn, _rx) = test_connection("/client");
        router.handle_new_connection(&conn);
        router.cleanup_connection(conn.id());
        router.cleanup_connection(conn.id());
        assert_eq!(counter.cleaned.load(Ordering::SeqCst), 1);
        assert!(conn.is_closed());
        assert_eq!(router.connection_count(), 0);
    }
}
