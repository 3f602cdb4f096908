//! Per-connection state shared by the socket loop and the controllers.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use hive_protocol::{AccessKey, Device, PushMessage, User};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a request reply may wait behind queued pushes.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Default)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    User {
        user: User,
        access_key: Option<AccessKey>,
    },
    Device(Device),
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, SessionState::Unauthenticated)
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            SessionState::User { user, .. } => Some(user),
            _ => None,
        }
    }

    pub fn access_key(&self) -> Option<&AccessKey> {
        match self {
            SessionState::User { access_key, .. } => access_key.as_ref(),
            _ => None,
        }
    }

    pub fn device(&self) -> Option<&Device> {
        match self {
            SessionState::Device(device) => Some(device),
            _ => None,
        }
    }
}

/// Ids already pushed to a connection as part of a subscription replay.
/// Live deliveries of the same ids are skipped.
#[derive(Debug, Default)]
pub struct ReplaySet(Mutex<HashSet<i64>>);

impl ReplaySet {
    /// Hold the set while a replay runs so live deliveries wait for it.
    pub fn lock(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.lock().contains(&id)
    }

    /// Forget replayed ids once the subscription that produced them ends.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub struct Connection {
    id: Uuid,
    path: String,
    host: Option<IpAddr>,
    session: RwLock<SessionState>,
    user_networks: Mutex<Option<HashSet<i64>>>,
    pub replayed_notifications: ReplaySet,
    pub replayed_commands: ReplaySet,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(path: impl Into<String>, host: Option<IpAddr>, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            host,
            session: RwLock::new(SessionState::Unauthenticated),
            user_networks: Mutex::new(None),
            replayed_notifications: ReplaySet::default(),
            replayed_commands: ReplaySet::default(),
            outbound,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host(&self) -> Option<IpAddr> {
        self.host
    }

    pub fn session(&self) -> SessionState {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_session(&self, state: SessionState) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = state;
        self.user_networks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_authenticated(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_authenticated()
    }

    /// Network ids of the session user, loaded once per session.
    pub fn user_networks(&self, load: impl FnOnce() -> HashSet<i64>) -> HashSet<i64> {
        self.user_networks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(load)
            .clone()
    }

    /// Queue an unsolicited frame. Returns false if the frame was dropped; a
    /// closed or backed-up connection never fails the caller.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        let Some(text) = self.encode(value) else {
            return false;
        };
        match self.outbound.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection = %self.id, "outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection = %self.id, "connection writer gone");
                false
            }
        }
    }

    /// Queue the reply to a request, waiting up to [`RESPONSE_TIMEOUT`] for
    /// the writer to make room when the queue is full of pushes.
    pub async fn send_response<T: Serialize>(&self, value: &T) -> bool {
        let Some(text) = self.encode(value) else {
            return false;
        };
        match self.outbound.send_timeout(text, RESPONSE_TIMEOUT).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(connection = %self.id, "writer stalled, dropping response");
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!(connection = %self.id, "connection writer gone");
                false
            }
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> Option<String> {
        if self.closed.is_cancelled() {
            tracing::debug!(connection = %self.id, "send on closed connection ignored");
            return None;
        }
        serde_json::to_string(value)
            .inspect_err(|e| tracing::error!(connection = %self.id, "failed to serialize frame: {e}"))
            .ok()
    }

    pub fn send_push(&self, action: &str, fields: Map<String, Value>) -> bool {
        self.send_json(&PushMessage::new(action, fields))
    }

    /// Ask the socket loop to close the connection.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn test_connection(path: &str) -> (std::sync::Arc<Connection>, mpsc::Receiver<String>) {
    test_connection_with_capacity(path, 64)
}

#[cfg(test)]
pub(crate) fn test_connection_with_capacity(
    path: &str,
    capacity: usize,
) -> (std::sync::Arc<Connection>, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        std::sync::Arc::new(Connection::new(path, Some([127, 0, 0, 1].into()), tx)),
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_protocol::{UserRole, fields};
    use serde_json::json;

    #[test]
    fn session_transitions() {
        let (conn, _rx) = test_connection("/client");
        assert!(!conn.is_authenticated());
        conn.set_session(SessionState::User {
            user: User::new("u", UserRole::Client),
            access_key: None,
        });
        assert!(conn.is_authenticated());
        assert_eq!(conn.session().user().map(|u| u.login.as_str()), Some("u"));
        assert!(conn.session().device().is_none());
    }

    #[test]
    fn push_frames_reach_the_writer() {
        let (conn, mut rx) = test_connection("/client");
        assert!(conn.send_push("notification/insert", fields([("deviceGuid", json!("d"))])));
        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["action"], "notification/insert");
        assert_eq!(frame["deviceGuid"], "d");
    }

    #[test]
    fn send_after_close_is_silently_dropped() {
        let (conn, mut rx) = test_connection("/device");
        conn.close();
        assert!(!conn.send_json(&json!({"x": 1})));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_writer_gone_is_silently_dropped() {
        let (conn, rx) = test_connection("/device");
        drop(rx);
        assert!(!conn.send_json(&json!({"x": 1})));
    }

    #[test]
    fn network_cache_loads_once_and_resets_on_login() {
        let (conn, _rx) = test_connection("/client");
        let first = conn.user_networks(|| HashSet::from([1, 2]));
        let second = conn.user_networks(|| HashSet::from([9]));
        assert_eq!(first, second);

        conn.set_session(SessionState::Unauthenticated);
        assert_eq!(conn.user_networks(|| HashSet::from([9])), HashSet::from([9]));
    }
}
