//! WebSocket front end: one task pair per socket, requests handled in
//! arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router as HttpRouter;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use hive_protocol::MAX_REQUEST_BYTES;
use tokio::sync::mpsc;

use crate::hub::Hub;
use crate::session::Connection;

const OUTBOUND_QUEUE: usize = 256;

/// Every path is served by the fallback so the hub's router decides.
pub fn app(hub: Arc<Hub>) -> HttpRouter {
    HttpRouter::new().fallback(upgrade).with_state(hub)
}

async fn upgrade(
    State(hub): State<Arc<Hub>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let path = uri.path().to_string();
    if hub.router.resolve(&path).is_none() {
        tracing::debug!(%peer, path, "rejecting socket for unknown path");
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.max_message_size(MAX_REQUEST_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, hub, path, peer))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, path: String, peer: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let connection = Arc::new(Connection::new(path, Some(peer.ip()), tx));
    if !hub.router.handle_new_connection(&connection) {
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    let closed = connection.closed().clone();
    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if sender.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = closed.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(connection = %connection.id(), "socket read error: {e}");
                break;
            }
        };
        match frame {
            Message::Text(text) => hub.router.route_request(&connection, text.as_str()).await,
            Message::Ping(_) => hub.router.handle_ping(&connection).await,
            Message::Close(_) => break,
            _ => {}
        }
        if connection.is_closed() {
            break;
        }
    }

    hub.router.cleanup_connection(connection.id());
    let _ = write_task.await;
}
