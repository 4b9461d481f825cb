use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use crate::AppState;
use crate::automation::ChangeEvent;
use crate::error::AppError;
use crate::tenant::{TENANT_HEADER, USER_HEADER};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl WsMessage {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// `Lead.assigned`, `WorkflowExecution.failed`, ...
    pub fn from_event(event: &ChangeEvent) -> Self {
        Self {
            event_type: format!("{}.{}", event.entity_type, event.action),
            payload: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            timestamp: event.occurred_at,
        }
    }

    fn to_text(&self) -> Option<Message> {
        serde_json::to_string(self).ok().map(Message::Text)
    }
}

#[derive(Debug, Clone)]
pub struct WsConnection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

/// Registry of open sockets; events themselves arrive through the broadcast notifier.
#[derive(Default)]
pub struct WsManager {
    connections: Arc<RwLock<HashMap<Uuid, WsConnection>>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_connection(&self, conn: WsConnection) {
        let mut connections = self.connections.write().await;
        connections.insert(conn.id, conn);
    }

    pub async fn remove_connection(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        connections.remove(id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn tenant_connection_count(&self, tenant_id: Uuid) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .count()
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
}

/// Browsers cannot set headers on a websocket handshake, so the query string is accepted too.
pub fn resolve_subscriber(headers: &HeaderMap, query: &WsQuery) -> Option<(Uuid, Option<Uuid>)> {
    let tenant_id = header_uuid(headers, TENANT_HEADER).or(query.tenant_id)?;
    let user_id = header_uuid(headers, USER_HEADER).or(query.user_id);
    Some((tenant_id, user_id))
}

pub async fn websocket_handler(
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some((tenant_id, user_id)) = resolve_subscriber(&headers, &query) else {
        return AppError::MissingTenant.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, tenant_id, user_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, tenant_id: Uuid, user_id: Option<Uuid>) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();
    let mut events = state.notifier.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::channel::<WsMessage>(16);

    state
        .ws_manager
        .add_connection(WsConnection {
            id: connection_id,
            tenant_id,
            user_id,
            connected_at: chrono::Utc::now(),
        })
        .await;

    tracing::debug!(connection_id = %connection_id, tenant_id = %tenant_id, "Websocket connected");

    let connected = WsMessage::new(
        "connected",
        serde_json::json!({ "connection_id": connection_id, "tenant_id": tenant_id }),
    );
    if let Some(msg) = connected.to_text() {
        let _ = sender.send(msg).await;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            let outgoing = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) if event.tenant_id == tenant_id => WsMessage::from_event(&event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(connection_id = %connection_id, skipped, "Websocket subscriber lagging");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };

            let Some(msg) = outgoing.to_text() else { continue };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Ok(ws_msg) = serde_json::from_str::<WsMessage>(&text) {
                        if let Some(reply) = handle_client_message(connection_id, ws_msg) {
                            if reply_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    state.ws_manager.remove_connection(&connection_id).await;
    tracing::debug!(connection_id = %connection_id, "Websocket disconnected");
}

fn handle_client_message(connection_id: Uuid, message: WsMessage) -> Option<WsMessage> {
    match message.event_type.as_str() {
        "ping" => Some(WsMessage::new("pong", serde_json::json!({}))),
        other => {
            tracing::warn!(connection_id = %connection_id, event_type = other, "Unknown websocket message type");
            None
        }
    }
}
