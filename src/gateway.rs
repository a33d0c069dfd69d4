//! Argus Realtime Gateway - Authenticated sockets, rooms, event fan-out
//!
//! Channels authenticate at the WebSocket handshake (bearer token in the
//! `Authorization` header or a `token` query parameter). Team rooms are
//! backed by per-room broadcast channels so fan-out costs O(members) and a
//! slow subscriber only loses its own oldest events.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::{ClientEvent, ServerEvent};
use crate::sync::Broadcaster;
use crate::vault::AuthClaims;
use crate::ArgusServer;

/// Buffered events per room before the oldest are dropped for laggards.
const ROOM_CHANNEL_CAPACITY: usize = 256;
/// Per-connection outbound queue between forwarders and the socket writer.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room: String,
    pub members: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub rooms: Vec<RoomStats>,
}

/// Room membership registry and the admin broadcast channel. The internal
/// lock guards only the membership map; broadcasting never holds it.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, broadcast::Sender<ServerEvent>>>,
    admin_tx: broadcast::Sender<ServerEvent>,
    total_connections: AtomicUsize,
    authenticated_connections: AtomicUsize,
    capacity: usize,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::with_capacity(ROOM_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (admin_tx, _) = broadcast::channel(capacity);
        Self {
            rooms: RwLock::new(HashMap::new()),
            admin_tx,
            total_connections: AtomicUsize::new(0),
            authenticated_connections: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Subscribe a channel to `team:{team_id}`.
    pub async fn join(&self, team_id: Uuid) -> broadcast::Receiver<ServerEvent> {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(team_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop the room channel once the last subscriber has left.
    pub async fn prune(&self, team_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(sender) = rooms.get(&team_id) {
            if sender.receiver_count() == 0 {
                rooms.remove(&team_id);
            }
        }
    }

    pub fn subscribe_admin(&self) -> broadcast::Receiver<ServerEvent> {
        self.admin_tx.subscribe()
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.authenticated_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.total_connections.fetch_sub(1, Ordering::Relaxed);
        self.authenticated_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> SocketStats {
        let rooms = self.rooms.read().await;
        let mut room_stats: Vec<RoomStats> = rooms
            .iter()
            .map(|(team_id, sender)| RoomStats {
                room: format!("team:{team_id}"),
                members: sender.receiver_count(),
            })
            .collect();
        room_stats.sort_by(|a, b| a.room.cmp(&b.room));

        SocketStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            authenticated_connections: self.authenticated_connections.load(Ordering::Relaxed),
            rooms: room_stats,
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broadcaster for RoomRegistry {
    async fn broadcast_to_team(&self, team_id: Uuid, event: ServerEvent) {
        let sender = {
            let rooms = self.rooms.read().await;
            rooms.get(&team_id).cloned()
        };
        if let Some(sender) = sender {
            // No receivers is fine; the room simply has no subscribers.
            match sender.send(event) {
                Ok(receivers) => {
                    debug!(team_id = %team_id, receivers, "Broadcast to room");
                }
                Err(err) => {
                    debug!(team_id = %team_id, event = err.0.event_name(), "Room has no subscribers");
                }
            }
        }
    }

    async fn broadcast_to_admins(&self, event: ServerEvent) {
        let event_name = event.event_name();
        match self.admin_tx.send(event) {
            Ok(receivers) => debug!(event = event_name, receivers, "Broadcast to admins"),
            Err(_) => debug!(event = event_name, "No admin subscribers"),
        }
    }
}

/// WebSocket upgrade endpoint. Tokenless or invalid handshakes terminate
/// before the upgrade completes.
pub async fn ws_handler(
    State(server): State<Arc<ArgusServer>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let token = bearer_token(&headers).or_else(|| params.get("token").cloned());
    let Some(token) = token else {
        return ApiError::Unauthenticated.into_response();
    };
    let claims = match server.vault.verify(&token).await {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };

    info!(user_id = %claims.user_id, is_admin = claims.is_admin, "Socket handshake accepted");
    ws.on_upgrade(move |socket| handle_socket(server, socket, claims))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|value| value.to_string())
}

async fn handle_socket(server: Arc<ArgusServer>, socket: WebSocket, claims: AuthClaims) {
    server.registry.connection_opened();

    let (sender, mut receiver) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_CAPACITY);

    let writer = tokio::spawn(write_outbound(sender, out_rx));

    let _ = out_tx
        .send(ServerEvent::Hello {
            user_id: claims.user_id,
            is_admin: claims.is_admin,
        })
        .await;

    // Admin channels also receive the administrative broadcast stream.
    let mut admin_forwarder = None;
    if claims.is_admin {
        let rx = server.registry.subscribe_admin();
        admin_forwarder = Some(tokio::spawn(forward_events(
            rx,
            out_tx.clone(),
            claims.user_id,
            "admin",
        )));
    }

    let mut room_forwarders: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    while let Some(message) = receiver.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(_) => {
                        let _ = out_tx
                            .send(ServerEvent::Error {
                                message: "malformed event".to_string(),
                            })
                            .await;
                        continue;
                    }
                };
                handle_client_event(&server, &claims, event, &out_tx, &mut room_forwarders).await;
            }
            Ok(WsMessage::Close(_)) => {
                debug!(user_id = %claims.user_id, "Client sent close frame");
                break;
            }
            Ok(_) => {} // ping/pong/binary
            Err(err) => {
                warn!(user_id = %claims.user_id, error = %err, "Socket receive error");
                break;
            }
        }
    }

    // Best-effort teardown: no further events are delivered.
    for (team_id, handle) in room_forwarders {
        handle.abort();
        server.registry.prune(team_id).await;
    }
    if let Some(handle) = admin_forwarder {
        handle.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    server.registry.connection_closed();
    info!(user_id = %claims.user_id, "Socket disconnected");
}

async fn handle_client_event(
    server: &Arc<ArgusServer>,
    claims: &AuthClaims,
    event: ClientEvent,
    out_tx: &mpsc::Sender<ServerEvent>,
    room_forwarders: &mut HashMap<Uuid, JoinHandle<()>>,
) {
    match event {
        ClientEvent::TeamJoin { team_id } => {
            match server.sync.assert_membership(claims.user_id, team_id).await {
                Ok(()) => {
                    if !room_forwarders.contains_key(&team_id) {
                        let rx = server.registry.join(team_id).await;
                        let handle =
                            tokio::spawn(forward_events(rx, out_tx.clone(), claims.user_id, "room"));
                        room_forwarders.insert(team_id, handle);
                    }
                    let _ = out_tx.send(ServerEvent::TeamJoined { team_id }).await;
                }
                Err(err) => {
                    let _ = out_tx
                        .send(ServerEvent::Error {
                            message: err.public_message(),
                        })
                        .await;
                }
            }
        }
        ClientEvent::TeamLeave { team_id } => {
            if let Some(handle) = room_forwarders.remove(&team_id) {
                handle.abort();
                server.registry.prune(team_id).await;
            }
            let _ = out_tx.send(ServerEvent::TeamLeft { team_id }).await;
        }
        ClientEvent::LocationUpdate(payload) => {
            if let Err(err) = server.sync.submit_location(claims.user_id, payload).await {
                let _ = out_tx
                    .send(ServerEvent::Error {
                        message: err.public_message(),
                    })
                    .await;
            }
        }
        ClientEvent::AnnotationUpdate(payload) => {
            if let Err(err) = server.sync.submit_annotation(claims.user_id, payload).await {
                let _ = out_tx
                    .send(ServerEvent::Error {
                        message: err.public_message(),
                    })
                    .await;
            }
        }
        ClientEvent::MessageSend(payload) => {
            if let Err(err) = server.sync.submit_message(claims.user_id, payload).await {
                let _ = out_tx
                    .send(ServerEvent::Error {
                        message: err.public_message(),
                    })
                    .await;
            }
        }
    }
}

/// Pump one broadcast subscription into the connection's outbound queue.
/// Backpressure stalls this forwarder only; the broadcast buffer then drops
/// this subscriber's oldest events and reports how many were lost.
async fn forward_events(
    mut rx: broadcast::Receiver<ServerEvent>,
    out_tx: mpsc::Sender<ServerEvent>,
    user_id: Uuid,
    channel: &'static str,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                warn!(user_id = %user_id, channel, dropped, "Slow channel dropped events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_outbound(
    mut sender: SplitSink<WebSocket, WsMessage>,
    mut out_rx: mpsc::Receiver<ServerEvent>,
) {
    while let Some(event) = out_rx.recv().await {
        let Ok(json) = serde_json::to_string(&event) else {
            continue;
        };
        if sender.send(WsMessage::Text(json)).await.is_err() {
            break;
        }
    }
}
