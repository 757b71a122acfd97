//! # Realtime layer
//!
//! A JSON event relay over a websocket, replacing REST polling for presence,
//! chat and location sharing.
//!
//! - Rooms are named broadcast channels. Every socket subscribes to the
//!   global room and its own `user_{id}` room; `cart:join`/`cart:leave`
//!   client events attach and detach `cart_{id}` rooms.
//! - One forwarder task per subscribed room pushes into a per-socket mpsc
//!   queue, which a single writer task drains into the websocket.
//! - REST handlers publish into the same rooms, so a join processed over
//!   HTTP still reaches every connected cart member.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    auth::authenticate,
    database::{put_doc, user_key},
    error::AppError,
    models::{Location, User},
    state::AppState,
};

pub const GLOBAL_ROOM: &str = "global";

const ROOM_CAPACITY: usize = 64;

pub fn cart_room(cart_id: &str) -> String {
    format!("cart_{cart_id}")
}

pub fn user_room(user_id: &str) -> String {
    format!("user_{user_id}")
}

/// Named broadcast channels, created on first use.
#[derive(Default)]
pub struct Rooms {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Rooms {
    fn sender(&self, room: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap();

        channels
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, room: &str) -> broadcast::Receiver<String> {
        self.sender(room).subscribe()
    }

    /// Fire-and-forget; a room with no listeners just drops the event.
    pub fn publish(&self, room: &str, event: &ServerEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };

        #[cfg(feature = "verbose")]
        info!("Publishing to {room}: {payload}");

        let _ = self.sender(room).send(payload);
    }
}

/// Events pushed to clients, named as the frontend knows them.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "user:online", rename_all = "camelCase")]
    UserOnline { user_id: String, name: String },

    #[serde(rename = "user:offline", rename_all = "camelCase")]
    UserOffline {
        user_id: String,
        last_seen: DateTime<Utc>,
    },

    #[serde(rename = "cart:created")]
    CartCreated { cart: Value },

    #[serde(rename = "cart:member_joined")]
    CartMemberJoined { cart: Value, user: Value },

    #[serde(rename = "cart:member_left", rename_all = "camelCase")]
    CartMemberLeft { cart: Value, user_id: String },

    #[serde(rename = "cart:updated")]
    CartUpdated { cart: Value },

    #[serde(rename = "cart:deleted", rename_all = "camelCase")]
    CartDeleted { cart_id: String },

    #[serde(rename = "cart:user_joined", rename_all = "camelCase")]
    CartUserJoined {
        user_id: String,
        name: String,
        avatar: String,
    },

    #[serde(rename = "cart:user_left", rename_all = "camelCase")]
    CartUserLeft { user_id: String, name: String },

    #[serde(rename = "message:new")]
    MessageNew { message: Value },

    #[serde(rename = "message:edited")]
    MessageEdited { message: Value },

    #[serde(rename = "message:deleted", rename_all = "camelCase")]
    MessageDeleted { message_id: String },

    #[serde(rename = "message:typing", rename_all = "camelCase")]
    Typing {
        user_id: String,
        name: String,
        is_typing: bool,
    },

    #[serde(rename = "payment:completed", rename_all = "camelCase")]
    PaymentCompleted {
        user_id: String,
        all_paid: bool,
        order: Value,
    },

    #[serde(rename = "location:updated")]
    LocationUpdated { success: bool, location: Location },

    #[serde(rename = "location:error")]
    LocationError { success: bool, message: String },

    #[serde(rename = "location:request", rename_all = "camelCase")]
    LocationRequest {
        cart_id: String,
        requester_id: String,
    },

    #[serde(rename = "location:shared", rename_all = "camelCase")]
    LocationShared {
        user_id: String,
        name: String,
        location: Value,
    },

    #[serde(rename = "order:status_changed", rename_all = "camelCase")]
    OrderStatusChanged {
        status: String,
        updated_by: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "delivery:notification", rename_all = "camelCase")]
    DeliveryNotification {
        message: String,
        user_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

/// Events clients send. `cart:join`/`cart:leave` carry a bare cart id.
#[derive(Deserialize, Debug)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "cart:join")]
    CartJoin(String),

    #[serde(rename = "cart:leave")]
    CartLeave(String),

    #[serde(rename = "message:typing", rename_all = "camelCase")]
    Typing { cart_id: String, is_typing: bool },

    #[serde(rename = "location:update")]
    LocationUpdate(Location),

    #[serde(rename = "cart:request_locations", rename_all = "camelCase")]
    RequestLocations {
        cart_id: String,
        member_ids: Vec<String>,
    },

    #[serde(rename = "location:share", rename_all = "camelCase")]
    LocationShare { cart_id: String, location: Value },

    #[serde(rename = "order:status_update", rename_all = "camelCase")]
    OrderStatusUpdate { cart_id: String, status: String },

    #[serde(rename = "delivery:arrived", rename_all = "camelCase")]
    DeliveryArrived { cart_id: String },
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AppError> {
    let user = authenticate(&state, &query.token).await?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user: User) {
    info!("User connected: {} ({})", user.name, user.id);

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            if sink.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
    subscribe(&state, &out_tx, &mut subscriptions, GLOBAL_ROOM);
    subscribe(&state, &out_tx, &mut subscriptions, &user_room(&user.id));

    set_presence(&state, &user.id, true).await;
    state.rooms.publish(
        GLOBAL_ROOM,
        &ServerEvent::UserOnline {
            user_id: user.id.clone(),
            name: user.name.clone(),
        },
    );

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => dispatch(&state, &user, &out_tx, &mut subscriptions, event).await,
                Err(e) => send_self(
                    &out_tx,
                    &ServerEvent::Error {
                        message: format!("Unrecognized event: {e}"),
                    },
                ),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    info!("User disconnected: {}", user.name);

    for handle in subscriptions.into_values() {
        handle.abort();
    }
    writer.abort();

    set_presence(&state, &user.id, false).await;
    state.rooms.publish(
        GLOBAL_ROOM,
        &ServerEvent::UserOffline {
            user_id: user.id.clone(),
            last_seen: Utc::now(),
        },
    );
}

async fn dispatch(
    state: &Arc<AppState>,
    user: &User,
    out_tx: &mpsc::UnboundedSender<String>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::CartJoin(cart_id) => {
            let room = cart_room(&cart_id);

            // Publish first so the joiner does not see their own arrival
            state.rooms.publish(
                &room,
                &ServerEvent::CartUserJoined {
                    user_id: user.id.clone(),
                    name: user.name.clone(),
                    avatar: user.avatar.clone(),
                },
            );
            subscribe(state, out_tx, subscriptions, &room);
        }
        ClientEvent::CartLeave(cart_id) => {
            let room = cart_room(&cart_id);

            if let Some(handle) = subscriptions.remove(&room) {
                handle.abort();
            }
            state.rooms.publish(
                &room,
                &ServerEvent::CartUserLeft {
                    user_id: user.id.clone(),
                    name: user.name.clone(),
                },
            );
        }
        ClientEvent::Typing { cart_id, is_typing } => {
            state.rooms.publish(
                &cart_room(&cart_id),
                &ServerEvent::Typing {
                    user_id: user.id.clone(),
                    name: user.name.clone(),
                    is_typing,
                },
            );
        }
        ClientEvent::LocationUpdate(location) => {
            let response = match persist_location(state, &user.id, location.clone()).await {
                Ok(()) => ServerEvent::LocationUpdated {
                    success: true,
                    location,
                },
                Err(e) => ServerEvent::LocationError {
                    success: false,
                    message: e.to_string(),
                },
            };

            send_self(out_tx, &response);
        }
        ClientEvent::RequestLocations {
            cart_id,
            member_ids,
        } => {
            for member_id in member_ids {
                state.rooms.publish(
                    &user_room(&member_id),
                    &ServerEvent::LocationRequest {
                        cart_id: cart_id.clone(),
                        requester_id: user.id.clone(),
                    },
                );
            }
        }
        ClientEvent::LocationShare { cart_id, location } => {
            state.rooms.publish(
                &cart_room(&cart_id),
                &ServerEvent::LocationShared {
                    user_id: user.id.clone(),
                    name: user.name.clone(),
                    location,
                },
            );
        }
        ClientEvent::OrderStatusUpdate { cart_id, status } => {
            state.rooms.publish(
                &cart_room(&cart_id),
                &ServerEvent::OrderStatusChanged {
                    status,
                    updated_by: user.name.clone(),
                    timestamp: Utc::now(),
                },
            );
        }
        ClientEvent::DeliveryArrived { cart_id } => {
            state.rooms.publish(
                &cart_room(&cart_id),
                &ServerEvent::DeliveryNotification {
                    message: "Delivery has arrived!".to_string(),
                    user_id: user.id.clone(),
                    name: user.name.clone(),
                    timestamp: Utc::now(),
                },
            );
        }
    }
}

fn subscribe(
    state: &Arc<AppState>,
    out_tx: &mpsc::UnboundedSender<String>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    room: &str,
) {
    if subscriptions.contains_key(room) {
        return;
    }

    let mut rx = state.rooms.subscribe(room);
    let out_tx = out_tx.clone();

    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    if out_tx.send(payload).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });

    subscriptions.insert(room.to_string(), handle);
}

fn send_self(out_tx: &mpsc::UnboundedSender<String>, event: &ServerEvent) {
    if let Ok(payload) = serde_json::to_string(event) {
        let _ = out_tx.send(payload);
    }
}

async fn persist_location(
    state: &Arc<AppState>,
    user_id: &str,
    location: Location,
) -> Result<(), AppError> {
    let mut conn = state.redis.clone();
    let mut user = crate::database::require_user(&mut conn, user_id).await?;

    user.location = location;
    put_doc(&mut conn, &user_key(user_id), &user).await
}

async fn set_presence(state: &Arc<AppState>, user_id: &str, online: bool) {
    let mut conn = state.redis.clone();

    match crate::database::fetch_user(&mut conn, user_id).await {
        Ok(Some(mut user)) => {
            user.is_active = online;
            user.last_seen = Utc::now();

            if let Err(e) = put_doc(&mut conn, &user_key(user_id), &user).await {
                warn!("Failed to persist presence for {user_id}: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Failed to load user {user_id} for presence: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_event_wire_format() {
        let event = ServerEvent::CartUserJoined {
            user_id: "u1".to_string(),
            name: "Asha".to_string(),
            avatar: "a.png".to_string(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "cart:user_joined");
        assert_eq!(value["data"]["userId"], "u1");
    }

    #[test]
    fn test_client_event_bare_cart_id() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"cart:join","data":"c42"}"#).unwrap();

        match event {
            ClientEvent::CartJoin(id) => assert_eq!(id, "c42"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_client_typing_event() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"message:typing","data":{"cartId":"c42","isTyping":true}}"#,
        )
        .unwrap();

        match event {
            ClientEvent::Typing { cart_id, is_typing } => {
                assert_eq!(cart_id, "c42");
                assert!(is_typing);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_rooms_broadcast() {
        let rooms = Rooms::default();
        let mut rx = rooms.subscribe("cart_1");

        rooms.publish(
            "cart_1",
            &ServerEvent::CartDeleted {
                cart_id: "1".to_string(),
            },
        );

        let payload = rx.try_recv().unwrap();
        assert!(payload.contains("cart:deleted"));
    }

    #[test]
    fn test_publish_without_listeners_is_noop() {
        let rooms = Rooms::default();

        rooms.publish(
            "cart_empty",
            &ServerEvent::CartDeleted {
                cart_id: "1".to_string(),
            },
        );
    }
}
