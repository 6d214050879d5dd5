//! RoomLab WebSocket relay server.
//!
//! Relays room mutations between clients editing the same room and keeps a
//! retained, last-writer-wins copy of each room's state so late joiners get
//! a full `initial-room-state` snapshot instead of an empty room.
//!
//! Clients identify themselves via query parameters on the upgrade request
//! (`/ws?userId=..&name=..&color=..`) and then send `join-room` followed by
//! their own `user-join` announcement, which is relayed to peers. A second
//! connection for the same user evicts the first (`duplicate-connection`);
//! a silent connection is dropped after the idle timeout (`time-out`); the
//! room owner (first user in) may end the session for everyone.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use roomlab_core::protocol::{apply_remote, LeaveReason, RoomMessage, RosterEntry, UserData};
use roomlab_core::scene::RoomScene;
use roomlab_core::walls::WallRegistry;

const CHANNEL_CAPACITY: usize = 256;
/// Connections with no inbound traffic for this long are kicked.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Per-connection identity from the upgrade request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_color")]
    color: String,
}

fn default_name() -> String {
    "Guest".to_string()
}

fn default_color() -> String {
    "#9e9e9e".to_string()
}

/// Events fanned out to the connection tasks of one room.
#[derive(Debug, Clone)]
enum RoomEvent {
    /// Relay a message to every connection except the origin.
    Relay { from_conn: u64, message: RoomMessage },
    /// Kick one specific connection.
    Evict { conn: u64, reason: LeaveReason },
    /// Owner ended the session; deliver to everyone and close.
    Shutdown { message: RoomMessage },
}

/// Retained state of one active room.
struct Room {
    tx: broadcast::Sender<RoomEvent>,
    /// userId -> display info, for snapshot rosters.
    roster: HashMap<String, UserData>,
    /// userId -> currently live connection.
    conns: HashMap<String, u64>,
    /// First user in; the only one allowed to end the session.
    owner: Option<String>,
    scene: RoomScene,
    walls: WallRegistry,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            roster: HashMap::new(),
            conns: HashMap::new(),
            owner: None,
            scene: RoomScene::new(),
            walls: WallRegistry::new(),
        }
    }

    fn snapshot(&self) -> RoomMessage {
        RoomMessage::InitialRoomState {
            objects: self.scene.objects.values().cloned().collect(),
            walls: self.walls.walls().to_vec(),
            roster: self
                .roster
                .iter()
                .map(|(user_id, user_data)| RosterEntry {
                    user_id: user_id.clone(),
                    user_data: user_data.clone(),
                })
                .collect(),
        }
    }
}

struct JoinOutcome {
    rx: broadcast::Receiver<RoomEvent>,
    snapshot: RoomMessage,
    is_owner: bool,
}

/// Shared application state.
struct AppState {
    rooms: DashMap<String, Room>,
    next_conn: AtomicU64,
}

impl AppState {
    fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            next_conn: AtomicU64::new(1),
        }
    }

    fn new_conn_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a user's connection, evicting any previous connection for
    /// the same user, and return the join snapshot.
    fn join_room(
        &self,
        room_id: &str,
        user_id: &str,
        user_data: UserData,
        conn: u64,
    ) -> JoinOutcome {
        let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        if let Some(old_conn) = room.conns.insert(user_id.to_string(), conn) {
            info!("evicting stale connection {old_conn} of user {user_id}");
            let _ = room.tx.send(RoomEvent::Evict {
                conn: old_conn,
                reason: LeaveReason::DuplicateConnection,
            });
        }
        room.roster.insert(user_id.to_string(), user_data);
        if room.owner.is_none() {
            room.owner = Some(user_id.to_string());
        }
        JoinOutcome {
            rx: room.tx.subscribe(),
            snapshot: room.snapshot(),
            is_owner: room.owner.as_deref() == Some(user_id),
        }
    }

    /// Drop a user's registration if `conn` is still its live connection.
    /// Returns true when the user actually left (and peers should be told).
    fn leave_room(&self, room_id: &str, user_id: &str, conn: u64) -> bool {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if room.conns.get(user_id) != Some(&conn) {
            // A newer connection took over; nothing to clean up.
            return false;
        }
        room.conns.remove(user_id);
        room.roster.remove(user_id);
        let empty = room.conns.is_empty();
        drop(room);
        if empty {
            self.rooms.remove(room_id);
            info!("room {room_id} is empty, dropping retained state");
        }
        true
    }

    /// Fold a mutation into the room's retained state, last writer wins.
    fn apply(&self, room_id: &str, message: &RoomMessage) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            let room = &mut *room;
            apply_remote(message, "", &mut room.scene, &mut room.walls);
        }
    }

    fn relay(&self, room_id: &str, from_conn: u64, message: RoomMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            let _ = room.tx.send(RoomEvent::Relay { from_conn, message });
        }
    }

    /// Owner-initiated teardown. Returns false when the caller is not the
    /// room's owner.
    fn end_collaboration(&self, room_id: &str, user_id: &str, message: RoomMessage) -> bool {
        {
            let Some(room) = self.rooms.get(room_id) else {
                return false;
            };
            if room.owner.as_deref() != Some(user_id) {
                return false;
            }
            let _ = room.tx.send(RoomEvent::Shutdown { message });
        }
        self.rooms.remove(room_id);
        true
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomlab_server=info,tower_http=info".into()),
        )
        .init();

    let state = Arc::new(AppState::new());

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 3030));
    info!("RoomLab relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://localhost:3030/ws");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn index() -> &'static str {
    "RoomLab Relay Server - Connect via WebSocket at /ws"
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: ConnectParams, state: Arc<AppState>) {
    let user_id = params.user_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_data = UserData {
        name: params.name,
        color: params.color,
    };
    let conn = state.new_conn_id();
    info!("new connection {conn} for user {user_id}");

    let (mut sender, mut receiver) = socket.split();
    let mut current_room: Option<String> = None;
    let mut room_rx: Option<broadcast::Receiver<RoomEvent>> = None;
    let mut announce_leave = true;

    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => {
                info!("connection {conn} idle for too long, evicting user {user_id}");
                if let Some(ref room) = current_room {
                    if state.leave_room(room, &user_id, conn) {
                        state.relay(room, conn, RoomMessage::UserLeft {
                            user_id: user_id.clone(),
                            reason: LeaveReason::TimeOut,
                        });
                    }
                }
                let notice = RoomMessage::UserLeft {
                    user_id: user_id.clone(),
                    reason: LeaveReason::TimeOut,
                };
                let _ = send_message(&mut sender, &notice).await;
                announce_leave = false;
                break;
            }

            msg = receiver.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = match serde_json::from_str::<RoomMessage>(&text) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                warn!("invalid message from {user_id}: {e}");
                                continue;
                            }
                        };
                        match parsed {
                            RoomMessage::JoinRoom { room_id } => {
                                if let Some(ref old_room) = current_room {
                                    if state.leave_room(old_room, &user_id, conn) {
                                        state.relay(old_room, conn, RoomMessage::UserLeft {
                                            user_id: user_id.clone(),
                                            reason: LeaveReason::Normal,
                                        });
                                    }
                                }

                                let outcome =
                                    state.join_room(&room_id, &user_id, user_data.clone(), conn);
                                room_rx = Some(outcome.rx);

                                if send_message(&mut sender, &outcome.snapshot).await.is_err() {
                                    break;
                                }
                                if outcome.is_owner {
                                    info!("user {user_id} owns room {room_id}");
                                } else {
                                    info!("user {user_id} joined room {room_id}");
                                }
                                current_room = Some(room_id);
                            }
                            RoomMessage::CollaborationEnded { message, .. } => {
                                let Some(ref room) = current_room else { continue };
                                let notice = RoomMessage::CollaborationEnded {
                                    owner_id: user_id.clone(),
                                    room_id: room.clone(),
                                    message,
                                };
                                if state.end_collaboration(room, &user_id, notice) {
                                    info!("owner {user_id} ended collaboration in {room}");
                                } else {
                                    warn!("non-owner {user_id} tried to end collaboration");
                                }
                            }
                            mutation => {
                                let Some(ref room) = current_room else {
                                    warn!("message from {user_id} before join-room");
                                    continue;
                                };
                                if server_only(&mutation) {
                                    warn!("server-only message from {user_id}, dropping");
                                    continue;
                                }
                                // The origin id is authoritative for echo
                                // suppression; refuse spoofed ones.
                                if mutation.origin().is_some_and(|origin| origin != user_id) {
                                    warn!("origin mismatch from {user_id}, dropping");
                                    continue;
                                }
                                state.apply(room, &mutation);
                                state.relay(room, conn, mutation);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ignore binary, ping, pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {user_id}: {e}");
                        break;
                    }
                }
            }

            event = async {
                match &mut room_rx {
                    Some(rx) => rx.recv().await.ok(),
                    None => std::future::pending::<Option<RoomEvent>>().await,
                }
            } => {
                let Some(event) = event else {
                    // Lagged or channel closed; force a resync by dropping.
                    warn!("broadcast stream lost for {user_id}");
                    break;
                };
                match event {
                    RoomEvent::Relay { from_conn, message } => {
                        if from_conn != conn
                            && send_message(&mut sender, &message).await.is_err()
                        {
                            break;
                        }
                    }
                    RoomEvent::Evict { conn: target, reason } => {
                        if target == conn {
                            let notice = RoomMessage::UserLeft {
                                user_id: user_id.clone(),
                                reason,
                            };
                            let _ = send_message(&mut sender, &notice).await;
                            // The replacement connection owns the roster
                            // entry now; leave silently.
                            announce_leave = false;
                            break;
                        }
                    }
                    RoomEvent::Shutdown { message } => {
                        let _ = send_message(&mut sender, &message).await;
                        announce_leave = false;
                        break;
                    }
                }
            }
        }
    }

    if announce_leave {
        if let Some(ref room) = current_room {
            if state.leave_room(room, &user_id, conn) {
                state.relay(room, conn, RoomMessage::UserLeft {
                    user_id: user_id.clone(),
                    reason: LeaveReason::Normal,
                });
            }
        }
    }
    info!("connection {conn} closed for user {user_id}");
}

/// Messages only the server may emit. Inbound copies would overwrite the
/// retained room state or fake departures, so they are dropped.
fn server_only(message: &RoomMessage) -> bool {
    matches!(
        message,
        RoomMessage::InitialRoomState { .. } | RoomMessage::UserLeft { .. }
    )
}

async fn send_message(
    sender: &mut (impl SinkExt<Message> + Unpin),
    message: &RoomMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(message).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use roomlab_core::scene::{Dimensions, PlacedObject};

    fn user(name: &str) -> UserData {
        UserData {
            name: name.into(),
            color: "#336699".into(),
        }
    }

    #[test]
    fn test_first_join_owns_the_room() {
        let state = AppState::new();
        let outcome = state.join_room("r", "alice", user("Alice"), 1);
        assert!(outcome.is_owner);
        let outcome = state.join_room("r", "bob", user("Bob"), 2);
        assert!(!outcome.is_owner);
    }

    #[test]
    fn test_duplicate_user_evicts_old_connection() {
        let state = AppState::new();
        let first = state.join_room("r", "alice", user("Alice"), 1);
        let mut rx = first.rx;
        state.join_room("r", "alice", user("Alice"), 2);
        match rx.try_recv() {
            Ok(RoomEvent::Evict { conn, reason }) => {
                assert_eq!(conn, 1);
                assert_eq!(reason, LeaveReason::DuplicateConnection);
            }
            other => panic!("expected eviction, got {other:?}"),
        }
        // The stale connection must not tear down the new registration.
        assert!(!state.leave_room("r", "alice", 1));
        assert!(state.rooms.contains_key("r"));
    }

    #[test]
    fn test_retained_state_feeds_snapshot() {
        let state = AppState::new();
        state.join_room("r", "alice", user("Alice"), 1);

        let object = PlacedObject::new("bed_02", DVec3::ZERO, Dimensions::new(2.0, 0.5, 1.6));
        state.apply(
            "r",
            &RoomMessage::ModelAdded {
                user_id: "alice".into(),
                model_data: object.clone(),
            },
        );
        state.apply(
            "r",
            &RoomMessage::ModelMoved {
                user_id: "alice".into(),
                model_id: object.id,
                position: DVec3::new(1.0, 0.0, 1.0),
                is_final: true,
            },
        );

        let outcome = state.join_room("r", "bob", user("Bob"), 2);
        match outcome.snapshot {
            RoomMessage::InitialRoomState { objects, roster, .. } => {
                assert_eq!(objects.len(), 1);
                assert_eq!(objects[0].position, DVec3::new(1.0, 0.0, 1.0));
                assert_eq!(roster.len(), 2);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_room_is_dropped() {
        let state = AppState::new();
        state.join_room("r", "alice", user("Alice"), 1);
        assert!(state.leave_room("r", "alice", 1));
        assert!(!state.rooms.contains_key("r"));
    }

    #[test]
    fn test_client_cannot_inject_server_messages() {
        let snapshot = RoomMessage::InitialRoomState {
            objects: vec![],
            walls: vec![],
            roster: vec![],
        };
        assert!(server_only(&snapshot));
        assert!(server_only(&RoomMessage::UserLeft {
            user_id: "alice".into(),
            reason: LeaveReason::Normal,
        }));
        // Ordinary mutations and announcements still pass.
        assert!(!server_only(&RoomMessage::UserJoin {
            user_id: "alice".into(),
            user_data: user("Alice"),
        }));
        assert!(!server_only(&RoomMessage::ModelRemoved {
            user_id: "alice".into(),
            model_id: Uuid::new_v4(),
        }));
    }

    #[test]
    fn test_only_owner_ends_collaboration() {
        let state = AppState::new();
        state.join_room("r", "alice", user("Alice"), 1);
        state.join_room("r", "bob", user("Bob"), 2);
        let ended = RoomMessage::CollaborationEnded {
            owner_id: "bob".into(),
            room_id: "r".into(),
            message: "bye".into(),
        };
        assert!(!state.end_collaboration("r", "bob", ended.clone()));
        assert!(state.rooms.contains_key("r"));
        assert!(state.end_collaboration("r", "alice", ended));
        assert!(!state.rooms.contains_key("r"));
    }
}
