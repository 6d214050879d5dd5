//! Session and presence management for real-time multi-user editing.
//!
//! This module bridges the local room mirror and the collaboration channel:
//! it queues outgoing mutations (throttled), applies inbound ones, tracks who
//! is in the room, and mirrors advisory locks from remote select/deselect.

use std::collections::HashMap;

use crate::bus::{MessageBus, ThrottledQueue};
use crate::protocol::{apply_remote, LeaveReason, RoomMessage, UserData};
use crate::scene::{ObjectId, RoomScene, UserId};
use crate::walls::WallRegistry;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to fetch channel token: {0}")]
    TokenFetch(String),
    #[error("channel connect failed: {0}")]
    Connect(String),
}

/// Supplies the token presented when opening the collaboration channel.
///
/// A failure here is not fatal: the session degrades to local-only editing.
pub trait ChannelAuth {
    fn fetch_token(&self, room_id: &str) -> Result<String, SessionError>;
}

/// Auth for unauthenticated/self-hosted channels.
pub struct NoAuth;

impl ChannelAuth for NoAuth {
    fn fetch_token(&self, _room_id: &str) -> Result<String, SessionError> {
        Ok(String::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not collaborating; local edits only.
    Solo,
    Connecting,
    Connected,
    /// Channel could not be opened; editing continues locally.
    Unavailable,
    /// Kicked by the server; the client must leave the collaborative view.
    Evicted(LeaveReason),
    /// The owner ended the session for everyone.
    Ended,
}

/// Presence and lifecycle changes the host application reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerJoined { user_id: UserId, user_data: UserData },
    PeerLeft { user_id: UserId, reason: LeaveReason },
    /// Full room state applied; local editing may begin.
    SnapshotApplied,
    /// A remote mutation changed the scene or walls.
    SceneChanged,
    /// A peer grabbed an object; it is now lock-flagged locally.
    ObjectLocked { id: ObjectId, by: UserId },
    ObjectUnlocked { id: ObjectId },
    /// This client was kicked.
    Evicted { reason: LeaveReason },
    /// Owner-initiated graceful shutdown.
    SessionEnded { message: String },
}

/// Manages one user's participation in a collaborative room.
pub struct SessionManager {
    user_id: UserId,
    user_data: UserData,
    room_id: Option<String>,
    state: ConnectionState,
    /// Other participants currently in the room.
    roster: HashMap<UserId, UserData>,
    /// Which peer holds each advisory lock.
    locks: HashMap<ObjectId, UserId>,
    /// Local edits are refused until the join snapshot has been applied.
    snapshot_received: bool,
    outgoing: ThrottledQueue<RoomMessage>,
}

impl SessionManager {
    pub fn new(user_id: impl Into<UserId>, user_data: UserData) -> Self {
        Self {
            user_id: user_id.into(),
            user_data,
            room_id: None,
            state: ConnectionState::Solo,
            roster: HashMap::new(),
            locks: HashMap::new(),
            snapshot_received: false,
            outgoing: ThrottledQueue::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn roster(&self) -> &HashMap<UserId, UserData> {
        &self.roster
    }

    /// True once collaborating and the join snapshot has landed.
    pub fn can_edit(&self) -> bool {
        match self.state {
            ConnectionState::Solo | ConnectionState::Unavailable => true,
            ConnectionState::Connected => self.snapshot_received,
            _ => false,
        }
    }

    pub fn is_collaborating(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Start joining a room. Queues the join message followed by this user's
    /// `user-join` announcement; token failure degrades to
    /// [`ConnectionState::Unavailable`] without touching local editing.
    pub fn join_room(&mut self, room_id: &str, auth: &dyn ChannelAuth) -> Result<(), SessionError> {
        match auth.fetch_token(room_id) {
            Ok(_token) => {
                self.room_id = Some(room_id.to_string());
                self.state = ConnectionState::Connecting;
                self.snapshot_received = false;
                self.outgoing.publish(RoomMessage::JoinRoom {
                    room_id: room_id.to_string(),
                });
                self.outgoing.publish(RoomMessage::UserJoin {
                    user_id: self.user_id.clone(),
                    user_data: self.user_data.clone(),
                });
                Ok(())
            }
            Err(err) => {
                log::warn!("collaboration unavailable: {err}");
                self.state = ConnectionState::Unavailable;
                Err(err)
            }
        }
    }

    /// Channel reports the socket is open.
    pub fn connection_opened(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
        }
    }

    /// Channel dropped. Eviction and end states are sticky; anything else
    /// falls back to solo editing until a reconnect.
    pub fn connection_closed(&mut self) {
        match self.state {
            ConnectionState::Evicted(_) | ConnectionState::Ended => {}
            _ => {
                self.state = ConnectionState::Solo;
                self.roster.clear();
                self.locks.clear();
                self.snapshot_received = false;
            }
        }
    }

    /// Queue a locally produced mutation for broadcast.
    ///
    /// Dropped silently when not collaborating or before the snapshot, and
    /// rate-limited per entity for provisional updates.
    pub fn broadcast(&mut self, message: RoomMessage) -> bool {
        if !self.is_collaborating() || !self.snapshot_received {
            return false;
        }
        self.outgoing.publish(message)
    }

    /// Drain queued messages for the transport to send.
    pub fn take_outgoing(&mut self) -> Vec<RoomMessage> {
        self.outgoing.take_outgoing()
    }

    /// Feed one inbound channel message through the session.
    ///
    /// Scene/wall mutations are applied to the mirror (own-origin messages
    /// ignored); presence, locks, and lifecycle produce [`SessionEvent`]s.
    pub fn handle_message(
        &mut self,
        message: RoomMessage,
        scene: &mut RoomScene,
        walls: &mut WallRegistry,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        match &message {
            RoomMessage::UserJoin { user_id, user_data } => {
                if *user_id != self.user_id {
                    self.roster.insert(user_id.clone(), user_data.clone());
                    events.push(SessionEvent::PeerJoined {
                        user_id: user_id.clone(),
                        user_data: user_data.clone(),
                    });
                }
            }
            RoomMessage::UserLeft { user_id, reason } => {
                if *user_id == self.user_id {
                    if reason.is_eviction() {
                        self.state = ConnectionState::Evicted(*reason);
                        events.push(SessionEvent::Evicted { reason: *reason });
                    }
                } else {
                    self.roster.remove(user_id);
                    // A departed peer cannot keep its grabs.
                    let released: Vec<ObjectId> = self
                        .locks
                        .iter()
                        .filter(|(_, holder)| *holder == user_id)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in released {
                        self.locks.remove(&id);
                        scene.with_object(id, |object| object.locked = false);
                        events.push(SessionEvent::ObjectUnlocked { id });
                    }
                    events.push(SessionEvent::PeerLeft {
                        user_id: user_id.clone(),
                        reason: *reason,
                    });
                }
            }
            RoomMessage::InitialRoomState { roster, .. } => {
                self.roster = roster
                    .iter()
                    .filter(|entry| entry.user_id != self.user_id)
                    .map(|entry| (entry.user_id.clone(), entry.user_data.clone()))
                    .collect();
                self.locks.clear();
                apply_remote(&message, &self.user_id, scene, walls);
                self.snapshot_received = true;
                events.push(SessionEvent::SnapshotApplied);
            }
            RoomMessage::ModelSelect { user_id, model_id } => {
                if *user_id != self.user_id {
                    self.locks.insert(*model_id, user_id.clone());
                    scene.with_object(*model_id, |object| object.locked = true);
                    events.push(SessionEvent::ObjectLocked {
                        id: *model_id,
                        by: user_id.clone(),
                    });
                }
            }
            RoomMessage::ModelDeselect { user_id, model_id } => {
                if *user_id != self.user_id && self.locks.remove(model_id).is_some() {
                    scene.with_object(*model_id, |object| object.locked = false);
                    events.push(SessionEvent::ObjectUnlocked { id: *model_id });
                }
            }
            RoomMessage::CollaborationEnded { message, .. } => {
                self.state = ConnectionState::Ended;
                events.push(SessionEvent::SessionEnded {
                    message: message.clone(),
                });
            }
            _ => {
                if apply_remote(&message, &self.user_id, scene, walls) {
                    events.push(SessionEvent::SceneChanged);
                }
            }
        }
        events
    }

}

impl MessageBus<RoomMessage> for SessionManager {
    fn publish(&mut self, message: RoomMessage) -> bool {
        self.broadcast(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Dimensions, PlacedObject};
    use glam::DVec3;

    struct FailingAuth;

    impl ChannelAuth for FailingAuth {
        fn fetch_token(&self, _room_id: &str) -> Result<String, SessionError> {
            Err(SessionError::TokenFetch("503".into()))
        }
    }

    fn user(name: &str) -> UserData {
        UserData {
            name: name.into(),
            color: "#123456".into(),
        }
    }

    fn connected_session() -> (SessionManager, RoomScene, WallRegistry) {
        let mut session = SessionManager::new("me", user("Me"));
        session.join_room("room-1", &NoAuth).unwrap();
        session.connection_opened();
        let mut scene = RoomScene::new();
        let mut walls = WallRegistry::new();
        session.handle_message(
            RoomMessage::InitialRoomState {
                objects: vec![],
                walls: vec![],
                roster: vec![],
            },
            &mut scene,
            &mut walls,
        );
        (session, scene, walls)
    }

    #[test]
    fn test_token_failure_degrades_to_unavailable() {
        let mut session = SessionManager::new("me", user("Me"));
        assert!(session.join_room("room-1", &FailingAuth).is_err());
        assert_eq!(session.state(), ConnectionState::Unavailable);
        // Solo editing still possible.
        assert!(session.can_edit());
        assert!(session.take_outgoing().is_empty());
    }

    #[test]
    fn test_no_edits_before_snapshot() {
        let mut session = SessionManager::new("me", user("Me"));
        session.join_room("room-1", &NoAuth).unwrap();
        session.connection_opened();
        assert!(!session.can_edit());
        let dropped = session.broadcast(RoomMessage::ModelRemoved {
            user_id: "me".into(),
            model_id: ObjectId::new_v4(),
        });
        assert!(!dropped);

        let (session, _, _) = connected_session();
        assert!(session.can_edit());
    }

    #[test]
    fn test_join_queues_handshake() {
        let mut session = SessionManager::new("me", user("Me"));
        session.join_room("room-9", &NoAuth).unwrap();
        let outgoing = session.take_outgoing();
        assert_eq!(
            outgoing,
            vec![
                RoomMessage::JoinRoom {
                    room_id: "room-9".into()
                },
                RoomMessage::UserJoin {
                    user_id: "me".into(),
                    user_data: user("Me"),
                },
            ]
        );
    }

    #[test]
    fn test_roster_tracks_joins_and_leaves() {
        let (mut session, mut scene, mut walls) = connected_session();
        let events = session.handle_message(
            RoomMessage::UserJoin {
                user_id: "peer".into(),
                user_data: user("Peer"),
            },
            &mut scene,
            &mut walls,
        );
        assert_eq!(events.len(), 1);
        assert!(session.roster().contains_key("peer"));

        let events = session.handle_message(
            RoomMessage::UserLeft {
                user_id: "peer".into(),
                reason: LeaveReason::Normal,
            },
            &mut scene,
            &mut walls,
        );
        assert!(session.roster().is_empty());
        assert!(matches!(events.last(), Some(SessionEvent::PeerLeft { .. })));
    }

    #[test]
    fn test_remote_select_locks_object() {
        let (mut session, mut scene, mut walls) = connected_session();
        let object = PlacedObject::new("desk_01", DVec3::ZERO, Dimensions::new(1.2, 0.75, 0.6));
        let id = object.id;
        scene.insert(object);

        session.handle_message(
            RoomMessage::ModelSelect {
                user_id: "peer".into(),
                model_id: id,
            },
            &mut scene,
            &mut walls,
        );
        assert!(scene.object(id).unwrap().locked);

        session.handle_message(
            RoomMessage::ModelDeselect {
                user_id: "peer".into(),
                model_id: id,
            },
            &mut scene,
            &mut walls,
        );
        assert!(!scene.object(id).unwrap().locked);
    }

    #[test]
    fn test_departing_peer_releases_locks() {
        let (mut session, mut scene, mut walls) = connected_session();
        let object = PlacedObject::new("desk_01", DVec3::ZERO, Dimensions::new(1.2, 0.75, 0.6));
        let id = object.id;
        scene.insert(object);
        session.handle_message(
            RoomMessage::UserJoin {
                user_id: "peer".into(),
                user_data: user("Peer"),
            },
            &mut scene,
            &mut walls,
        );
        session.handle_message(
            RoomMessage::ModelSelect {
                user_id: "peer".into(),
                model_id: id,
            },
            &mut scene,
            &mut walls,
        );
        let events = session.handle_message(
            RoomMessage::UserLeft {
                user_id: "peer".into(),
                reason: LeaveReason::TimeOut,
            },
            &mut scene,
            &mut walls,
        );
        assert!(!scene.object(id).unwrap().locked);
        assert!(events.contains(&SessionEvent::ObjectUnlocked { id }));
    }

    #[test]
    fn test_own_select_does_not_lock() {
        let (mut session, mut scene, mut walls) = connected_session();
        let object = PlacedObject::new("desk_01", DVec3::ZERO, Dimensions::new(1.2, 0.75, 0.6));
        let id = object.id;
        scene.insert(object);
        let events = session.handle_message(
            RoomMessage::ModelSelect {
                user_id: "me".into(),
                model_id: id,
            },
            &mut scene,
            &mut walls,
        );
        assert!(events.is_empty());
        assert!(!scene.object(id).unwrap().locked);
    }

    #[test]
    fn test_eviction_reasons() {
        for reason in [LeaveReason::TimeOut, LeaveReason::DuplicateConnection] {
            let (mut session, mut scene, mut walls) = connected_session();
            let events = session.handle_message(
                RoomMessage::UserLeft {
                    user_id: "me".into(),
                    reason,
                },
                &mut scene,
                &mut walls,
            );
            assert_eq!(events, vec![SessionEvent::Evicted { reason }]);
            assert_eq!(session.state(), ConnectionState::Evicted(reason));
            assert!(!session.can_edit());
        }
    }

    #[test]
    fn test_collaboration_ended_is_graceful() {
        let (mut session, mut scene, mut walls) = connected_session();
        let events = session.handle_message(
            RoomMessage::CollaborationEnded {
                owner_id: "owner".into(),
                room_id: "room-1".into(),
                message: "Thanks for visiting".into(),
            },
            &mut scene,
            &mut walls,
        );
        assert_eq!(
            events,
            vec![SessionEvent::SessionEnded {
                message: "Thanks for visiting".into()
            }]
        );
        assert_eq!(session.state(), ConnectionState::Ended);
    }

    #[test]
    fn test_remote_mutation_reports_scene_changed() {
        let (mut session, mut scene, mut walls) = connected_session();
        let object = PlacedObject::new("desk_01", DVec3::ZERO, Dimensions::new(1.2, 0.75, 0.6));
        let events = session.handle_message(
            RoomMessage::ModelAdded {
                user_id: "peer".into(),
                model_data: object.clone(),
            },
            &mut scene,
            &mut walls,
        );
        assert_eq!(events, vec![SessionEvent::SceneChanged]);
        assert!(scene.objects.contains_key(&object.id));

        // The echo of our own broadcast is a no-op.
        let events = session.handle_message(
            RoomMessage::ModelRemoved {
                user_id: "me".into(),
                model_id: object.id,
            },
            &mut scene,
            &mut walls,
        );
        assert!(events.is_empty());
        assert!(scene.objects.contains_key(&object.id));
    }

    #[test]
    fn test_disconnect_clears_presence() {
        let (mut session, mut scene, mut walls) = connected_session();
        session.handle_message(
            RoomMessage::UserJoin {
                user_id: "peer".into(),
                user_data: user("Peer"),
            },
            &mut scene,
            &mut walls,
        );
        session.connection_closed();
        assert_eq!(session.state(), ConnectionState::Solo);
        assert!(session.roster().is_empty());
        assert!(session.can_edit());
    }
}
