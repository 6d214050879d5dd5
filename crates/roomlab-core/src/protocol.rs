//! Wire messages for the collaboration channel.
//!
//! Every message is a JSON object with a kebab-case `type` tag and camelCase
//! fields. Mutation messages carry the originating `userId`; a client applies
//! a remote mutation only when that id differs from its own, which makes the
//! relay free to echo messages back without loops.

use crate::bus::{Finality, Throttleable, ThrottleKey};
use crate::scene::{ObjectId, PlacedObject, RoomScene, UserId, Wall, WallId};
use crate::walls::{WallRegistry, WallUpdate};
use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Display info a user presents to the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: UserId,
    pub user_data: UserData,
}

/// Why a user left the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// Voluntary disconnect.
    Normal,
    /// Server idle timeout.
    TimeOut,
    /// A newer connection for the same user replaced this one.
    DuplicateConnection,
    /// The owner ended the session for everyone.
    CollaborationEnded,
}

impl LeaveReason {
    /// Evictions force the client out of the collaborative view.
    pub fn is_eviction(self) -> bool {
        matches!(self, Self::TimeOut | Self::DuplicateConnection)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RoomMessage {
    JoinRoom {
        room_id: String,
    },
    UserJoin {
        user_id: UserId,
        user_data: UserData,
    },
    UserLeft {
        user_id: UserId,
        reason: LeaveReason,
    },
    /// Full authoritative state, sent to a client right after joining.
    InitialRoomState {
        objects: Vec<PlacedObject>,
        walls: Vec<Wall>,
        roster: Vec<RosterEntry>,
    },
    ModelAdded {
        user_id: UserId,
        model_data: PlacedObject,
    },
    /// Add with a client-assigned id, so the sender's optimistic insert and
    /// the echoed broadcast reconcile to the same object.
    ModelAddedWithId {
        user_id: UserId,
        model_data: PlacedObject,
    },
    ModelRemoved {
        user_id: UserId,
        model_id: ObjectId,
    },
    ModelMoved {
        user_id: UserId,
        model_id: ObjectId,
        position: DVec3,
        #[serde(default)]
        is_final: bool,
    },
    ModelRotated {
        user_id: UserId,
        model_id: ObjectId,
        rotation: DVec3,
        #[serde(default)]
        is_final: bool,
    },
    ModelScaled {
        user_id: UserId,
        model_id: ObjectId,
        scale: f64,
        #[serde(default)]
        is_final: bool,
    },
    ModelSelect {
        user_id: UserId,
        model_id: ObjectId,
    },
    ModelDeselect {
        user_id: UserId,
        model_id: ObjectId,
    },
    WallAdded {
        user_id: UserId,
        wall_data: Wall,
    },
    WallRemoved {
        user_id: UserId,
        wall_id: WallId,
    },
    WallUpdated {
        user_id: UserId,
        wall_id: WallId,
        updates: WallUpdate,
        #[serde(default)]
        is_final: bool,
    },
    WallColorChanged {
        user_id: UserId,
        color: String,
    },
    FloorColorChanged {
        user_id: UserId,
        color: String,
    },
    BackgroundColorChanged {
        user_id: UserId,
        color: String,
    },
    WallTextureChanged {
        user_id: UserId,
        texture: Option<String>,
    },
    FloorTextureChanged {
        user_id: UserId,
        texture: Option<String>,
    },
    EnvironmentPresetChanged {
        user_id: UserId,
        preset: String,
    },
    /// Owner-initiated shutdown of the whole session.
    CollaborationEnded {
        owner_id: UserId,
        room_id: String,
        message: String,
    },
}

impl RoomMessage {
    /// The user a mutation originated from, when the message carries one.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::UserJoin { user_id, .. }
            | Self::UserLeft { user_id, .. }
            | Self::ModelAdded { user_id, .. }
            | Self::ModelAddedWithId { user_id, .. }
            | Self::ModelRemoved { user_id, .. }
            | Self::ModelMoved { user_id, .. }
            | Self::ModelRotated { user_id, .. }
            | Self::ModelScaled { user_id, .. }
            | Self::ModelSelect { user_id, .. }
            | Self::ModelDeselect { user_id, .. }
            | Self::WallAdded { user_id, .. }
            | Self::WallRemoved { user_id, .. }
            | Self::WallUpdated { user_id, .. }
            | Self::WallColorChanged { user_id, .. }
            | Self::FloorColorChanged { user_id, .. }
            | Self::BackgroundColorChanged { user_id, .. }
            | Self::WallTextureChanged { user_id, .. }
            | Self::FloorTextureChanged { user_id, .. }
            | Self::EnvironmentPresetChanged { user_id, .. } => Some(user_id),
            Self::JoinRoom { .. }
            | Self::InitialRoomState { .. }
            | Self::CollaborationEnded { .. } => None,
        }
    }
}

impl Throttleable for RoomMessage {
    fn throttle_key(&self) -> Option<ThrottleKey> {
        match self {
            Self::ModelMoved { model_id, .. } => Some(("model-moved", model_id.to_string())),
            Self::ModelRotated { model_id, .. } => Some(("model-rotated", model_id.to_string())),
            Self::ModelScaled { model_id, .. } => Some(("model-scaled", model_id.to_string())),
            Self::WallUpdated { wall_id, .. } => Some(("wall-updated", wall_id.to_string())),
            _ => None,
        }
    }

    fn finality(&self) -> Finality {
        match self {
            Self::ModelMoved { is_final, .. }
            | Self::ModelRotated { is_final, .. }
            | Self::ModelScaled { is_final, .. }
            | Self::WallUpdated { is_final, .. } => {
                if *is_final {
                    Finality::Final
                } else {
                    Finality::Provisional
                }
            }
            _ => Finality::Final,
        }
    }
}

/// Apply a remote mutation to the local mirror, last writer wins.
///
/// Messages originating from `local_user` are ignored, so a relay that
/// echoes the sender's own broadcasts cannot double-apply them. Returns
/// true when the mirror changed.
pub fn apply_remote(
    message: &RoomMessage,
    local_user: &str,
    scene: &mut RoomScene,
    walls: &mut WallRegistry,
) -> bool {
    if message.origin() == Some(local_user) {
        return false;
    }
    match message {
        RoomMessage::InitialRoomState {
            objects,
            walls: wall_list,
            ..
        } => {
            scene.replace_objects(objects.clone());
            *walls = walls.replace_all(wall_list.clone());
            true
        }
        RoomMessage::ModelAdded { model_data, .. }
        | RoomMessage::ModelAddedWithId { model_data, .. } => {
            scene.insert(model_data.clone());
            true
        }
        RoomMessage::ModelRemoved { model_id, .. } => scene.remove(*model_id).is_some(),
        RoomMessage::ModelMoved {
            model_id, position, ..
        } => scene.with_object(*model_id, |object| object.position = *position),
        RoomMessage::ModelRotated {
            model_id, rotation, ..
        } => scene.with_object(*model_id, |object| object.rotation = *rotation),
        RoomMessage::ModelScaled {
            model_id, scale, ..
        } => scene.with_object(*model_id, |object| object.scale = *scale),
        RoomMessage::WallAdded { wall_data, .. } => {
            *walls = walls.upsert(wall_data.clone());
            true
        }
        RoomMessage::WallRemoved { wall_id, .. } => {
            let next = walls.remove(*wall_id);
            let changed = !next.same_snapshot(walls);
            *walls = next;
            changed
        }
        RoomMessage::WallUpdated {
            wall_id, updates, ..
        } => {
            let next = walls.update(*wall_id, updates);
            let changed = !next.same_snapshot(walls);
            *walls = next;
            changed
        }
        RoomMessage::WallColorChanged { color, .. } => {
            scene.appearance.wall_color = color.clone();
            true
        }
        RoomMessage::FloorColorChanged { color, .. } => {
            scene.appearance.floor_color = color.clone();
            true
        }
        RoomMessage::BackgroundColorChanged { color, .. } => {
            scene.appearance.background_color = color.clone();
            true
        }
        RoomMessage::WallTextureChanged { texture, .. } => {
            scene.appearance.wall_texture = texture.clone();
            true
        }
        RoomMessage::FloorTextureChanged { texture, .. } => {
            scene.appearance.floor_texture = texture.clone();
            true
        }
        RoomMessage::EnvironmentPresetChanged { preset, .. } => {
            scene.appearance.environment_preset = preset.clone();
            true
        }
        // Presence and lifecycle are handled by the session layer.
        RoomMessage::JoinRoom { .. }
        | RoomMessage::UserJoin { .. }
        | RoomMessage::UserLeft { .. }
        | RoomMessage::ModelSelect { .. }
        | RoomMessage::ModelDeselect { .. }
        | RoomMessage::CollaborationEnded { .. } => false,
    }
}
