//! The room store: typed commands and queries over one room's state.
//!
//! This is the single owner of the scene, the wall registry, the drag
//! controller, and the session. The host application calls commands here
//! instead of mutating state directly; every successful command applies
//! locally first (optimistic) and queues the matching broadcast.
//!
//! Boundary collaborators are traits: [`RoomPersistence`] for explicit
//! saves, [`ModelSource`] for resolving furniture ids to geometry, and
//! [`HistoryRecorder`] for committed edits.

use std::collections::HashMap;

use crate::bus::Finality;
use crate::drag::{DragController, DragError, DragEvent, Ray};
use crate::protocol::{RoomMessage, UserData};
use crate::scene::{Dimensions, ObjectId, PlacedObject, RoomScene, RoomSnapshot, WallId};
use crate::session::{ChannelAuth, SessionError, SessionEvent, SessionManager};
use crate::snap::SnapResult;
use crate::walls::{WallDrawOptions, WallRegistry, WallUpdate};
use glam::DVec3;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("editing is disabled until the room snapshot arrives")]
    EditingDisabled,
    #[error(transparent)]
    Drag(#[from] DragError),
    #[error("wall {0} not found")]
    UnknownWall(WallId),
    #[error("wall rejected by validation")]
    WallRejected,
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
#[error("persistence failed: {0}")]
pub struct PersistenceError(pub String);

/// Durable snapshot storage, invoked only on explicit save.
pub trait RoomPersistence {
    fn save(&mut self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), PersistenceError>;
    fn load(&mut self, room_id: &str) -> Result<Option<RoomSnapshot>, PersistenceError>;
}

/// In-memory persistence for tests and offline use.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rooms: HashMap<String, RoomSnapshot>,
}

impl RoomPersistence for MemoryPersistence {
    fn save(&mut self, room_id: &str, snapshot: &RoomSnapshot) -> Result<(), PersistenceError> {
        self.rooms.insert(room_id.to_string(), snapshot.clone());
        Ok(())
    }

    fn load(&mut self, room_id: &str) -> Result<Option<RoomSnapshot>, PersistenceError> {
        Ok(self.rooms.get(room_id).cloned())
    }
}

#[derive(Debug, Error)]
#[error("no geometry for model {0}")]
pub struct UnknownModel(pub String);

/// Resolves a furniture identifier to renderable geometry.
///
/// The store only needs "given an id, eventually get a URL or bytes"; where
/// the geometry actually lives (local cache, shared cache, cold storage) is
/// the implementor's concern.
pub trait ModelSource {
    fn resolve(&self, model_id: &str) -> Result<ModelHandle, UnknownModel>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelHandle {
    Url(String),
    Bytes(Vec<u8>),
}

/// Model source backed by a static id-to-URL table.
#[derive(Debug, Default)]
pub struct StaticModelSource {
    urls: HashMap<String, String>,
}

impl StaticModelSource {
    pub fn insert(&mut self, model_id: impl Into<String>, url: impl Into<String>) {
        self.urls.insert(model_id.into(), url.into());
    }
}

impl ModelSource for StaticModelSource {
    fn resolve(&self, model_id: &str) -> Result<ModelHandle, UnknownModel> {
        self.urls
            .get(model_id)
            .map(|url| ModelHandle::Url(url.clone()))
            .ok_or_else(|| UnknownModel(model_id.to_string()))
    }
}

/// A committed (final) edit, as recorded for undo/history purposes.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEntry {
    ObjectAdded { id: ObjectId },
    ObjectRemoved { object: PlacedObject },
    ObjectMoved { id: ObjectId, position: DVec3 },
    ObjectRotated { id: ObjectId, rotation: DVec3 },
    ObjectScaled { id: ObjectId, scale: f64 },
    WallAdded { id: WallId },
    WallRemoved { id: WallId },
    WallUpdated { id: WallId },
}

pub trait HistoryRecorder {
    fn record(&mut self, entry: HistoryEntry);
}

pub struct NoopHistory;

impl HistoryRecorder for NoopHistory {
    fn record(&mut self, _entry: HistoryEntry) {}
}

/// Keeps entries in order, newest last.
#[derive(Default)]
pub struct MemoryHistory {
    pub entries: Vec<HistoryEntry>,
}

impl HistoryRecorder for MemoryHistory {
    fn record(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }
}

// Lets a caller keep a handle on the recorder it hands to the store.
impl<H: HistoryRecorder> HistoryRecorder for std::rc::Rc<std::cell::RefCell<H>> {
    fn record(&mut self, entry: HistoryEntry) {
        self.borrow_mut().record(entry);
    }
}

/// One user's view of one room, with every mutation flowing through typed
/// commands.
pub struct RoomStore {
    scene: RoomScene,
    walls: WallRegistry,
    drag: DragController,
    session: SessionManager,
    history: Box<dyn HistoryRecorder>,
}

impl RoomStore {
    pub fn new(user_id: impl Into<String>, user_data: UserData) -> Self {
        Self {
            scene: RoomScene::new(),
            walls: WallRegistry::new(),
            drag: DragController::new(),
            session: SessionManager::new(user_id, user_data),
            history: Box::new(NoopHistory),
        }
    }

    pub fn with_history(mut self, history: Box<dyn HistoryRecorder>) -> Self {
        self.history = history;
        self
    }

    // --- Queries ---

    pub fn scene(&self) -> &RoomScene {
        &self.scene
    }

    pub fn walls(&self) -> &WallRegistry {
        &self.walls
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn current_snap(&self) -> Option<&SnapResult> {
        self.drag.current_snap()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            objects: self.scene.objects.values().cloned().collect(),
            walls: self.walls.walls().to_vec(),
            appearance: self.scene.appearance.clone(),
        }
    }

    // --- Session lifecycle ---

    pub fn join_room(&mut self, room_id: &str, auth: &dyn ChannelAuth) -> Result<(), StoreError> {
        self.session.join_room(room_id, auth)?;
        Ok(())
    }

    pub fn connection_opened(&mut self) {
        self.session.connection_opened();
    }

    pub fn connection_closed(&mut self) {
        self.session.connection_closed();
    }

    /// Feed an inbound channel message through the session and mirror.
    pub fn handle_incoming(&mut self, message: RoomMessage) -> Vec<SessionEvent> {
        self.session
            .handle_message(message, &mut self.scene, &mut self.walls)
    }

    /// Messages queued for the transport.
    pub fn take_outgoing(&mut self) -> Vec<RoomMessage> {
        self.session.take_outgoing()
    }

    fn ensure_editable(&self) -> Result<(), StoreError> {
        if self.session.can_edit() {
            Ok(())
        } else {
            Err(StoreError::EditingDisabled)
        }
    }

    fn user_id(&self) -> String {
        self.session.user_id().to_string()
    }

    // --- Object commands ---

    /// Place a catalog item. The id is assigned locally so the optimistic
    /// insert and the broadcast agree.
    pub fn add_object(
        &mut self,
        model_id: impl Into<String>,
        position: DVec3,
        footprint: Dimensions,
    ) -> Result<ObjectId, StoreError> {
        self.ensure_editable()?;
        let object = PlacedObject::new(model_id, position, footprint);
        let id = object.id;
        self.scene.insert(object.clone());
        self.history.record(HistoryEntry::ObjectAdded { id });
        self.session.broadcast(RoomMessage::ModelAddedWithId {
            user_id: self.session.user_id().to_string(),
            model_data: object,
        });
        Ok(id)
    }

    pub fn remove_object(&mut self, id: ObjectId) -> Result<(), StoreError> {
        self.ensure_editable()?;
        let Some(object) = self.scene.remove(id) else {
            return Ok(());
        };
        self.history.record(HistoryEntry::ObjectRemoved { object });
        self.session.broadcast(RoomMessage::ModelRemoved {
            user_id: self.user_id(),
            model_id: id,
        });
        Ok(())
    }

    pub fn select_object(&mut self, id: ObjectId) -> Result<(), StoreError> {
        self.ensure_editable()?;
        self.drag.select(&self.scene, id)?;
        self.session.broadcast(RoomMessage::ModelSelect {
            user_id: self.user_id(),
            model_id: id,
        });
        Ok(())
    }

    pub fn deselect_object(&mut self) {
        if let Some(DragEvent::Deselected { id }) = self.drag.deselect() {
            self.session.broadcast(RoomMessage::ModelDeselect {
                user_id: self.user_id(),
                model_id: id,
            });
        }
    }

    // --- Drag/scale/rotate commands ---

    pub fn begin_move(&mut self, id: ObjectId, pointer: Ray) -> Result<(), StoreError> {
        self.ensure_editable()?;
        self.drag.begin_move(&self.scene, id, pointer)?;
        Ok(())
    }

    pub fn update_move(&mut self, pointer: Ray) {
        let event = self.drag.update_move(&mut self.scene, &self.walls, pointer);
        self.publish_drag_event(event);
    }

    pub fn end_move(&mut self) {
        let event = self.drag.end_move(&self.scene);
        self.publish_drag_event(event);
    }

    pub fn begin_scale(&mut self, id: ObjectId, screen_y: f64) -> Result<(), StoreError> {
        self.ensure_editable()?;
        self.drag.begin_scale(&self.scene, id, screen_y)?;
        Ok(())
    }

    pub fn update_scale(&mut self, screen_y: f64) {
        let event = self.drag.update_scale(&mut self.scene, screen_y);
        self.publish_drag_event(event);
    }

    pub fn end_scale(&mut self) {
        let event = self.drag.end_scale(&self.scene);
        self.publish_drag_event(event);
    }

    pub fn rotate_object(&mut self, id: ObjectId, delta_yaw: f64) -> Result<(), StoreError> {
        self.ensure_editable()?;
        let event = self.drag.rotate(&mut self.scene, id, delta_yaw)?;
        self.publish_drag_event(Some(event));
        Ok(())
    }

    pub fn cancel_interaction(&mut self) {
        // No broadcast: peers will simply stop receiving provisional frames
        // and keep the last state they saw until the next commit.
        self.drag.cancel(&mut self.scene);
    }

    fn publish_drag_event(&mut self, event: Option<DragEvent>) {
        let Some(event) = event else { return };
        let user_id = self.user_id();
        match event {
            DragEvent::Moved {
                id,
                position,
                finality,
                ..
            } => {
                if finality == Finality::Final {
                    self.history.record(HistoryEntry::ObjectMoved { id, position });
                }
                self.session.broadcast(RoomMessage::ModelMoved {
                    user_id,
                    model_id: id,
                    position,
                    is_final: finality == Finality::Final,
                });
            }
            DragEvent::Scaled { id, scale, finality } => {
                if finality == Finality::Final {
                    self.history.record(HistoryEntry::ObjectScaled { id, scale });
                }
                self.session.broadcast(RoomMessage::ModelScaled {
                    user_id,
                    model_id: id,
                    scale,
                    is_final: finality == Finality::Final,
                });
            }
            DragEvent::Rotated { id, rotation } => {
                self.history.record(HistoryEntry::ObjectRotated { id, rotation });
                self.session.broadcast(RoomMessage::ModelRotated {
                    user_id,
                    model_id: id,
                    rotation,
                    is_final: true,
                });
            }
            DragEvent::Selected { .. }
            | DragEvent::Deselected { .. }
            | DragEvent::Cancelled { .. } => {}
        }
    }

    // --- Wall commands ---

    pub fn add_wall(
        &mut self,
        start: DVec3,
        end: DVec3,
        options: &WallDrawOptions,
    ) -> Result<WallId, StoreError> {
        self.ensure_editable()?;
        let (walls, id) = self.walls.add(start, end, options);
        let id = id.ok_or(StoreError::WallRejected)?;
        self.walls = walls;
        self.history.record(HistoryEntry::WallAdded { id });
        let wall = self
            .walls
            .get(id)
            .cloned()
            .ok_or(StoreError::UnknownWall(id))?;
        self.session.broadcast(RoomMessage::WallAdded {
            user_id: self.user_id(),
            wall_data: wall,
        });
        Ok(id)
    }

    pub fn remove_wall(&mut self, id: WallId) -> Result<(), StoreError> {
        self.ensure_editable()?;
        let next = self.walls.remove(id);
        if next.same_snapshot(&self.walls) {
            return Err(StoreError::UnknownWall(id));
        }
        self.walls = next;
        self.history.record(HistoryEntry::WallRemoved { id });
        self.session.broadcast(RoomMessage::WallRemoved {
            user_id: self.user_id(),
            wall_id: id,
        });
        Ok(())
    }

    /// Apply a partial wall edit. Provisional while a handle is being
    /// dragged, final on release.
    pub fn update_wall(
        &mut self,
        id: WallId,
        update: WallUpdate,
        finality: Finality,
    ) -> Result<(), StoreError> {
        self.ensure_editable()?;
        let next = self.walls.update(id, &update);
        if next.same_snapshot(&self.walls) {
            return Err(StoreError::UnknownWall(id));
        }
        self.walls = next;
        if finality == Finality::Final {
            self.history.record(HistoryEntry::WallUpdated { id });
        }
        self.session.broadcast(RoomMessage::WallUpdated {
            user_id: self.user_id(),
            wall_id: id,
            updates: update,
            is_final: finality == Finality::Final,
        });
        Ok(())
    }

    // --- Appearance commands ---

    pub fn set_wall_color(&mut self, color: impl Into<String>) -> Result<(), StoreError> {
        self.ensure_editable()?;
        let color = color.into();
        self.scene.appearance.wall_color = color.clone();
        self.session.broadcast(RoomMessage::WallColorChanged {
            user_id: self.user_id(),
            color,
        });
        Ok(())
    }

    pub fn set_floor_color(&mut self, color: impl Into<String>) -> Result<(), StoreError> {
        self.ensure_editable()?;
        let color = color.into();
        self.scene.appearance.floor_color = color.clone();
        self.session.broadcast(RoomMessage::FloorColorChanged {
            user_id: self.user_id(),
            color,
        });
        Ok(())
    }

    pub fn set_background_color(&mut self, color: impl Into<String>) -> Result<(), StoreError> {
        self.ensure_editable()?;
        let color = color.into();
        self.scene.appearance.background_color = color.clone();
        self.session.broadcast(RoomMessage::BackgroundColorChanged {
            user_id: self.user_id(),
            color,
        });
        Ok(())
    }

    pub fn set_wall_texture(&mut self, texture: Option<String>) -> Result<(), StoreError> {
        self.ensure_editable()?;
        self.scene.appearance.wall_texture = texture.clone();
        self.session.broadcast(RoomMessage::WallTextureChanged {
            user_id: self.user_id(),
            texture,
        });
        Ok(())
    }

    pub fn set_floor_texture(&mut self, texture: Option<String>) -> Result<(), StoreError> {
        self.ensure_editable()?;
        self.scene.appearance.floor_texture = texture.clone();
        self.session.broadcast(RoomMessage::FloorTextureChanged {
            user_id: self.user_id(),
            texture,
        });
        Ok(())
    }

    pub fn set_environment_preset(&mut self, preset: impl Into<String>) -> Result<(), StoreError> {
        self.ensure_editable()?;
        let preset = preset.into();
        self.scene.appearance.environment_preset = preset.clone();
        self.session.broadcast(RoomMessage::EnvironmentPresetChanged {
            user_id: self.user_id(),
            preset,
        });
        Ok(())
    }

    // --- Persistence ---

    /// Explicit save of the full room state. Never called per edit.
    pub fn save(
        &self,
        room_id: &str,
        persistence: &mut dyn RoomPersistence,
    ) -> Result<(), PersistenceError> {
        persistence.save(room_id, &self.snapshot())
    }

    /// Load a room, replacing scene and walls wholesale.
    pub fn load(
        &mut self,
        room_id: &str,
        persistence: &mut dyn RoomPersistence,
    ) -> Result<bool, PersistenceError> {
        let Some(snapshot) = persistence.load(room_id)? else {
            return Ok(false);
        };
        self.scene.replace_objects(snapshot.objects);
        self.scene.appearance = snapshot.appearance;
        self.walls = self.walls.replace_all(snapshot.walls);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LeaveReason;
    use crate::session::NoAuth;

    fn user() -> UserData {
        UserData {
            name: "Me".into(),
            color: "#abcdef".into(),
        }
    }

    fn solo_store() -> RoomStore {
        RoomStore::new("me", user())
    }

    fn collaborative_store() -> RoomStore {
        let mut store = solo_store();
        store.join_room("room-1", &NoAuth).unwrap();
        store.connection_opened();
        store.handle_incoming(RoomMessage::InitialRoomState {
            objects: vec![],
            walls: vec![],
            roster: vec![],
        });
        store.take_outgoing(); // drop the join handshake
        store
    }

    fn footprint() -> Dimensions {
        Dimensions::new(1.0, 0.8, 1.0)
    }

    fn pointer(x: f64, z: f64) -> Ray {
        Ray {
            origin: DVec3::new(x, 10.0, z),
            direction: DVec3::new(0.0, -1.0, 0.0),
        }
    }

    #[test]
    fn test_add_object_broadcasts_preassigned_id() {
        let mut store = collaborative_store();
        let id = store
            .add_object("chair_01", DVec3::ZERO, footprint())
            .unwrap();
        let outgoing = store.take_outgoing();
        match outgoing.as_slice() {
            [RoomMessage::ModelAddedWithId { model_data, user_id }] => {
                assert_eq!(model_data.id, id);
                assert_eq!(user_id, "me");
            }
            other => panic!("unexpected outgoing {other:?}"),
        }
        assert!(store.scene().objects.contains_key(&id));
    }

    #[test]
    fn test_solo_edits_do_not_broadcast() {
        let mut store = solo_store();
        store
            .add_object("chair_01", DVec3::ZERO, footprint())
            .unwrap();
        assert!(store.take_outgoing().is_empty());
    }

    #[test]
    fn test_edits_blocked_before_snapshot() {
        let mut store = solo_store();
        store.join_room("room-1", &NoAuth).unwrap();
        store.connection_opened();
        let result = store.add_object("chair_01", DVec3::ZERO, footprint());
        assert!(matches!(result, Err(StoreError::EditingDisabled)));
    }

    #[test]
    fn test_drag_emits_provisional_then_final() {
        let mut store = collaborative_store();
        let id = store
            .add_object("chair_01", DVec3::ZERO, footprint())
            .unwrap();
        store.take_outgoing();

        store.begin_move(id, pointer(0.0, 0.0)).unwrap();
        store.update_move(pointer(2.0, 0.0));
        store.end_move();
        let outgoing = store.take_outgoing();
        assert_eq!(outgoing.len(), 2);
        match &outgoing[0] {
            RoomMessage::ModelMoved { is_final, .. } => assert!(!is_final),
            other => panic!("unexpected {other:?}"),
        }
        match &outgoing[1] {
            RoomMessage::ModelMoved {
                is_final, position, ..
            } => {
                assert!(is_final);
                assert_eq!(*position, DVec3::new(2.0, 0.0, 0.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_final_commits_recorded_in_history() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let history = Rc::new(RefCell::new(MemoryHistory::default()));
        let mut store = collaborative_store().with_history(Box::new(history.clone()));
        let id = store
            .add_object("chair_01", DVec3::ZERO, footprint())
            .unwrap();
        store.begin_move(id, pointer(0.0, 0.0)).unwrap();
        store.update_move(pointer(2.0, 0.0));
        store.end_move();
        store.rotate_object(id, 1.0).unwrap();

        let recorded = history.borrow();
        let entries = &recorded.entries;
        assert_eq!(entries[0], HistoryEntry::ObjectAdded { id });
        // The provisional frame is not recorded, only the release commit.
        assert_eq!(
            entries[1],
            HistoryEntry::ObjectMoved {
                id,
                position: DVec3::new(2.0, 0.0, 0.0),
            }
        );
        assert!(matches!(entries[2], HistoryEntry::ObjectRotated { .. }));
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_wall_rejection_surfaces_error() {
        let mut store = collaborative_store();
        let result = store.add_wall(
            DVec3::ZERO,
            DVec3::new(0.01, 0.0, 0.0),
            &WallDrawOptions::default(),
        );
        assert!(matches!(result, Err(StoreError::WallRejected)));
        assert!(store.take_outgoing().is_empty());
    }

    #[test]
    fn test_wall_add_and_update_broadcast() {
        let mut store = collaborative_store();
        let id = store
            .add_wall(
                DVec3::ZERO,
                DVec3::new(4.0, 0.0, 0.0),
                &WallDrawOptions::default(),
            )
            .unwrap();
        store
            .update_wall(
                id,
                WallUpdate {
                    rotation: Some(0.5),
                    ..Default::default()
                },
                Finality::Final,
            )
            .unwrap();
        let outgoing = store.take_outgoing();
        assert!(matches!(outgoing[0], RoomMessage::WallAdded { .. }));
        assert!(
            matches!(outgoing[1], RoomMessage::WallUpdated { is_final: true, .. })
        );
        assert!((store.walls().get(id).unwrap().rotation - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_wall_update() {
        let mut store = collaborative_store();
        let result = store.update_wall(WallId::new_v4(), WallUpdate::default(), Finality::Final);
        assert!(matches!(result, Err(StoreError::UnknownWall(_))));
    }

    #[test]
    fn test_appearance_commands_broadcast() {
        let mut store = collaborative_store();
        store.set_wall_color("#ff0000").unwrap();
        store.set_floor_texture(Some("oak".into())).unwrap();
        store.set_environment_preset("sunset").unwrap();
        let outgoing = store.take_outgoing();
        assert_eq!(outgoing.len(), 3);
        assert_eq!(store.scene().appearance.wall_color, "#ff0000");
        assert_eq!(store.scene().appearance.floor_texture.as_deref(), Some("oak"));
        assert_eq!(store.scene().appearance.environment_preset, "sunset");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut store = collaborative_store();
        let object_id = store
            .add_object("chair_01", DVec3::new(1.0, 0.0, 1.0), footprint())
            .unwrap();
        store
            .add_wall(
                DVec3::ZERO,
                DVec3::new(4.0, 0.0, 0.0),
                &WallDrawOptions::default(),
            )
            .unwrap();
        store.set_wall_color("#00ff00").unwrap();

        let mut persistence = MemoryPersistence::default();
        store.save("room-1", &mut persistence).unwrap();

        let mut other = solo_store();
        assert!(other.load("room-1", &mut persistence).unwrap());
        assert!(other.scene().objects.contains_key(&object_id));
        assert_eq!(other.walls().len(), 1);
        assert_eq!(other.scene().appearance.wall_color, "#00ff00");

        assert!(!other.load("missing", &mut persistence).unwrap());
    }

    #[test]
    fn test_locked_object_rejected_via_store() {
        let mut store = collaborative_store();
        let id = store
            .add_object("chair_01", DVec3::ZERO, footprint())
            .unwrap();
        store.handle_incoming(RoomMessage::ModelSelect {
            user_id: "peer".into(),
            model_id: id,
        });
        let result = store.select_object(id);
        assert!(matches!(result, Err(StoreError::Drag(DragError::Locked(_)))));
    }

    #[test]
    fn test_eviction_disables_editing() {
        let mut store = collaborative_store();
        store.handle_incoming(RoomMessage::UserLeft {
            user_id: "me".into(),
            reason: LeaveReason::DuplicateConnection,
        });
        let result = store.add_object("chair_01", DVec3::ZERO, footprint());
        assert!(matches!(result, Err(StoreError::EditingDisabled)));
    }

    #[test]
    fn test_static_model_source() {
        let mut source = StaticModelSource::default();
        source.insert("chair_01", "https://cdn.example/chair_01.glb");
        assert_eq!(
            source.resolve("chair_01").unwrap(),
            ModelHandle::Url("https://cdn.example/chair_01.glb".into())
        );
        assert!(source.resolve("missing").is_err());
    }
}
