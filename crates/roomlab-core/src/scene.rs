//! Room scene data model: walls, placed objects, appearance.
//!
//! The scene is a per-client mirror of the room. While a collaboration
//! session is active the authoritative copy lives in the shared room store;
//! in solo mode the local copy is authoritative and is persisted on explicit
//! save.

use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifier of a placed furniture object.
pub type ObjectId = Uuid;
/// Identifier of a wall segment.
pub type WallId = Uuid;
/// Identifier of a connected user, assigned by the outer application.
pub type UserId = String;

/// Smallest allowed extent (meters) for any dimension.
pub const MIN_DIMENSION: f64 = 1e-3;

/// Width/height/depth of a wall or an object footprint, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
    pub depth: f64,
}

impl Dimensions {
    pub fn new(width: f64, height: f64, depth: f64) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Check that every extent is at least [`MIN_DIMENSION`].
    pub fn is_valid(&self) -> bool {
        self.width >= MIN_DIMENSION && self.height >= MIN_DIMENSION && self.depth >= MIN_DIMENSION
    }

    /// Scale uniformly, clamping each extent to the minimum epsilon.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            width: (self.width * factor).max(MIN_DIMENSION),
            height: (self.height * factor).max(MIN_DIMENSION),
            depth: (self.depth * factor).max(MIN_DIMENSION),
        }
    }
}

/// A wall segment.
///
/// Endpoints are always derived from (position, rotation, width) and never
/// stored, so they cannot drift out of sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wall {
    pub id: WallId,
    /// Center of the wall in world space.
    pub position: DVec3,
    /// Yaw rotation about the vertical axis, radians.
    pub rotation: f64,
    pub dimensions: Dimensions,
}

impl Wall {
    /// Build a wall spanning `start`..`end` on the ground plane.
    ///
    /// The center, yaw and width are derived from the two points; the
    /// vertical position is the midpoint of the endpoints' heights.
    pub fn from_endpoints(start: DVec3, end: DVec3, height: f64, depth: f64) -> Self {
        let dx = end.x - start.x;
        let dz = end.z - start.z;
        let width = (dx * dx + dz * dz).sqrt();
        Self {
            id: Uuid::new_v4(),
            position: DVec3::new(
                (start.x + end.x) / 2.0,
                (start.y + end.y) / 2.0,
                (start.z + end.z) / 2.0,
            ),
            rotation: (-dz).atan2(dx),
            dimensions: Dimensions::new(width, height, depth),
        }
    }

    /// World-space endpoints (start, end), recomputed from center + yaw + width.
    pub fn endpoints(&self) -> (DVec3, DVec3) {
        let half = self.dimensions.width / 2.0;
        let cos = self.rotation.cos();
        let sin = self.rotation.sin();
        let start = DVec3::new(
            self.position.x - half * cos,
            self.position.y,
            self.position.z + half * sin,
        );
        let end = DVec3::new(
            self.position.x + half * cos,
            self.position.y,
            self.position.z - half * sin,
        );
        (start, end)
    }

    pub fn length(&self) -> f64 {
        self.dimensions.width
    }
}

/// A catalog item placed in the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedObject {
    pub id: ObjectId,
    /// Furniture/model identifier resolved to geometry by a [`crate::store::ModelSource`].
    pub model_id: String,
    pub position: DVec3,
    /// Euler rotation in radians. Only `y` is user-editable; `x`/`z` hold
    /// model pre-rotation corrections.
    pub rotation: DVec3,
    /// Fixed yaw correction baked into the model (applied on top of
    /// `rotation.y` when computing the effective world yaw).
    #[serde(default)]
    pub yaw_correction: f64,
    /// Uniform scale factor.
    pub scale: f64,
    /// Natural (unscaled) footprint used by the snap resolver.
    pub footprint: Dimensions,
    /// Advisory lock: set while a remote participant is manipulating the
    /// object. Blocks local pointer interaction only.
    #[serde(default)]
    pub locked: bool,
}

impl PlacedObject {
    pub fn new(model_id: impl Into<String>, position: DVec3, footprint: Dimensions) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_id: model_id.into(),
            position,
            rotation: DVec3::ZERO,
            yaw_correction: 0.0,
            scale: 1.0,
            footprint,
            locked: false,
        }
    }

    /// Effective world footprint: natural dimensions x scale, clamped to epsilon.
    pub fn world_footprint(&self) -> Dimensions {
        self.footprint.scaled(self.scale)
    }

    /// Total effective yaw: user rotation plus the model's fixed correction.
    pub fn total_yaw(&self) -> f64 {
        self.rotation.y + self.yaw_correction
    }
}

/// Room-wide colors, textures and environment preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appearance {
    pub wall_color: String,
    pub floor_color: String,
    pub background_color: String,
    pub wall_texture: Option<String>,
    pub floor_texture: Option<String>,
    pub environment_preset: String,
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            wall_color: "#cccccc".to_string(),
            floor_color: "#8b7355".to_string(),
            background_color: "#87ceeb".to_string(),
            wall_texture: None,
            floor_texture: None,
            environment_preset: "apartment".to_string(),
        }
    }
}

/// The placed objects and appearance of a room, mirrored per client.
///
/// Walls live in a [`crate::walls::WallRegistry`] next to the scene.
#[derive(Debug, Clone, Default)]
pub struct RoomScene {
    pub objects: HashMap<ObjectId, PlacedObject>,
    pub appearance: Appearance,
}

impl RoomScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, id: ObjectId) -> Option<&PlacedObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut PlacedObject> {
        self.objects.get_mut(&id)
    }

    /// Insert an object, replacing any previous object with the same id.
    pub fn insert(&mut self, object: PlacedObject) {
        self.objects.insert(object.id, object);
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<PlacedObject> {
        self.objects.remove(&id)
    }

    /// Mutate an object in place when present. Returns false for unknown ids.
    pub fn with_object(&mut self, id: ObjectId, f: impl FnOnce(&mut PlacedObject)) -> bool {
        match self.objects.get_mut(&id) {
            Some(object) => {
                f(object);
                true
            }
            None => false,
        }
    }

    /// Discard every object and rebuild from the snapshot's object list.
    pub fn replace_objects(&mut self, objects: Vec<PlacedObject>) {
        self.objects.clear();
        for object in objects {
            self.objects.insert(object.id, object);
        }
    }
}

/// Full room state as sent in `initial-room-state` and on explicit save.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub objects: Vec<PlacedObject>,
    pub walls: Vec<Wall>,
    #[serde(default)]
    pub appearance: Appearance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_endpoints_roundtrip() {
        let start = DVec3::new(-1.0, 1.25, 2.0);
        let end = DVec3::new(3.0, 1.25, -1.0);
        let wall = Wall::from_endpoints(start, end, 2.5, 0.15);

        let (s, e) = wall.endpoints();
        assert!((s - start).length() < 1e-9);
        assert!((e - end).length() < 1e-9);
        assert!((wall.length() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_wall_yaw_axis_aligned() {
        let wall = Wall::from_endpoints(DVec3::ZERO, DVec3::new(4.0, 0.0, 0.0), 2.5, 0.15);
        assert!(wall.rotation.abs() < 1e-9);

        let wall = Wall::from_endpoints(DVec3::ZERO, DVec3::new(0.0, 0.0, -4.0), 2.5, 0.15);
        assert!((wall.rotation - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn test_world_footprint_clamps_to_epsilon() {
        let mut object = PlacedObject::new(
            "sofa-01",
            DVec3::ZERO,
            Dimensions::new(1.0, 0.8, 0.5),
        );
        object.scale = 1e-9;
        let footprint = object.world_footprint();
        assert!(footprint.is_valid());
        assert_eq!(footprint.width, MIN_DIMENSION);
    }

    #[test]
    fn test_total_yaw_includes_correction() {
        let mut object = PlacedObject::new("chair", DVec3::ZERO, Dimensions::new(1.0, 1.0, 1.0));
        object.rotation.y = 0.5;
        object.yaw_correction = 3.0 * std::f64::consts::FRAC_PI_2;
        assert!((object.total_yaw() - (0.5 + 3.0 * std::f64::consts::FRAC_PI_2)).abs() < 1e-12);
    }

    #[test]
    fn test_replace_objects_discards_previous() {
        let mut scene = RoomScene::new();
        let a = PlacedObject::new("a", DVec3::ZERO, Dimensions::new(1.0, 1.0, 1.0));
        let b = PlacedObject::new("b", DVec3::ZERO, Dimensions::new(1.0, 1.0, 1.0));
        scene.insert(a.clone());
        scene.insert(b);

        scene.replace_objects(vec![a.clone()]);
        assert_eq!(scene.objects.len(), 1);
        assert!(scene.object(a.id).is_some());
    }
}
