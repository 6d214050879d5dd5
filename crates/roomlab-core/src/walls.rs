//! Wall registry: immutable-snapshot collection of wall segments.
//!
//! Every mutating operation returns a *new* registry value; a rejected
//! operation returns the same underlying allocation, so consumers relying on
//! reference-equality change detection see a true no-op. Validation
//! rejections log a warning and are never propagated to peers.

use crate::scene::{Dimensions, Wall, WallId};
use glam::DVec3;
use kurbo::Point;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shortest wall a user may draw, meters.
pub const MIN_WALL_LENGTH: f64 = 0.1;
/// Longest wall a user may draw, meters.
pub const MAX_WALL_LENGTH: f64 = 50.0;
/// Drawn endpoints snap to existing wall endpoints within this distance.
pub const ENDPOINT_SNAP_DISTANCE: f64 = 0.5;
/// Grid pitch for optional endpoint grid-snapping, meters.
pub const GRID_SIZE: f64 = 0.5;

pub const DEFAULT_WALL_HEIGHT: f64 = 2.5;
pub const DEFAULT_WALL_DEPTH: f64 = 0.15;

/// Options applied while drawing a new wall.
#[derive(Debug, Clone, Copy)]
pub struct WallDrawOptions {
    /// Snap both endpoints to the grid before validation.
    pub grid_snap: bool,
    /// Snap endpoints to nearby existing wall endpoints.
    pub endpoint_snap: bool,
}

impl Default for WallDrawOptions {
    fn default() -> Self {
        Self {
            grid_snap: false,
            endpoint_snap: true,
        }
    }
}

/// Partial wall update, as carried by the `wall-updated` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WallUpdate {
    pub position: Option<DVec3>,
    pub rotation: Option<f64>,
    pub dimensions: Option<Dimensions>,
}

/// Snap a ground point to the nearest grid intersection.
pub fn snap_to_grid(point: DVec3, grid_size: f64) -> DVec3 {
    DVec3::new(
        (point.x / grid_size).round() * grid_size,
        point.y,
        (point.z / grid_size).round() * grid_size,
    )
}

/// In-memory wall collection with copy-on-write snapshots.
#[derive(Debug, Clone, Default)]
pub struct WallRegistry {
    walls: Arc<Vec<Wall>>,
}

impl WallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_walls(walls: Vec<Wall>) -> Self {
        Self {
            walls: Arc::new(walls),
        }
    }

    pub fn walls(&self) -> &[Wall] {
        &self.walls
    }

    pub fn get(&self, id: WallId) -> Option<&Wall> {
        self.walls.iter().find(|w| w.id == id)
    }

    pub fn len(&self) -> usize {
        self.walls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.walls.is_empty()
    }

    /// True when both registries share the same underlying snapshot
    /// (no mutation happened between them).
    pub fn same_snapshot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.walls, &other.walls)
    }

    /// Draw a new wall between two ground points.
    ///
    /// Endpoints are optionally grid-snapped, then pulled onto nearby
    /// existing wall endpoints. Walls shorter than [`MIN_WALL_LENGTH`] or
    /// longer than [`MAX_WALL_LENGTH`] are rejected with a warning and the
    /// registry is returned unchanged.
    pub fn add(&self, start: DVec3, end: DVec3, options: &WallDrawOptions) -> (Self, Option<WallId>) {
        let (mut start, mut end) = (start, end);
        if options.grid_snap {
            start = snap_to_grid(start, GRID_SIZE);
            end = snap_to_grid(end, GRID_SIZE);
        }
        if options.endpoint_snap {
            start = self.snap_to_endpoints(start);
            end = self.snap_to_endpoints(end);
        }

        let length = ((end.x - start.x).powi(2) + (end.z - start.z).powi(2)).sqrt();
        if length < MIN_WALL_LENGTH {
            log::warn!("rejecting wall: length {length:.3}m below minimum");
            return (self.clone(), None);
        }
        if length > MAX_WALL_LENGTH {
            log::warn!("rejecting wall: length {length:.3}m above maximum");
            return (self.clone(), None);
        }

        // Inherit elevation and cross-section from existing walls so a room
        // drawn in several strokes stays uniform.
        let (height, depth, y) = match self.walls.first() {
            Some(first) => (
                first.dimensions.height,
                first.dimensions.depth,
                first.position.y,
            ),
            None => (DEFAULT_WALL_HEIGHT, DEFAULT_WALL_DEPTH, DEFAULT_WALL_HEIGHT),
        };

        let mut wall = Wall::from_endpoints(start, end, height, depth);
        wall.position.y = y;
        let id = wall.id;

        let mut walls = self.walls.as_ref().clone();
        walls.push(wall);
        (Self::from_walls(walls), Some(id))
    }

    /// Insert a fully-formed wall (remote add, history restore), replacing
    /// any existing wall with the same id.
    pub fn upsert(&self, wall: Wall) -> Self {
        let mut walls: Vec<Wall> = self
            .walls
            .iter()
            .filter(|w| w.id != wall.id)
            .cloned()
            .collect();
        walls.push(wall);
        Self::from_walls(walls)
    }

    pub fn remove(&self, id: WallId) -> Self {
        if self.get(id).is_none() {
            return self.clone();
        }
        let walls = self.walls.iter().filter(|w| w.id != id).cloned().collect();
        Self::from_walls(walls)
    }

    /// Apply a partial update. Updates with a non-positive dimension are
    /// rejected unchanged.
    pub fn update(&self, id: WallId, update: &WallUpdate) -> Self {
        if let Some(dimensions) = &update.dimensions {
            if !dimensions.is_valid() {
                log::warn!("rejecting wall update: invalid dimensions {dimensions:?}");
                return self.clone();
            }
        }
        if self.get(id).is_none() {
            return self.clone();
        }
        let walls = self
            .walls
            .iter()
            .map(|w| {
                if w.id != id {
                    return w.clone();
                }
                let mut wall = w.clone();
                if let Some(position) = update.position {
                    wall.position = position;
                }
                if let Some(rotation) = update.rotation {
                    wall.rotation = rotation;
                }
                if let Some(dimensions) = update.dimensions {
                    wall.dimensions = dimensions;
                }
                wall
            })
            .collect();
        Self::from_walls(walls)
    }

    pub fn move_wall(&self, id: WallId, position: DVec3) -> Self {
        self.update(
            id,
            &WallUpdate {
                position: Some(position),
                ..Default::default()
            },
        )
    }

    pub fn rotate_wall(&self, id: WallId, rotation: f64) -> Self {
        self.update(
            id,
            &WallUpdate {
                rotation: Some(rotation),
                ..Default::default()
            },
        )
    }

    pub fn resize_wall(&self, id: WallId, dimensions: Dimensions) -> Self {
        self.update(
            id,
            &WallUpdate {
                dimensions: Some(dimensions),
                ..Default::default()
            },
        )
    }

    /// Copy a wall with a fresh id, shifted by `offset`.
    pub fn duplicate(&self, id: WallId, offset: DVec3) -> (Self, Option<WallId>) {
        let Some(source) = self.get(id) else {
            return (self.clone(), None);
        };
        let mut wall = source.clone();
        wall.id = WallId::new_v4();
        wall.position += offset;
        let new_id = wall.id;
        let mut walls = self.walls.as_ref().clone();
        walls.push(wall);
        (Self::from_walls(walls), Some(new_id))
    }

    pub fn clear(&self) -> Self {
        Self::new()
    }

    /// Bulk replace, used when loading a room or applying a full snapshot.
    pub fn replace_all(&self, walls: Vec<Wall>) -> Self {
        Self::from_walls(walls)
    }

    fn snap_to_endpoints(&self, point: DVec3) -> DVec3 {
        let mut best = point;
        let mut best_distance = ENDPOINT_SNAP_DISTANCE;
        for wall in self.walls.iter() {
            let (start, end) = wall.endpoints();
            for endpoint in [start, end] {
                let distance =
                    ((point.x - endpoint.x).powi(2) + (point.z - endpoint.z).powi(2)).sqrt();
                if distance < best_distance {
                    best_distance = distance;
                    best = DVec3::new(endpoint.x, point.y, endpoint.z);
                }
            }
        }
        best
    }
}

/// Convert a wall drawn on the 2D floor plan (pixel space) into a 3D wall.
///
/// `meters_per_pixel` is the plan calibration ratio; plan x maps to world x
/// and plan y to world z.
pub fn wall_from_plan(
    start: Point,
    end: Point,
    meters_per_pixel: f64,
    height: f64,
    depth: f64,
) -> Wall {
    let start = DVec3::new(start.x * meters_per_pixel, 0.0, start.y * meters_per_pixel);
    let end = DVec3::new(end.x * meters_per_pixel, 0.0, end.y * meters_per_pixel);
    let mut wall = Wall::from_endpoints(start, end, height, depth);
    wall.position.y = height / 2.0;
    wall
}

/// Project a 3D wall back onto the 2D floor plan with the same ratio.
pub fn wall_to_plan(wall: &Wall, meters_per_pixel: f64) -> (Point, Point) {
    let (start, end) = wall.endpoints();
    (
        Point::new(start.x / meters_per_pixel, start.z / meters_per_pixel),
        Point::new(end.x / meters_per_pixel, end.z / meters_per_pixel),
    )
}
