//! Pointer-driven object manipulation.
//!
//! One controller instance tracks the interaction state machine
//! `idle -> selected -> {moving | scaling} -> idle` for the object the user
//! is touching. Scene mutations are applied optimistically on every frame;
//! the caller broadcasts the events this produces, with intermediate frames
//! marked provisional and the release frame final.

use crate::bus::Finality;
use crate::scene::{ObjectId, RoomScene};
use crate::snap::{resolve_snap, SnapConfig, SnapResult};
use crate::walls::WallRegistry;
use glam::DVec3;
use thiserror::Error;

/// Moves smaller than this (meters) are swallowed, not emitted.
pub const POSITION_EPSILON: f64 = 0.01;
/// Scale changes smaller than this are swallowed.
pub const SCALE_EPSILON: f64 = 1e-3;
/// Vertical pointer pixels to scale-factor conversion.
pub const SCALE_SENSITIVITY: f64 = 0.01;
pub const MIN_SCALE: f64 = 0.1;
pub const MAX_SCALE: f64 = 3.0;

/// A pointer ray in world space.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: DVec3,
    pub direction: DVec3,
}

impl Ray {
    /// Intersect with the horizontal plane `y = height`. `None` when the ray
    /// is parallel to the plane or points away from it.
    pub fn intersect_plane_y(&self, height: f64) -> Option<DVec3> {
        if self.direction.y.abs() < 1e-12 {
            return None;
        }
        let t = (height - self.origin.y) / self.direction.y;
        if t < 0.0 {
            return None;
        }
        Some(self.origin + self.direction * t)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DragError {
    #[error("object {0} is locked by another participant")]
    Locked(ObjectId),
    #[error("object {0} not found")]
    UnknownObject(ObjectId),
    #[error("pointer ray does not hit the ground plane")]
    MissedGround,
    #[error("an interaction is already in progress")]
    Busy,
}

/// What the controller wants broadcast after a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DragEvent {
    Selected {
        id: ObjectId,
    },
    Deselected {
        id: ObjectId,
    },
    Moved {
        id: ObjectId,
        position: DVec3,
        snap: Option<SnapResult>,
        finality: Finality,
    },
    Rotated {
        id: ObjectId,
        rotation: DVec3,
    },
    Scaled {
        id: ObjectId,
        scale: f64,
        finality: Finality,
    },
    /// Interaction abandoned, scene restored, nothing to broadcast.
    Cancelled {
        id: ObjectId,
    },
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Selected {
        id: ObjectId,
    },
    Moving {
        id: ObjectId,
        grab_offset: DVec3,
        height: f64,
        origin: DVec3,
        last_emitted: Option<DVec3>,
        last_snap: Option<SnapResult>,
    },
    Scaling {
        id: ObjectId,
        start_screen_y: f64,
        start_scale: f64,
        last_emitted: Option<f64>,
    },
}

/// The per-client interaction state machine.
#[derive(Debug, Default)]
pub struct DragController {
    state: State,
    config: SnapConfig,
}

impl DragController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SnapConfig) -> Self {
        Self {
            state: State::Idle,
            config,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// The object currently selected or being manipulated.
    pub fn active_object(&self) -> Option<ObjectId> {
        match &self.state {
            State::Idle => None,
            State::Selected { id }
            | State::Moving { id, .. }
            | State::Scaling { id, .. } => Some(*id),
        }
    }

    /// Snap currently applied to the dragged object, for UI highlighting.
    pub fn current_snap(&self) -> Option<&SnapResult> {
        match &self.state {
            State::Moving { last_snap, .. } => last_snap.as_ref(),
            _ => None,
        }
    }

    /// Select an object. Locked objects refuse all interaction.
    pub fn select(&mut self, scene: &RoomScene, id: ObjectId) -> Result<DragEvent, DragError> {
        if !self.is_idle() && self.active_object() != Some(id) {
            return Err(DragError::Busy);
        }
        let object = scene.object(id).ok_or(DragError::UnknownObject(id))?;
        if object.locked {
            return Err(DragError::Locked(id));
        }
        self.state = State::Selected { id };
        Ok(DragEvent::Selected { id })
    }

    pub fn deselect(&mut self) -> Option<DragEvent> {
        let id = self.active_object()?;
        self.state = State::Idle;
        Some(DragEvent::Deselected { id })
    }

    /// Pointer-down on the selected object: enter `moving`.
    ///
    /// The pointer ray is cast against the ground plane at the object's
    /// current height; the hit-to-origin offset is kept so the object does
    /// not jump under the cursor.
    pub fn begin_move(
        &mut self,
        scene: &RoomScene,
        id: ObjectId,
        pointer: Ray,
    ) -> Result<(), DragError> {
        match self.state {
            State::Idle | State::Selected { .. } => {}
            _ => return Err(DragError::Busy),
        }
        let object = scene.object(id).ok_or(DragError::UnknownObject(id))?;
        if object.locked {
            return Err(DragError::Locked(id));
        }
        let height = object.position.y;
        let hit = pointer
            .intersect_plane_y(height)
            .ok_or(DragError::MissedGround)?;
        self.state = State::Moving {
            id,
            grab_offset: object.position - hit,
            height,
            origin: object.position,
            last_emitted: None,
            last_snap: None,
        };
        Ok(())
    }

    /// Pointer-move while `moving`: snap-resolve and optimistically apply.
    ///
    /// Returns `None` when the pointer misses the ground or the move is
    /// within [`POSITION_EPSILON`] of the last emitted position.
    pub fn update_move(
        &mut self,
        scene: &mut RoomScene,
        walls: &WallRegistry,
        pointer: Ray,
    ) -> Option<DragEvent> {
        let State::Moving {
            id,
            grab_offset,
            height,
            last_emitted,
            last_snap,
            ..
        } = &mut self.state
        else {
            return None;
        };
        let id = *id;
        let hit = pointer.intersect_plane_y(*height)?;
        let candidate = hit + *grab_offset;

        let (yaw, footprint) = {
            let object = scene.object(id)?;
            (object.total_yaw(), object.world_footprint())
        };
        let snap = resolve_snap(candidate, yaw, footprint, walls.walls(), &self.config);
        let mut position = snap.as_ref().map_or(candidate, |s| s.position);
        position.y = *height;

        if let Some(last) = last_emitted {
            if (position - *last).length() < POSITION_EPSILON {
                return None;
            }
        }
        *last_emitted = Some(position);
        *last_snap = snap.clone();

        scene.with_object(id, |object| object.position = position);
        Some(DragEvent::Moved {
            id,
            position,
            snap,
            finality: Finality::Provisional,
        })
    }

    /// Pointer-up: commit the final position and fall back to `selected`.
    pub fn end_move(&mut self, scene: &RoomScene) -> Option<DragEvent> {
        let State::Moving { id, .. } = self.state else {
            return None;
        };
        // The object can vanish mid-drag (removal is not lock-gated), so the
        // gesture must end either way.
        let Some(object) = scene.object(id) else {
            self.state = State::Idle;
            return None;
        };
        let position = object.position;
        self.state = State::Selected { id };
        Some(DragEvent::Moved {
            id,
            position,
            snap: None,
            finality: Finality::Final,
        })
    }

    /// Pointer-down with the scale modifier: enter `scaling`.
    pub fn begin_scale(
        &mut self,
        scene: &RoomScene,
        id: ObjectId,
        screen_y: f64,
    ) -> Result<(), DragError> {
        match self.state {
            State::Idle | State::Selected { .. } => {}
            _ => return Err(DragError::Busy),
        }
        let object = scene.object(id).ok_or(DragError::UnknownObject(id))?;
        if object.locked {
            return Err(DragError::Locked(id));
        }
        self.state = State::Scaling {
            id,
            start_screen_y: screen_y,
            start_scale: object.scale,
            last_emitted: None,
        };
        Ok(())
    }

    /// Vertical pointer delta maps linearly onto the scale factor, clamped
    /// to `[MIN_SCALE, MAX_SCALE]`. Dragging up grows the object.
    pub fn update_scale(&mut self, scene: &mut RoomScene, screen_y: f64) -> Option<DragEvent> {
        let State::Scaling {
            id,
            start_screen_y,
            start_scale,
            last_emitted,
        } = &mut self.state
        else {
            return None;
        };
        let id = *id;
        let scale = (*start_scale + (*start_screen_y - screen_y) * SCALE_SENSITIVITY)
            .clamp(MIN_SCALE, MAX_SCALE);
        if let Some(last) = last_emitted {
            if (scale - *last).abs() < SCALE_EPSILON {
                return None;
            }
        }
        *last_emitted = Some(scale);
        scene.with_object(id, |object| object.scale = scale);
        Some(DragEvent::Scaled {
            id,
            scale,
            finality: Finality::Provisional,
        })
    }

    pub fn end_scale(&mut self, scene: &RoomScene) -> Option<DragEvent> {
        let State::Scaling { id, .. } = self.state else {
            return None;
        };
        let Some(object) = scene.object(id) else {
            self.state = State::Idle;
            return None;
        };
        let scale = object.scale;
        self.state = State::Selected { id };
        Some(DragEvent::Scaled {
            id,
            scale,
            finality: Finality::Final,
        })
    }

    /// Rotate the selected object about the vertical axis. Always a final
    /// commit; rotation has no intermediate preview.
    pub fn rotate(
        &mut self,
        scene: &mut RoomScene,
        id: ObjectId,
        delta_yaw: f64,
    ) -> Result<DragEvent, DragError> {
        let changed = scene.with_object(id, |object| object.rotation.y += delta_yaw);
        if !changed {
            return Err(DragError::UnknownObject(id));
        }
        let rotation = scene.object(id).ok_or(DragError::UnknownObject(id))?.rotation;
        Ok(DragEvent::Rotated { id, rotation })
    }

    /// Abandon the interaction without a commit. Move cancels restore the
    /// pre-drag position, scale cancels the pre-drag scale.
    pub fn cancel(&mut self, scene: &mut RoomScene) -> Option<DragEvent> {
        match std::mem::take(&mut self.state) {
            State::Moving { id, origin, .. } => {
                scene.with_object(id, |object| object.position = origin);
                Some(DragEvent::Cancelled { id })
            }
            State::Scaling { id, start_scale, .. } => {
                scene.with_object(id, |object| object.scale = start_scale);
                Some(DragEvent::Cancelled { id })
            }
            State::Selected { id } => Some(DragEvent::Deselected { id }),
            State::Idle => None,
        }
    }
}
