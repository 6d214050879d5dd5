//! Wall-snap resolution for dragged objects.
//!
//! Pure geometry: given a candidate position for a moving object and the
//! current wall set, find the nearest valid face snap or corner snap. The
//! object and every wall may carry an arbitrary yaw, so all face tests run
//! in the wall's local frame with the object's footprint projected through
//! the relative yaw (rotated-rectangle projection).

use crate::scene::{Dimensions, MIN_DIMENSION, Wall, WallId};
use glam::DVec3;
use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Distance (meters) at which a wall face starts attracting an object.
pub const SNAP_DISTANCE: f64 = 0.3;
/// Gap (meters) left between the object's edge and the wall face.
pub const WALL_OFFSET: f64 = 0.05;
/// Corner snaps engage at a larger radius, making corners sticky.
pub const CORNER_SNAP_DISTANCE: f64 = 0.5;

/// Tolerance (radians) when testing two walls for perpendicularity and when
/// bucketing a wall's yaw onto a world axis.
const RIGHT_ANGLE_TOLERANCE: f64 = 0.1;
/// Candidates this close count as "already snapped" and stay eligible for
/// the corner pass even while flush against a face.
const FLUSH_DISTANCE: f64 = 0.05;
/// Below this distance a candidate relaxes the corner threshold, so an
/// object sliding along one wall can be pulled into a corner.
const HELD_SNAP_DISTANCE: f64 = 0.01;
const HELD_CORNER_FACTOR: f64 = 1.5;

/// Snap thresholds, tweakable per editor.
#[derive(Debug, Clone, Copy)]
pub struct SnapConfig {
    pub snap_distance: f64,
    pub wall_offset: f64,
    pub corner_snap_distance: f64,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            snap_distance: SNAP_DISTANCE,
            wall_offset: WALL_OFFSET,
            corner_snap_distance: CORNER_SNAP_DISTANCE,
        }
    }
}

/// Which local face of a wall a candidate snaps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapFace {
    /// +depth side of the wall.
    Front,
    /// -depth side of the wall.
    Back,
    /// +width side of the wall.
    Right,
    /// -width side of the wall.
    Left,
    /// Simultaneous snap against two perpendicular walls.
    Corner,
}

impl SnapFace {
    /// True for the faces along the wall's depth axis.
    pub fn is_depth_face(self) -> bool {
        matches!(self, SnapFace::Front | SnapFace::Back)
    }
}

/// Result of a snap query. Ephemeral: recomputed every drag frame, never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapResult {
    /// The wall being snapped to.
    pub wall: WallId,
    /// Second wall for a corner snap.
    pub wall2: Option<WallId>,
    /// Position that places the object's edge `wall_offset` beyond the face.
    pub position: DVec3,
    pub face: SnapFace,
    /// Distance from the candidate's edge to the face. Corner snaps report 0
    /// so they always win tie-breaks.
    pub distance: f64,
    pub is_corner_snap: bool,
}

/// World axis constrained by a face candidate, used to combine two
/// perpendicular candidates into a corner position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorldAxis {
    X,
    Z,
}

#[derive(Debug, Clone, Copy)]
struct FaceCandidate {
    wall: WallId,
    wall_yaw: f64,
    face: SnapFace,
    position: DVec3,
    distance: f64,
}

/// Find the nearest valid snap for an object footprint at `position` with
/// total yaw `yaw`, or `None` when no wall is in range.
///
/// Tie-break: corner > nearest face > no snap. Degenerate inputs (no walls,
/// footprint below epsilon) yield `None`, never an error.
pub fn resolve_snap(
    position: DVec3,
    yaw: f64,
    footprint: Dimensions,
    walls: &[Wall],
    config: &SnapConfig,
) -> Option<SnapResult> {
    if walls.is_empty() || footprint.width < MIN_DIMENSION || footprint.depth < MIN_DIMENSION {
        return None;
    }

    let half_width = footprint.width / 2.0;
    let half_depth = footprint.depth / 2.0;

    let mut candidates = Vec::new();

    for wall in walls {
        let wall_half_width = wall.dimensions.width / 2.0;
        let wall_half_depth = wall.dimensions.depth / 2.0;
        let cos = wall.rotation.cos();
        let sin = wall.rotation.sin();

        // Object center in the wall's local frame.
        let rel_x = position.x - wall.position.x;
        let rel_z = position.z - wall.position.z;
        let local_x = rel_x * cos + rel_z * sin;
        let local_z = -rel_x * sin + rel_z * cos;

        // Footprint half-extents as seen by this wall: project through the
        // relative yaw (rotated-rectangle projection).
        let relative_yaw = yaw - wall.rotation;
        let rel_cos = relative_yaw.cos();
        let rel_sin = relative_yaw.sin();
        let rotated_half_width = (half_width * rel_cos).abs() + (half_depth * rel_sin).abs();
        let rotated_half_depth = (half_width * rel_sin).abs() + (half_depth * rel_cos).abs();

        let to_world = |lx: f64, lz: f64| {
            DVec3::new(
                wall.position.x + (lx * cos - lz * sin),
                position.y,
                wall.position.z + (lx * sin + lz * cos),
            )
        };

        // Faces along the wall's depth axis.
        if local_x.abs() <= wall_half_width + rotated_half_width {
            let near_edge = local_z - rotated_half_depth;
            let front_distance = (near_edge - wall_half_depth).abs();
            if near_edge > wall_half_depth && front_distance < config.snap_distance {
                let snap_z = wall_half_depth + config.wall_offset + rotated_half_depth;
                candidates.push(FaceCandidate {
                    wall: wall.id,
                    wall_yaw: wall.rotation,
                    face: SnapFace::Front,
                    position: to_world(local_x, snap_z),
                    distance: front_distance,
                });
            }

            let far_edge = local_z + rotated_half_depth;
            let back_distance = (far_edge + wall_half_depth).abs();
            if far_edge < -wall_half_depth && back_distance < config.snap_distance {
                let snap_z = -wall_half_depth - config.wall_offset - rotated_half_depth;
                candidates.push(FaceCandidate {
                    wall: wall.id,
                    wall_yaw: wall.rotation,
                    face: SnapFace::Back,
                    position: to_world(local_x, snap_z),
                    distance: back_distance,
                });
            }
        }

        // Faces along the wall's width axis.
        if local_z.abs() <= wall_half_depth + rotated_half_depth {
            let near_edge = local_x - rotated_half_width;
            let right_distance = (near_edge - wall_half_width).abs();
            if near_edge > wall_half_width && right_distance < config.snap_distance {
                let snap_x = wall_half_width + config.wall_offset + rotated_half_width;
                candidates.push(FaceCandidate {
                    wall: wall.id,
                    wall_yaw: wall.rotation,
                    face: SnapFace::Right,
                    position: to_world(snap_x, local_z),
                    distance: right_distance,
                });
            }

            let far_edge = local_x + rotated_half_width;
            let left_distance = (far_edge + wall_half_width).abs();
            if far_edge < -wall_half_width && left_distance < config.snap_distance {
                let snap_x = -wall_half_width - config.wall_offset - rotated_half_width;
                candidates.push(FaceCandidate {
                    wall: wall.id,
                    wall_yaw: wall.rotation,
                    face: SnapFace::Left,
                    position: to_world(snap_x, local_z),
                    distance: left_distance,
                });
            }
        }
    }

    if let Some(corner) = resolve_corner(position, &candidates, config) {
        return Some(corner);
    }

    candidates
        .iter()
        .min_by(|a, b| a.distance.total_cmp(&b.distance))
        .map(|c| SnapResult {
            wall: c.wall,
            wall2: None,
            position: c.position,
            face: c.face,
            distance: c.distance,
            is_corner_snap: false,
        })
}

/// Corner pass: combine two perpendicular face candidates into a single
/// position satisfying both walls' offset constraints.
fn resolve_corner(
    position: DVec3,
    candidates: &[FaceCandidate],
    config: &SnapConfig,
) -> Option<SnapResult> {
    // Eligible: flush candidates first (so a held snap can slide into a
    // corner), then anything inside the corner radius. Dedup per wall+face.
    let mut eligible: Vec<&FaceCandidate> = Vec::new();
    let mut seen: Vec<(WallId, SnapFace)> = Vec::new();
    let flush = candidates.iter().filter(|c| c.distance < FLUSH_DISTANCE);
    let near = candidates
        .iter()
        .filter(|c| c.distance < config.corner_snap_distance);
    for candidate in flush.chain(near) {
        let key = (candidate.wall, candidate.face);
        if !seen.contains(&key) {
            seen.push(key);
            eligible.push(candidate);
        }
    }

    if eligible.len() < 2 {
        return None;
    }

    for i in 0..eligible.len() {
        for j in (i + 1)..eligible.len() {
            let a = eligible[i];
            let b = eligible[j];

            if !is_right_angle(a.wall_yaw, b.wall_yaw) {
                continue;
            }

            // Each candidate must pin a different world axis; which axis a
            // face pins depends on the wall's own orientation.
            let (axis_a, axis_b) = match (
                axis_constraint(a.wall_yaw, a.face),
                axis_constraint(b.wall_yaw, b.face),
            ) {
                (Some(x), Some(y)) => (x, y),
                // Walls off every axis bucket never form a corner.
                _ => continue,
            };
            if axis_a == axis_b {
                continue;
            }

            let (corner_x, corner_z) = if axis_a == WorldAxis::X {
                (a.position.x, b.position.z)
            } else {
                (b.position.x, a.position.z)
            };
            let corner = DVec3::new(corner_x, position.y, corner_z);

            let corner_distance =
                ((corner.x - position.x).powi(2) + (corner.z - position.z).powi(2)).sqrt();
            let held = a.distance < HELD_SNAP_DISTANCE || b.distance < HELD_SNAP_DISTANCE;
            let threshold = if held {
                config.corner_snap_distance * HELD_CORNER_FACTOR
            } else {
                config.corner_snap_distance
            };

            if corner_distance < threshold {
                return Some(SnapResult {
                    wall: a.wall,
                    wall2: Some(b.wall),
                    position: corner,
                    face: SnapFace::Corner,
                    distance: 0.0,
                    is_corner_snap: true,
                });
            }
        }
    }

    None
}

/// Two walls form a corner when their yaw difference is an odd multiple of
/// 90 degrees, within tolerance.
fn is_right_angle(yaw_a: f64, yaw_b: f64) -> bool {
    let diff = (yaw_a - yaw_b).abs() % TAU;
    (diff - FRAC_PI_2).abs() < RIGHT_ANGLE_TOLERANCE
        || (diff - 3.0 * FRAC_PI_2).abs() < RIGHT_ANGLE_TOLERANCE
}

/// Which world axis a face candidate constrains, from the wall's yaw bucket.
/// Walls at arbitrary non-axis angles return `None` (no corner snap).
fn axis_constraint(wall_yaw: f64, face: SnapFace) -> Option<WorldAxis> {
    let near = |angle: f64, target: f64| {
        let d = (angle - target).abs();
        d < RIGHT_ANGLE_TOLERANCE || (TAU - d) < RIGHT_ANGLE_TOLERANCE
    };
    let normalized = wall_yaw.rem_euclid(TAU);

    let x_aligned = near(normalized, 0.0) || near(normalized, PI);
    let z_aligned = near(normalized, FRAC_PI_2) || near(normalized, 3.0 * FRAC_PI_2);

    if x_aligned {
        // Depth faces of an X-aligned wall pin Z; width faces pin X.
        Some(if face.is_depth_face() {
            WorldAxis::Z
        } else {
            WorldAxis::X
        })
    } else if z_aligned {
        Some(if face.is_depth_face() {
            WorldAxis::X
        } else {
            WorldAxis::Z
        })
    } else {
        None
    }
}
