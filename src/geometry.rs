//! Spatial primitives shared by every navigation component.
//!
//! Positions are AI2-THOR world coordinates in meters. The floor is the x/z plane and y is
//! fixed for a given scene, so every distance used for navigation decisions is planar.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// A 3D world position.
///
/// Internally uses [`nalgebra::Vector3<f32>`] for downstream math convenience.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position(pub Vector3<f32>);

impl Position {
    /// Convenience constructor.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self(Vector3::new(x, y, z))
    }

    /// A floor position at height zero.
    pub fn planar(x: f32, z: f32) -> Self {
        Self::new(x, 0.0, z)
    }

    pub fn x(&self) -> f32 {
        self.0.x
    }

    pub fn y(&self) -> f32 {
        self.0.y
    }

    pub fn z(&self) -> f32 {
        self.0.z
    }

    /// Distance on the floor plane, ignoring height.
    pub fn planar_distance(&self, other: &Position) -> f32 {
        (other.x() - self.x()).hypot(other.z() - self.z())
    }

    /// World yaw (degrees) of the direction from `self` towards `other`.
    ///
    /// Yaw 0 faces +z and increases clockwise seen from above, matching the simulator's
    /// `RotateRight` direction.
    pub fn heading_to(&self, other: &Position) -> f32 {
        (other.x() - self.x()).atan2(other.z() - self.z()).to_degrees()
    }

    /// Moves `distance` meters along `yaw` on the floor plane, keeping the height.
    pub fn advanced(&self, yaw: f32, distance: f32) -> Position {
        let rad = yaw.to_radians();
        Position::new(
            self.x() + distance * rad.sin(),
            self.y(),
            self.z() + distance * rad.cos(),
        )
    }

    /// Linear interpolation on all three axes.
    pub fn lerp(&self, other: &Position, t: f32) -> Position {
        Position(self.0 + (other.0 - self.0) * t)
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|c| c.is_finite())
    }
}

/// A full agent pose: where it stands, where it faces and where it looks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Position,
    /// Body yaw in degrees, kept in `[0, 360)`.
    pub yaw: f32,
    /// Camera pitch in degrees; positive values look down.
    pub horizon: f32,
}

impl Pose {
    pub fn new(position: Position, yaw: f32, horizon: f32) -> Self {
        Self {
            position,
            yaw: wrap_degrees(yaw),
            horizon,
        }
    }

    /// Signed rotation (degrees, `-180..=180`) needed to face `target`.
    ///
    /// Positive means rotate right.
    pub fn heading_error_to(&self, target: &Position) -> f32 {
        normalize_angle(self.position.heading_to(target) - self.yaw)
    }
}

/// Normalizes an angle to `(-180, 180]`.
pub fn normalize_angle(angle: f32) -> f32 {
    let mut a = angle % 360.0;
    if a > 180.0 {
        a -= 360.0;
    } else if a <= -180.0 {
        a += 360.0;
    }
    a
}

/// Wraps an angle into `[0, 360)`.
pub fn wrap_degrees(angle: f32) -> f32 {
    let a = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if a >= 360.0 {
        0.0
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_follows_simulator_convention() {
        let origin = Position::planar(0.0, 0.0);
        assert!((origin.heading_to(&Position::planar(0.0, 1.0)) - 0.0).abs() < 1e-4);
        assert!((origin.heading_to(&Position::planar(1.0, 0.0)) - 90.0).abs() < 1e-4);
        assert!((origin.heading_to(&Position::planar(-1.0, 0.0)) + 90.0).abs() < 1e-4);
    }

    #[test]
    fn normalize_angle_wraps_into_half_open_range() {
        assert_eq!(normalize_angle(190.0), -170.0);
        assert_eq!(normalize_angle(-190.0), 170.0);
        assert_eq!(normalize_angle(180.0), 180.0);
        assert_eq!(normalize_angle(-180.0), 180.0);
        assert_eq!(normalize_angle(720.0), 0.0);
    }

    #[test]
    fn heading_error_picks_shortest_turn() {
        let pose = Pose::new(Position::planar(0.0, 0.0), 350.0, 0.0);
        let err = pose.heading_error_to(&Position::planar(1.0, 0.0));
        assert!((err - 100.0).abs() < 1e-3, "err = {err}");
    }

    #[test]
    fn advanced_moves_along_yaw_on_the_floor() {
        let p = Position::new(0.0, 0.9, 0.0).advanced(90.0, 0.25);
        assert!((p.x() - 0.25).abs() < 1e-5);
        assert!(p.z().abs() < 1e-5);
        assert_eq!(p.y(), 0.9);
    }
}
