//! Transform
//!
//! Scale/rotation/translation transform used to place a virtual texture
//! volume in the world.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Transform component for positioning a volume in 3D space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// World position
    pub position: Vec3,
    /// World rotation
    pub rotation: Quat,
    /// World scale
    pub scale: Vec3,
}

impl Transform {
    /// Identity transform
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    /// Create a new transform from all components
    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Create a transform with the given position and scale
    pub fn from_position_scale(position: Vec3, scale: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
            scale,
        }
    }

    /// Local X axis in world space, normalized
    pub fn unit_axis_x(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Local Y axis in world space, normalized
    pub fn unit_axis_y(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    /// Local Z axis in world space, normalized
    pub fn unit_axis_z(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }

    /// Transform a point from local to world space
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.position + self.rotation * (point * self.scale)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}
