//! World coordinates used by identities, the task loop and drift supervision.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Continuous world position (entity coordinates).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    /// East/west axis.
    pub x: f64,
    /// Altitude.
    pub y: f64,
    /// North/south axis.
    pub z: f64,
}

impl Vec3 {
    /// Construct a position from its components.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance_to(&self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Distance to `other` ignoring altitude.
    #[must_use]
    pub fn horizontal_distance_to(&self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        (dx * dx + dz * dz).sqrt()
    }

    /// Translate by the given deltas.
    #[must_use]
    pub fn offset(&self, dx: f64, dy: f64, dz: f64) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// Yaw that faces `target` from this position.
    ///
    /// Uses the game's convention where yaw 0 looks toward negative z.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn yaw_towards(&self, target: Self) -> f32 {
        let dx = target.x - self.x;
        let dz = target.z - self.z;
        (-dx).atan2(-dz) as f32
    }
}

impl Display for Vec3 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Integer block coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    /// East/west axis.
    pub x: i32,
    /// Altitude.
    pub y: i32,
    /// North/south axis.
    pub z: i32,
}

impl BlockPos {
    /// Construct a block coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Center point of the block.
    #[must_use]
    pub fn center(&self) -> Vec3 {
        Vec3::new(
            f64::from(self.x) + 0.5,
            f64::from(self.y) + 0.5,
            f64::from(self.z) + 0.5,
        )
    }

    /// Corner of the block as a continuous position.
    #[must_use]
    pub fn as_vec3(&self) -> Vec3 {
        Vec3::new(f64::from(self.x), f64::from(self.y), f64::from(self.z))
    }

    /// Coordinates of the 16x16 column that contains this block.
    #[must_use]
    pub const fn chunk(&self) -> (i32, i32) {
        (self.x.div_euclid(16), self.z.div_euclid(16))
    }
}

impl Display for BlockPos {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}
