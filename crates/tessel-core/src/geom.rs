//! World geometry: positions and the fixed region grid.
//!
//! The world is cut into square columns of [`REGION_SIZE`] units on the
//! X/Z plane. A [`RegionCoord`] names one column; every position maps to
//! exactly one of them, including negative coordinates (floor division).

use smallvec::SmallVec;
use std::fmt;
use std::ops::{Add, Mul};

/// Edge length of a region, in world units.
pub const REGION_SIZE: f64 = 16.0;

/// A position or velocity in world space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec3 {
    /// East/west axis.
    pub x: f64,
    /// Vertical axis.
    pub y: f64,
    /// North/south axis.
    pub z: f64,
}

impl Vec3 {
    /// The origin / zero vector.
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    /// Construct a vector from its components.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean length.
    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Whether every component is finite.
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Grid coordinate of a region column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionCoord {
    /// Column index along X.
    pub x: i32,
    /// Column index along Z.
    pub z: i32,
}

impl RegionCoord {
    /// Construct a region coordinate.
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The region containing `pos`.
    ///
    /// Non-finite positions map to the origin region rather than
    /// saturating at the grid edge.
    pub fn containing(pos: Vec3) -> Self {
        if !pos.is_finite() {
            return Self::new(0, 0);
        }
        Self {
            x: (pos.x / REGION_SIZE).floor() as i32,
            z: (pos.z / REGION_SIZE).floor() as i32,
        }
    }

    /// World-space position of this region's minimum corner (at y = 0).
    pub fn origin(self) -> Vec3 {
        Vec3::new(
            f64::from(self.x) * REGION_SIZE,
            0.0,
            f64::from(self.z) * REGION_SIZE,
        )
    }

    /// The 8 surrounding regions (Moore neighbourhood).
    pub fn neighbours(self) -> SmallVec<[RegionCoord; 8]> {
        let mut out = SmallVec::new();
        for dx in -1..=1 {
            for dz in -1..=1 {
                if dx == 0 && dz == 0 {
                    continue;
                }
                out.push(RegionCoord::new(self.x + dx, self.z + dz));
            }
        }
        out
    }
}

impl fmt::Display for RegionCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}
