//! Shared math and geometry primitives used by the tilenav runtime crates.

mod geometry;
mod math;

pub use geometry::*;
pub use math::*;

/// 3D position type used at API boundaries that favour vector arithmetic.
pub type Vec3 = glam::Vec3;
