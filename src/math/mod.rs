//! Bounding-volume math used for culling metadata.

pub mod bounds;

pub use bounds::{BoundingBox, BoundingSphere, Frustum};
