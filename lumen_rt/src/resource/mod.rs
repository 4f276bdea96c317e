//! Resource module
//!
//! Storage for the scene's geometry and its bottom-level indices.

pub mod geometry;

pub use geometry::{Geometry, GeometryDesc, GeometryId, GeometryKind, GeometryStore};
