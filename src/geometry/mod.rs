//! Meshlet clustering and the drawable geometry abstraction.

pub mod meshlet;
pub mod resource;

pub use meshlet::{
    DEFAULT_MAX_PRIMS_PER_MESHLET, DEFAULT_MAX_VERTS_PER_MESHLET, Meshlet, MeshletBuilder, MeshletData, Submesh,
};
pub use resource::{
    GeometryGpuData, GeometryResource, GeometryResourceFactory, IndexRange, MeshletGeometryResource,
    MeshletPushConstants, VertexGeometryResource,
};
