//! # Myth Loader
//!
//! Asset ingestion and resource lifecycle for the Myth engine:
//!
//! - a meshlet builder that clusters triangle meshes for GPU culling
//! - a geometry resource that draws either through the classic indexed
//!   path or through mesh shaders, picked once from device capability
//! - loaders for buffers, images, geometry and shader programs behind one
//!   [`ResourceLoader`], with batched asynchronous loading
//! - a shader compile cache that compiles each request at most once
//!
//! The GPU is reached only through [`gpu::GpuDevice`] and
//! [`gpu::CommandRecorder`]; [`gpu::HeadlessDevice`] keeps everything in
//! host memory for tools and tests.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod assets;
pub mod errors;
pub mod geometry;
pub mod gpu;
pub mod math;
pub mod resources;
pub mod tasks;

pub use errors::{LoaderError, Result};
pub use geometry::{GeometryResource, GeometryResourceFactory, Meshlet, MeshletBuilder, Submesh};
pub use gpu::{CommandRecorder, DeviceFeatures, GpuDevice, HeadlessDevice};
pub use math::{BoundingBox, BoundingSphere, Frustum};
pub use resources::{
    BufferLoadInfo, GeometryLoadInfo, ImageLoadInfo, LoadRequest, ResourceLoader, ResourceLoaderCreateInfo,
    ShaderLoadInfo,
};
pub use tasks::{TaskFuture, TaskGroup, TaskManager};
