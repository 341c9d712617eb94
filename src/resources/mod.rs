//! Format loaders and the [`ResourceLoader`] that owns their output.
//!
//! - [`buffer`]: raw GPU buffers, staged or mapped
//! - [`image`]: PNG/JPEG images with mips, cubemaps and a de-dup cache
//! - [`geometry`]: glTF meshes clustered into meshlets
//! - [`shader`]: WGSL/SPIR-V programs with a single-flight compile cache
//! - [`loader`]: the typed front door over all of the above

pub mod buffer;
pub mod geometry;
#[cfg(feature = "gltf")]
pub mod gltf_mesh;
pub mod image;
pub mod loader;
pub mod shader;

use std::time::{SystemTime, UNIX_EPOCH};

pub use buffer::{
    BufferAsset, BufferContentType, BufferLoadInfo, BufferLoader, BufferRange, BufferUpdateInfo,
    LIMIT_BUFFER_CMD_UPDATE_SIZE, LIMIT_BUFFER_UPLOAD_SIZE,
};
pub use geometry::{
    GeometryAsset, GeometryAttributeFlags, GeometryFeatureFlags, GeometryLoadInfo, GeometryLoader,
    GeometryOptimizationFlags, GeometryStats, GeometryUsage, MeshletFeatureFlags,
};
pub use image::{
    ImageAsset, ImageCache, ImageContainerType, ImageData, ImageFeatureFlags, ImageLoadInfo, ImageLoader, ImageSource,
};
pub use loader::{AssetSlot, LoadInfo, LoadRequest, ResourceLoader, ResourceLoaderCreateInfo};
pub use shader::{
    CompileRequest, CompiledStage, ReflectionResult, ShaderAsset, ShaderCache, ShaderCompiler, ShaderContainerType,
    ShaderLoadInfo, ShaderLoader,
};

/// Nanoseconds since the Unix epoch; zero if the clock is before it.
pub(crate) fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}
