//! Asset handles and storage.
//!
//! Every loaded asset lives in an [`AssetStorage`] arena owned by the
//! [`ResourceLoader`](crate::resources::ResourceLoader) and is addressed by
//! a strongly-typed, generation-checked handle.

pub mod storage;

use slotmap::new_key_type;

pub use storage::AssetStorage;

// Strongly-typed handles
new_key_type! {
    pub struct BufferAssetHandle;
    pub struct ImageAssetHandle;
    pub struct GeometryAssetHandle;
    pub struct ShaderAssetHandle;
}

/// Type-erased handle, the key of the loader's unload table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetHandle {
    Buffer(BufferAssetHandle),
    Image(ImageAssetHandle),
    Geometry(GeometryAssetHandle),
    Shader(ShaderAssetHandle),
}

impl From<BufferAssetHandle> for AssetHandle {
    fn from(h: BufferAssetHandle) -> Self {
        AssetHandle::Buffer(h)
    }
}

impl From<ImageAssetHandle> for AssetHandle {
    fn from(h: ImageAssetHandle) -> Self {
        AssetHandle::Image(h)
    }
}

impl From<GeometryAssetHandle> for AssetHandle {
    fn from(h: GeometryAssetHandle) -> Self {
        AssetHandle::Geometry(h)
    }
}

impl From<ShaderAssetHandle> for AssetHandle {
    fn from(h: ShaderAssetHandle) -> Self {
        AssetHandle::Shader(h)
    }
}
