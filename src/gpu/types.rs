//! Backend-agnostic GPU descriptors.
//!
//! Handles are generation-checked `slotmap` keys issued by the device
//! registry; a destroyed handle never aliases a live resource.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use smallvec::SmallVec;

new_key_type! {
    pub struct BufferHandle;
    pub struct ImageHandle;
    pub struct ShaderModuleHandle;
    pub struct DescriptorSetLayoutHandle;
    pub struct PipelineLayoutHandle;
    pub struct ProgramHandle;
}

/// Size sentinel meaning "to the end of the buffer".
pub const WHOLE_SIZE: u64 = u64::MAX;

// ============================================================================
// Buffers
// ============================================================================

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM      = 1 << 2;
        const STORAGE      = 1 << 3;
        const INDEX        = 1 << 4;
        const VERTEX       = 1 << 5;
        const INDIRECT     = 1 << 6;
    }
}

impl fmt::Display for BufferUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join(" | "))
    }
}

/// Where a buffer's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryDomain {
    /// Resolved by the buffer loader from the usage flags.
    Auto,
    /// GPU-local; writes go through transfer commands.
    #[default]
    Device,
    /// Host-visible, write-combined; written through a mapping.
    Upload,
    /// Host-visible and cached; suitable for readback.
    Host,
}

impl MemoryDomain {
    #[inline]
    #[must_use]
    pub fn is_host_visible(self) -> bool {
        matches!(self, MemoryDomain::Upload | MemoryDomain::Host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: BufferUsage,
    pub domain: MemoryDomain,
}

// ============================================================================
// Images
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Format {
    #[default]
    Undefined,
    R8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Rg32Float,
    Rgb32Float,
    R32Uint,
    Rg32Uint,
    Rgb32Uint,
    Rgba32Uint,
    R32Sint,
    Rg32Sint,
    Rgb32Sint,
    Rgba32Sint,
}

impl Format {
    /// Size of one texel or vertex element in bytes.
    #[must_use]
    pub fn block_size(self) -> u32 {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::Rgba8Unorm | Format::Rgba8Srgb | Format::R32Float | Format::R32Uint | Format::R32Sint => 4,
            Format::Rgba16Float | Format::Rg32Float | Format::Rg32Uint | Format::Rg32Sint => 8,
            Format::Rgb32Float | Format::Rgb32Uint | Format::Rgb32Sint => 12,
            Format::Rgba32Float | Format::Rgba32Uint | Format::Rgba32Sint => 16,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_srgb(self) -> bool {
        matches!(self, Format::Rgba8Srgb)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    #[must_use]
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self { width, height, depth: 1 }
    }

    /// Extent of mip `level`, clamped to one texel per axis.
    #[must_use]
    pub fn mip_level(self, level: u32) -> Self {
        Self {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
            depth: (self.depth >> level).max(1),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED      = 1 << 2;
        const STORAGE      = 1 << 3;
        const ATTACHMENT   = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCreateInfo {
    pub extent: Extent3d,
    pub format: Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: ImageUsage,
    pub cube_compatible: bool,
}

impl Default for ImageCreateInfo {
    fn default() -> Self {
        Self {
            extent: Extent3d::new_2d(1, 1),
            format: Format::Rgba8Unorm,
            mip_levels: 1,
            array_layers: 1,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            cube_compatible: false,
        }
    }
}

// ============================================================================
// Shaders & Pipelines
// ============================================================================

/// Programmable stages, ordered by their serialized id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShaderStage {
    Vertex = 0,
    Task = 1,
    Mesh = 2,
    Fragment = 3,
    Compute = 4,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 5] = [
        ShaderStage::Vertex,
        ShaderStage::Task,
        ShaderStage::Mesh,
        ShaderStage::Fragment,
        ShaderStage::Compute,
    ];

    #[inline]
    #[must_use]
    pub fn id(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    #[must_use]
    pub fn flag(self) -> ShaderStageFlags {
        match self {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::Task => ShaderStageFlags::TASK,
            ShaderStage::Mesh => ShaderStageFlags::MESH,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Task => "task",
            ShaderStage::Mesh => "mesh",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX   = 1 << 0;
        const TASK     = 1 << 1;
        const MESH     = 1 << 2;
        const FRAGMENT = 1 << 3;
        const COMPUTE  = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineType {
    Geometry,
    Mesh,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    CombinedImageSampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    pub count: u32,
    pub stages: ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
    pub stages: ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VertexBindingLayout {
    pub binding: u32,
    pub stride: u32,
}

/// Vertex input layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VertexInput {
    pub bindings: SmallVec<[VertexBindingLayout; 2]>,
    pub attributes: SmallVec<[VertexAttribute; 4]>,
}

impl VertexInput {
    /// Two-stream layout used by loaded geometry: `vec4` positions in slot 0
    /// and interleaved `normal.xyz + uv` in slot 1.
    #[must_use]
    pub fn position_attribute() -> Self {
        let mut input = Self::default();
        input.bindings.push(VertexBindingLayout { binding: 0, stride: 16 });
        input.bindings.push(VertexBindingLayout { binding: 1, stride: 20 });
        input.attributes.push(VertexAttribute { location: 0, binding: 0, format: Format::Rgba32Float, offset: 0 });
        input.attributes.push(VertexAttribute { location: 1, binding: 1, format: Format::Rgb32Float, offset: 0 });
        input.attributes.push(VertexAttribute { location: 2, binding: 1, format: Format::Rg32Float, offset: 12 });
        input
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndexType {
    #[default]
    U16,
    U32,
}

impl IndexType {
    #[inline]
    #[must_use]
    pub fn for_vertex_count(vertex_count: usize) -> Self {
        if vertex_count > u16::MAX as usize {
            IndexType::U32
        } else {
            IndexType::U16
        }
    }

    #[inline]
    #[must_use]
    pub fn size(self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

// ============================================================================
// Device capabilities & transfers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub mesh_shading: bool,
    pub max_bound_descriptor_sets: u32,
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        Self {
            mesh_shading: false,
            max_bound_descriptor_sets: 4,
        }
    }
}

/// Transfer work executed by [`GpuDevice::submit_and_wait`](super::GpuDevice::submit_and_wait).
#[derive(Debug, Clone, PartialEq)]
pub enum TransferCommand {
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    /// Small inline update recorded straight into the command stream.
    UpdateBuffer {
        dst: BufferHandle,
        dst_offset: u64,
        data: Vec<u8>,
    },
    CopyBufferToImage {
        src: BufferHandle,
        src_offset: u64,
        dst: ImageHandle,
        mip_level: u32,
        array_layer: u32,
    },
}
