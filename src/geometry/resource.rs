//! Geometry Resources
//!
//! A built geometry is drawn one of two ways:
//!
//! - **Vertex**: classic indexed drawing. The index buffer is laid out in
//!   meshlet order, so every submesh maps to one contiguous index range.
//! - **Meshlet**: mesh-shader dispatch, one task group per meshlet.
//!
//! [`GeometryResourceFactory::create`] is the only place the choice is made.

use bytemuck::{Pod, Zeroable};

use crate::gpu::{BufferHandle, CommandRecorder, DeviceFeatures, IndexType, ShaderStageFlags, VertexInput};
use crate::math::BoundingBox;

use super::meshlet::{Meshlet, Submesh};

/// Buffers and counts shared by both geometry paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryGpuData {
    pub position_buffer: BufferHandle,
    pub attribute_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub meshlet_buffer: BufferHandle,
    pub meshlet_vertex_buffer: BufferHandle,
    pub meshlet_index_buffer: BufferHandle,

    pub vertex_count: u32,
    pub index_count: u32,
    pub meshlet_count: u32,
    pub meshlet_max_vertex_count: u32,
    pub meshlet_max_triangle_count: u32,
    pub index_type: IndexType,
}

impl GeometryGpuData {
    /// All six buffers, in creation order.
    #[must_use]
    pub fn buffers(&self) -> [BufferHandle; 6] {
        [
            self.position_buffer,
            self.attribute_buffer,
            self.index_buffer,
            self.meshlet_buffer,
            self.meshlet_vertex_buffer,
            self.meshlet_index_buffer,
        ]
    }
}

/// Push-constant block consumed by the meshlet task/mesh shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MeshletPushConstants {
    pub meshlet_offset: u32,
    pub max_vertex_count: u32,
    pub max_triangle_count: u32,
}

const MESHLET_PUSH_STAGES: ShaderStageFlags = ShaderStageFlags::MESH.union(ShaderStageFlags::TASK);

/// A contiguous slice of the index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexRange {
    pub first_index: u32,
    pub index_count: u32,
}

fn union_bounds(submeshes: &[Submesh]) -> BoundingBox {
    submeshes.iter().fold(BoundingBox::EMPTY, |acc, s| acc.union(&s.bounds))
}

// ============================================================================
// Vertex path
// ============================================================================

#[derive(Debug, Clone)]
pub struct VertexGeometryResource {
    gpu_data: GeometryGpuData,
    submeshes: Vec<Submesh>,
    index_ranges: Vec<IndexRange>,
    vertex_input: VertexInput,
    bounding_box: BoundingBox,
}

impl VertexGeometryResource {
    #[must_use]
    pub fn new(gpu_data: GeometryGpuData, submeshes: Vec<Submesh>, meshlets: &[Meshlet], vertex_input: VertexInput) -> Self {
        let index_ranges = submeshes
            .iter()
            .map(|s| {
                let run = meshlets.get(s.meshlet_range()).unwrap_or_default();
                IndexRange {
                    first_index: run.first().map_or(0, |m| m.triangle_offset * 3),
                    index_count: run.iter().map(|m| m.triangle_count * 3).sum(),
                }
            })
            .collect();

        let bounding_box = union_bounds(&submeshes);
        Self {
            gpu_data,
            submeshes,
            index_ranges,
            vertex_input,
            bounding_box,
        }
    }

    pub fn bind(&self, cmd: &mut dyn CommandRecorder) {
        cmd.set_vertex_input(&self.vertex_input);
        cmd.bind_vertex_buffers(0, &[self.gpu_data.position_buffer, self.gpu_data.attribute_buffer]);
        cmd.bind_index_buffer(self.gpu_data.index_buffer, 0, self.gpu_data.index_type);
    }

    pub fn draw(&self, cmd: &mut dyn CommandRecorder, submesh_index: usize, instance_count: u32) {
        let Some(range) = self.index_ranges.get(submesh_index) else {
            log::error!(
                "Submesh index {submesh_index} out of range ({} submeshes)",
                self.index_ranges.len()
            );
            return;
        };
        cmd.draw_indexed(range.index_count, instance_count, range.first_index, 0, 0);
    }

    #[must_use]
    pub fn index_range(&self, submesh_index: usize) -> Option<IndexRange> {
        self.index_ranges.get(submesh_index).copied()
    }

    #[must_use]
    pub fn vertex_input(&self) -> &VertexInput {
        &self.vertex_input
    }
}

// ============================================================================
// Meshlet path
// ============================================================================

#[derive(Debug, Clone)]
pub struct MeshletGeometryResource {
    gpu_data: GeometryGpuData,
    submeshes: Vec<Submesh>,
    bounding_box: BoundingBox,
}

impl MeshletGeometryResource {
    #[must_use]
    pub fn new(gpu_data: GeometryGpuData, submeshes: Vec<Submesh>) -> Self {
        let bounding_box = union_bounds(&submeshes);
        Self {
            gpu_data,
            submeshes,
            bounding_box,
        }
    }

    fn push_constants(&self, meshlet_offset: u32) -> MeshletPushConstants {
        MeshletPushConstants {
            meshlet_offset,
            max_vertex_count: self.gpu_data.meshlet_max_vertex_count,
            max_triangle_count: self.gpu_data.meshlet_max_triangle_count,
        }
    }

    pub fn bind(&self, cmd: &mut dyn CommandRecorder) {
        let constants = self.push_constants(0);
        cmd.push_constants(MESHLET_PUSH_STAGES, 0, bytemuck::bytes_of(&constants));
    }

    pub fn draw(&self, cmd: &mut dyn CommandRecorder, submesh_index: usize, instance_count: u32) {
        if !cmd.supports_mesh_shading() {
            log::error!("Meshlet geometry drawn on a recorder without mesh shading support");
            debug_assert!(false, "mesh shading unsupported");
            return;
        }
        let Some(submesh) = self.submeshes.get(submesh_index) else {
            log::error!(
                "Submesh index {submesh_index} out of range ({} submeshes)",
                self.submeshes.len()
            );
            debug_assert!(false, "submesh index out of range");
            return;
        };
        if instance_count != 1 {
            log::trace!("Meshlet dispatch ignores instance_count {instance_count}");
        }

        let constants = self.push_constants(submesh.meshlet_offset);
        cmd.push_constants(MESHLET_PUSH_STAGES, 0, bytemuck::bytes_of(&constants));
        cmd.draw_mesh_tasks(submesh.meshlet_count, 1, 1);
    }
}

// ============================================================================
// Closed enum
// ============================================================================

#[derive(Debug, Clone)]
pub enum GeometryResource {
    Vertex(VertexGeometryResource),
    Meshlet(MeshletGeometryResource),
}

impl GeometryResource {
    #[inline]
    fn gpu(&self) -> &GeometryGpuData {
        match self {
            GeometryResource::Vertex(v) => &v.gpu_data,
            GeometryResource::Meshlet(m) => &m.gpu_data,
        }
    }

    #[inline]
    fn submesh_slice(&self) -> &[Submesh] {
        match self {
            GeometryResource::Vertex(v) => &v.submeshes,
            GeometryResource::Meshlet(m) => &m.submeshes,
        }
    }

    pub fn bind(&self, cmd: &mut dyn CommandRecorder) {
        match self {
            GeometryResource::Vertex(v) => v.bind(cmd),
            GeometryResource::Meshlet(m) => m.bind(cmd),
        }
    }

    pub fn draw(&self, cmd: &mut dyn CommandRecorder, submesh_index: usize, instance_count: u32) {
        match self {
            GeometryResource::Vertex(v) => v.draw(cmd, submesh_index, instance_count),
            GeometryResource::Meshlet(m) => m.draw(cmd, submesh_index, instance_count),
        }
    }

    #[must_use]
    pub fn supports_mesh_shading(&self) -> bool {
        matches!(self, GeometryResource::Meshlet(_))
    }

    #[must_use]
    pub fn gpu_data(&self) -> &GeometryGpuData {
        self.gpu()
    }

    #[must_use]
    pub fn submesh_count(&self) -> usize {
        self.submesh_slice().len()
    }

    #[must_use]
    pub fn submesh(&self, index: usize) -> Option<&Submesh> {
        self.submesh_slice().get(index)
    }

    pub fn submeshes(&self) -> impl ExactSizeIterator<Item = &Submesh> + '_ {
        self.submesh_slice().iter()
    }

    #[must_use]
    pub fn bounding_box(&self) -> BoundingBox {
        match self {
            GeometryResource::Vertex(v) => v.bounding_box,
            GeometryResource::Meshlet(m) => m.bounding_box,
        }
    }

    // --- Buffers ---

    #[must_use]
    pub fn position_buffer(&self) -> BufferHandle {
        self.gpu().position_buffer
    }

    #[must_use]
    pub fn attribute_buffer(&self) -> BufferHandle {
        self.gpu().attribute_buffer
    }

    #[must_use]
    pub fn index_buffer(&self) -> BufferHandle {
        self.gpu().index_buffer
    }

    /// `None` on the vertex path.
    #[must_use]
    pub fn meshlet_buffer(&self) -> Option<BufferHandle> {
        self.supports_mesh_shading().then(|| self.gpu().meshlet_buffer)
    }

    #[must_use]
    pub fn meshlet_vertex_buffer(&self) -> Option<BufferHandle> {
        self.supports_mesh_shading().then(|| self.gpu().meshlet_vertex_buffer)
    }

    #[must_use]
    pub fn meshlet_index_buffer(&self) -> Option<BufferHandle> {
        self.supports_mesh_shading().then(|| self.gpu().meshlet_index_buffer)
    }

    // --- Counts ---

    #[must_use]
    pub fn vertex_count(&self) -> u32 {
        self.gpu().vertex_count
    }

    #[must_use]
    pub fn index_count(&self) -> u32 {
        self.gpu().index_count
    }

    #[must_use]
    pub fn meshlet_count(&self) -> u32 {
        self.gpu().meshlet_count
    }

    #[must_use]
    pub fn index_type(&self) -> IndexType {
        self.gpu().index_type
    }
}

pub struct GeometryResourceFactory;

impl GeometryResourceFactory {
    /// Picks the meshlet path iff it is preferred and the device can run it.
    #[must_use]
    pub fn create(
        features: &DeviceFeatures,
        gpu_data: GeometryGpuData,
        submeshes: Vec<Submesh>,
        meshlets: &[Meshlet],
        vertex_input: VertexInput,
        prefer_mesh_shading: bool,
    ) -> GeometryResource {
        if prefer_mesh_shading && features.mesh_shading {
            log::debug!("Creating meshlet geometry ({} meshlets)", gpu_data.meshlet_count);
            GeometryResource::Meshlet(MeshletGeometryResource::new(gpu_data, submeshes))
        } else {
            log::debug!("Creating vertex geometry ({} indices)", gpu_data.index_count);
            GeometryResource::Vertex(VertexGeometryResource::new(gpu_data, submeshes, meshlets, vertex_input))
        }
    }
}
