//! Geometry Loading
//!
//! Scene file → mesh records → one merged [`MeshletBuilder`] → six GPU
//! buffers → a [`GeometryResource`] picked by device capability.
//!
//! # GPU layout
//!
//! | Buffer | Element | Notes |
//! |--------|---------|-------|
//! | position | `[f32; 4]` | `w = 1` |
//! | attribute | `[f32; 5]` | `normal.xyz, uv` |
//! | index | `u16` / `u32` | meshlet order |
//! | meshlet | [`Meshlet`] | 64 bytes each |
//! | meshlet vertex | `u32` | global vertex ids |
//! | meshlet index | `u32` | local ids, three per triangle |

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;

use crate::errors::{LoaderError, Result};
use crate::geometry::meshlet::permute;
use crate::geometry::{
    DEFAULT_MAX_PRIMS_PER_MESHLET, DEFAULT_MAX_VERTS_PER_MESHLET, GeometryGpuData, GeometryResource,
    GeometryResourceFactory, Meshlet, MeshletBuilder, Submesh,
};
use crate::gpu::{BufferUsage, CommandRecorder, GpuDevice, IndexType, VertexInput};
use crate::math::BoundingBox;

use super::buffer::{BufferAsset, BufferContentType, BufferLoadInfo, BufferLoader};
#[cfg(feature = "gltf")]
use super::gltf_mesh::{MeshRecord, load_mesh_records};
use super::timestamp_now;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GeometryFeatureFlags: u32 {
        const SHADOWS            = 1 << 0;
        const COLLISION          = 1 << 1;
        const STREAMING_PRIORITY = 1 << 2;
        const STRUCTURED_BUFFERS = 1 << 3;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MeshletFeatureFlags: u32 {
        const CULLING_DATA             = 1 << 0;
        const OPTIMIZE_FOR_GPU_CULLING = 1 << 1;
        const PRIMITIVE_ORDERING       = 1 << 2;
        const LOCAL_CLUSTER_FITTING    = 1 << 3;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GeometryOptimizationFlags: u32 {
        const VERTEX_CACHE = 1 << 0;
        const OVERDRAW     = 1 << 1;
        const VERTEX_FETCH = 1 << 2;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GeometryAttributeFlags: u32 {
        const GENERATE_NORMALS    = 1 << 0;
        const GENERATE_TANGENTS   = 1 << 1;
        const QUANTIZE_ATTRIBUTES = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GeometryUsage {
    #[default]
    Static,
    Dynamic,
    Skinned,
    Morph,
}

#[derive(Debug, Clone)]
pub struct GeometryLoadInfo {
    pub path: PathBuf,
    pub debug_name: String,

    /// Carried with the request; no loader stage reads it yet.
    pub feature_flags: GeometryFeatureFlags,
    /// Carried with the request; culling data is always generated.
    pub meshlet_flags: MeshletFeatureFlags,
    pub optimization_flags: GeometryOptimizationFlags,
    pub attribute_flags: GeometryAttributeFlags,

    /// Layout for the vertex path; empty means [`VertexInput::position_attribute`].
    pub vertex_input: VertexInput,

    pub max_verts_per_meshlet: u32,
    pub max_prims_per_meshlet: u32,
    pub prefer_mesh_shading: bool,

    pub usage: GeometryUsage,
    /// No effect: geometry is never cached.
    pub force_uncached: bool,
}

impl Default for GeometryLoadInfo {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            debug_name: String::new(),
            feature_flags: GeometryFeatureFlags::empty(),
            meshlet_flags: MeshletFeatureFlags::CULLING_DATA,
            optimization_flags: GeometryOptimizationFlags::all(),
            attribute_flags: GeometryAttributeFlags::empty(),
            vertex_input: VertexInput::default(),
            max_verts_per_meshlet: DEFAULT_MAX_VERTS_PER_MESHLET,
            max_prims_per_meshlet: DEFAULT_MAX_PRIMS_PER_MESHLET,
            prefer_mesh_shading: true,
            usage: GeometryUsage::Static,
            force_uncached: false,
        }
    }
}

impl GeometryLoadInfo {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            debug_name: path
                .file_stem()
                .map_or_else(|| "geometry".to_string(), |s| s.to_string_lossy().into_owned()),
            path,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeometryStats {
    pub vertex_count: u32,
    pub index_count: u32,
    pub meshlet_count: u32,
    pub triangle_count: u32,
    pub submesh_count: u32,
    pub primitive_count: u32,
}

// ============================================================================
// Asset
// ============================================================================

pub struct GeometryAsset {
    resource: GeometryResource,
    buffers: Vec<BufferAsset>,
    meshlets: Vec<Meshlet>,
    stats: GeometryStats,

    source_path: PathBuf,
    debug_name: String,
    usage: GeometryUsage,
    load_timestamp: u64,
}

impl fmt::Debug for GeometryAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeometryAsset")
            .field("debug_name", &self.debug_name)
            .field("stats", &self.stats)
            .field("mesh_shading", &self.supports_mesh_shading())
            .finish_non_exhaustive()
    }
}

impl GeometryAsset {
    #[must_use]
    pub fn resource(&self) -> &GeometryResource {
        &self.resource
    }

    pub fn bind(&self, cmd: &mut dyn CommandRecorder) {
        self.resource.bind(cmd);
    }

    pub fn draw(&self, cmd: &mut dyn CommandRecorder, submesh_index: usize, instance_count: u32) {
        self.resource.draw(cmd, submesh_index, instance_count);
    }

    pub fn submeshes(&self) -> impl ExactSizeIterator<Item = &Submesh> + '_ {
        self.resource.submeshes()
    }

    #[must_use]
    pub fn submesh_count(&self) -> usize {
        self.resource.submesh_count()
    }

    #[must_use]
    pub fn submesh(&self, index: usize) -> Option<&Submesh> {
        self.resource.submesh(index)
    }

    /// Triangles covered by one submesh.
    #[must_use]
    pub fn submesh_triangle_count(&self, index: usize) -> Option<u32> {
        let submesh = self.submesh(index)?;
        let run = self.meshlets.get(submesh.meshlet_range())?;
        Some(run.iter().map(|m| m.triangle_count).sum())
    }

    /// CPU copy of the meshlet descriptors, for culling.
    #[must_use]
    pub fn meshlets(&self) -> &[Meshlet] {
        &self.meshlets
    }

    #[must_use]
    pub fn bounding_box(&self) -> BoundingBox {
        self.resource.bounding_box()
    }

    #[must_use]
    pub fn supports_mesh_shading(&self) -> bool {
        self.resource.supports_mesh_shading()
    }

    #[must_use]
    pub fn stats(&self) -> GeometryStats {
        self.stats
    }

    #[must_use]
    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    #[must_use]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    #[must_use]
    pub fn usage(&self) -> GeometryUsage {
        self.usage
    }

    #[must_use]
    pub fn load_timestamp(&self) -> u64 {
        self.load_timestamp
    }

    #[must_use]
    pub fn info_string(&self) -> String {
        let s = &self.stats;
        let bb = self.bounding_box();
        format!(
            "Geometry: {}\nSource: {}\nPath: {}\nVertices: {}\nIndices: {} ({:?})\nTriangles: {}\nMeshlets: {}\nSubmeshes: {}\nPrimitives: {}\nBounds: [{:.3}, {:.3}, {:.3}] - [{:.3}, {:.3}, {:.3}]",
            if self.debug_name.is_empty() { "Unnamed" } else { &self.debug_name },
            self.source_path.display(),
            if self.supports_mesh_shading() { "Mesh Shading" } else { "Vertex" },
            s.vertex_count,
            s.index_count,
            self.resource.index_type(),
            s.triangle_count,
            s.meshlet_count,
            s.submesh_count,
            s.primitive_count,
            bb.min.x,
            bb.min.y,
            bb.min.z,
            bb.max.x,
            bb.max.y,
            bb.max.z,
        )
    }
}

// ============================================================================
// Loader
// ============================================================================

pub struct GeometryLoader;

impl GeometryLoader {
    pub fn load(device: &Arc<dyn GpuDevice>, info: &GeometryLoadInfo, max_upload_size: u64) -> Result<GeometryAsset> {
        let ext = info
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if ext != "gltf" && ext != "glb" {
            return Err(LoaderError::runtime(format!(
                "Unsupported geometry file format: {}",
                info.path.display()
            )));
        }

        #[cfg(feature = "gltf")]
        {
            let records = load_mesh_records(&info.path)?;
            Self::load_records(device, info, records, max_upload_size)
        }

        #[cfg(not(feature = "gltf"))]
        {
            let _ = (device, max_upload_size);
            Err(LoaderError::FeatureNotEnabled("gltf".into()))
        }
    }

    #[cfg(feature = "gltf")]
    fn load_records(
        device: &Arc<dyn GpuDevice>,
        info: &GeometryLoadInfo,
        mut records: Vec<MeshRecord>,
        max_upload_size: u64,
    ) -> Result<GeometryAsset> {
        if records.is_empty() {
            return Err(LoaderError::runtime(format!(
                "{} contains no triangle primitives",
                info.path.display()
            )));
        }

        if info.attribute_flags.contains(GeometryAttributeFlags::GENERATE_NORMALS) {
            for record in &mut records {
                record.ensure_normals();
            }
        }

        // --- Meshlets ---
        let mut builder = MeshletBuilder::new();
        for record in &records {
            let normals = record.normals.as_deref().map(|n| (n.as_flattened(), 3));
            builder.add_mesh(
                record.positions.as_flattened(),
                3,
                record.vertex_count(),
                &record.indices,
                normals,
            );
        }

        let opt = info.optimization_flags;
        if opt.contains(GeometryOptimizationFlags::VERTEX_CACHE) {
            builder.optimize_vertex_cache();
        }
        builder.build(
            info.max_verts_per_meshlet,
            info.max_prims_per_meshlet,
            opt.contains(GeometryOptimizationFlags::OVERDRAW),
            opt.contains(GeometryOptimizationFlags::VERTEX_FETCH),
        );
        if builder.meshlets().is_empty() {
            return Err(LoaderError::runtime(format!("{} contains no triangles", info.path.display())));
        }
        let submeshes = builder.generate_submeshes(0, 0);

        // --- Vertex streams ---
        let (mut positions, mut attributes) = pack_vertex_streams(&records);
        if let Some(remap) = builder.vertex_remap() {
            positions = permute(&positions, remap);
            attributes = permute(&attributes, remap);
        }

        let vertex_count = positions.len();
        let index_type = IndexType::for_vertex_count(vertex_count);
        let indices = builder.meshlet_index_stream();
        let index_count = indices.len();

        let data = builder.export_meshlet_data();
        let name = if info.debug_name.is_empty() { "geometry" } else { &info.debug_name };

        let index_info = match index_type {
            IndexType::U16 => {
                let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
                buffer_info(name, "index_buffer", &narrow, BufferUsage::INDEX, BufferContentType::Index)
            }
            IndexType::U32 => buffer_info(name, "index_buffer", &indices, BufferUsage::INDEX, BufferContentType::Index),
        };

        let requests = [
            buffer_info(name, "position_buffer", &positions, BufferUsage::VERTEX, BufferContentType::Vertex),
            buffer_info(name, "attribute_buffer", &attributes, BufferUsage::VERTEX, BufferContentType::Vertex),
            index_info,
            buffer_info(name, "meshlet_buffer", &data.meshlets, BufferUsage::empty(), BufferContentType::Storage),
            buffer_info(
                name,
                "meshlet_vertex_buffer",
                &data.meshlet_vertices,
                BufferUsage::empty(),
                BufferContentType::Storage,
            ),
            buffer_info(
                name,
                "meshlet_index_buffer",
                &data.meshlet_indices,
                BufferUsage::empty(),
                BufferContentType::Storage,
            ),
        ];

        let mut buffers: Vec<BufferAsset> = Vec::with_capacity(requests.len());
        for request in &requests {
            match BufferLoader::load(device, request, max_upload_size) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    log::error!("Failed to create '{}': {e}", request.debug_name);
                    for buffer in &buffers {
                        BufferLoader::destroy(buffer);
                    }
                    return Err(e);
                }
            }
        }

        let gpu_data = GeometryGpuData {
            position_buffer: buffers[0].handle(),
            attribute_buffer: buffers[1].handle(),
            index_buffer: buffers[2].handle(),
            meshlet_buffer: buffers[3].handle(),
            meshlet_vertex_buffer: buffers[4].handle(),
            meshlet_index_buffer: buffers[5].handle(),
            vertex_count: vertex_count as u32,
            index_count: index_count as u32,
            meshlet_count: data.meshlets.len() as u32,
            meshlet_max_vertex_count: info.max_verts_per_meshlet,
            meshlet_max_triangle_count: info.max_prims_per_meshlet,
            index_type,
        };

        let stats = GeometryStats {
            vertex_count: vertex_count as u32,
            index_count: index_count as u32,
            meshlet_count: data.meshlets.len() as u32,
            triangle_count: (index_count / 3) as u32,
            submesh_count: submeshes.len() as u32,
            primitive_count: records.len() as u32,
        };

        let vertex_input = if info.vertex_input.is_empty() {
            VertexInput::position_attribute()
        } else {
            info.vertex_input.clone()
        };

        let resource = GeometryResourceFactory::create(
            &device.features(),
            gpu_data,
            submeshes,
            &data.meshlets,
            vertex_input,
            info.prefer_mesh_shading,
        );

        log::debug!(
            "Loaded geometry '{name}': {} vertices, {} triangles, {} meshlets",
            stats.vertex_count,
            stats.triangle_count,
            stats.meshlet_count
        );

        Ok(GeometryAsset {
            resource,
            buffers,
            meshlets: data.meshlets,
            stats,
            source_path: info.path.clone(),
            debug_name: info.debug_name.clone(),
            usage: info.usage,
            load_timestamp: timestamp_now(),
        })
    }

    pub fn destroy(asset: &GeometryAsset) {
        for buffer in &asset.buffers {
            BufferLoader::destroy(buffer);
        }
    }
}

fn buffer_info<T: bytemuck::Pod>(
    name: &str,
    suffix: &str,
    data: &[T],
    usage: BufferUsage,
    content_type: BufferContentType,
) -> BufferLoadInfo {
    BufferLoadInfo::from_slice(
        format!("{name}::{suffix}"),
        data,
        usage | BufferUsage::STORAGE,
        content_type,
    )
}

/// Merges all records into the GPU vertex layout. Missing normals default
/// to +Y and missing UVs to zero.
#[cfg(feature = "gltf")]
fn pack_vertex_streams(records: &[MeshRecord]) -> (Vec<[f32; 4]>, Vec<[f32; 5]>) {
    let total: usize = records.iter().map(MeshRecord::vertex_count).sum();
    let mut positions = Vec::with_capacity(total);
    let mut attributes = Vec::with_capacity(total);

    for record in records {
        for (i, p) in record.positions.iter().enumerate() {
            positions.push([p[0], p[1], p[2], 1.0]);

            let n = record
                .normals
                .as_ref()
                .and_then(|n| n.get(i))
                .copied()
                .unwrap_or([0.0, 1.0, 0.0]);
            let uv = record.uv0.as_ref().and_then(|uv| uv.get(i)).copied().unwrap_or([0.0, 0.0]);
            attributes.push([n[0], n[1], n[2], uv[0], uv[1]]);
        }
    }

    (positions, attributes)
}
