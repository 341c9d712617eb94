//! Meshlet Builder
//!
//! Clusters a triangle list into small, GPU-dispatchable meshlets and
//! computes per-meshlet culling metadata.
//!
//! # Pipeline
//!
//! | Step | Operation | Notes |
//! |------|-----------|-------|
//! | 1 | `add_mesh` | Appends streams, rebases indices by the running vertex count |
//! | 2 | overdraw reorder | Optional, `meshopt` triangle clustering |
//! | 3 | greedy partition | Caps on unique vertices and triangles per meshlet |
//! | 4 | bounds + cone | AABB-center sphere; averaged-normal cone |
//! | 5 | vertex-fetch remap | Optional, renumbers vertices by first use |
//!
//! Meshlet vertex lists store *global* vertex ids; meshlet index lists store
//! *local* ids (one `u32` per corner, three per triangle).

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::math::{BoundingBox, BoundingSphere};

/// Default cap on unique vertices per meshlet.
pub const DEFAULT_MAX_VERTS_PER_MESHLET: u32 = 64;
/// Default cap on triangles per meshlet.
pub const DEFAULT_MAX_PRIMS_PER_MESHLET: u32 = 124;

const OVERDRAW_THRESHOLD: f32 = 1.05;
const UNASSIGNED: u32 = u32::MAX;

/// GPU-layout meshlet descriptor (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Meshlet {
    pub vertex_count: u32,
    pub triangle_count: u32,
    /// Offset into the meshlet-vertex array.
    pub vertex_offset: u32,
    /// Offset into the meshlet-index array, in triangles.
    pub triangle_offset: u32,
    /// `xyz` = center, `w` = radius.
    pub bounding_sphere: [f32; 4],
    /// `xyz` = cone axis, `w` = cutoff angle in radians.
    pub cone: [f32; 4],
    pub material_index: u32,
    _padding: [u32; 3],
}

impl Meshlet {
    #[inline]
    #[must_use]
    pub fn sphere(&self) -> BoundingSphere {
        let [x, y, z, r] = self.bounding_sphere;
        BoundingSphere::new(Vec3::new(x, y, z), r)
    }

    /// The AABB of this meshlet's bounding sphere.
    #[inline]
    #[must_use]
    pub fn sphere_bounds(&self) -> BoundingBox {
        BoundingBox::from_sphere(&self.sphere())
    }

    #[inline]
    #[must_use]
    pub fn cone_axis(&self) -> Vec3 {
        Vec3::new(self.cone[0], self.cone[1], self.cone[2])
    }

    #[inline]
    #[must_use]
    pub fn cone_cutoff(&self) -> f32 {
        self.cone[3]
    }
}

/// A contiguous run of meshlets sharing one material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Submesh {
    pub meshlet_offset: u32,
    pub meshlet_count: u32,
    pub material_index: u32,
    pub bounds: BoundingBox,
}

impl Submesh {
    #[inline]
    #[must_use]
    pub fn meshlet_range(&self) -> std::ops::Range<usize> {
        let start = self.meshlet_offset as usize;
        start..start + self.meshlet_count as usize
    }
}

/// Flattened builder output, ready for upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshletData {
    pub meshlets: Vec<Meshlet>,
    pub meshlet_vertices: Vec<u32>,
    pub meshlet_indices: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct MeshletBuilder {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    has_normals: bool,
    indices: Vec<u32>,

    meshlets: Vec<Meshlet>,
    meshlet_vertices: Vec<u32>,
    meshlet_indices: Vec<u32>,
    vertex_remap: Option<Vec<u32>>,

    max_verts_per_meshlet: u32,
    max_prims_per_meshlet: u32,
}

impl MeshletBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_verts_per_meshlet: DEFAULT_MAX_VERTS_PER_MESHLET,
            max_prims_per_meshlet: DEFAULT_MAX_PRIMS_PER_MESHLET,
            ..Default::default()
        }
    }

    /// Appends one mesh. Strides are counted in `f32` elements, so a tightly
    /// packed `xyz` stream has stride 3.
    ///
    /// # Panics
    ///
    /// If `indices.len()` is not a multiple of 3, if a stream is too short
    /// for `vertex_count`, or if an index references a vertex outside this mesh.
    pub fn add_mesh(
        &mut self,
        positions: &[f32],
        position_stride: usize,
        vertex_count: usize,
        indices: &[u32],
        normals: Option<(&[f32], usize)>,
    ) {
        assert!(indices.len() % 3 == 0, "index count must be a multiple of 3");
        assert!(position_stride >= 3, "position stride must cover xyz");
        assert!(
            normals.is_none_or(|(_, stride)| stride >= 3),
            "normal stride must cover xyz"
        );
        assert!(
            vertex_count == 0 || positions.len() >= (vertex_count - 1) * position_stride + 3,
            "position stream too short for {vertex_count} vertices"
        );
        assert!(
            indices.iter().all(|&i| (i as usize) < vertex_count),
            "index out of range for a mesh of {vertex_count} vertices"
        );

        let base = self.positions.len() as u32;

        self.positions.extend((0..vertex_count).map(|i| {
            let p = &positions[i * position_stride..i * position_stride + 3];
            Vec3::new(p[0], p[1], p[2])
        }));

        // Normals stay either empty or exactly as long as positions; meshes
        // without normals contribute zero vectors, which the cone pass ignores.
        match normals {
            Some((data, stride)) => {
                assert!(
                    vertex_count == 0 || data.len() >= (vertex_count - 1) * stride + 3,
                    "normal stream too short for {vertex_count} vertices"
                );
                if !self.has_normals {
                    self.normals.resize(base as usize, Vec3::ZERO);
                    self.has_normals = true;
                }
                self.normals.extend((0..vertex_count).map(|i| {
                    let n = &data[i * stride..i * stride + 3];
                    Vec3::new(n[0], n[1], n[2])
                }));
            }
            None => {
                if self.has_normals {
                    self.normals.resize(self.positions.len(), Vec3::ZERO);
                }
            }
        }

        self.indices.extend(indices.iter().map(|&i| i + base));
    }

    /// Convenience wrapper over [`MeshletBuilder::add_mesh`] for typed streams.
    pub fn add_mesh_vec3(&mut self, positions: &[Vec3], indices: &[u32], normals: Option<&[Vec3]>) {
        let normals = normals.map(|n| (bytemuck::cast_slice::<Vec3, f32>(n), 3));
        self.add_mesh(
            bytemuck::cast_slice(positions),
            3,
            positions.len(),
            indices,
            normals,
        );
    }

    /// Reorders the accumulated index stream for post-transform cache reuse.
    /// Call before [`MeshletBuilder::build`].
    pub fn optimize_vertex_cache(&mut self) {
        if self.indices.is_empty() {
            return;
        }
        meshopt::optimize_vertex_cache_in_place(&mut self.indices, self.positions.len());
    }

    /// Clusters the accumulated triangles into meshlets.
    ///
    /// Empty input is a no-op that leaves all outputs empty.
    ///
    /// # Panics
    ///
    /// If `max_verts_per_meshlet < 3` or `max_prims_per_meshlet == 0`.
    pub fn build(
        &mut self,
        max_verts_per_meshlet: u32,
        max_prims_per_meshlet: u32,
        optimize_for_overdraw: bool,
        optimize_for_vertex_fetch: bool,
    ) {
        self.meshlets.clear();
        self.meshlet_vertices.clear();
        self.meshlet_indices.clear();
        self.vertex_remap = None;

        if self.positions.is_empty() || self.indices.is_empty() {
            return;
        }

        assert!(max_verts_per_meshlet >= 3, "a meshlet must hold at least one triangle");
        assert!(max_prims_per_meshlet >= 1, "a meshlet must hold at least one triangle");

        self.max_verts_per_meshlet = max_verts_per_meshlet;
        self.max_prims_per_meshlet = max_prims_per_meshlet;

        let mut indices = self.indices.clone();

        if optimize_for_overdraw {
            match meshopt::VertexDataAdapter::new(
                bytemuck::cast_slice(&self.positions),
                std::mem::size_of::<Vec3>(),
                0,
            ) {
                Ok(adapter) => {
                    meshopt::optimize_overdraw_in_place(&mut indices, &adapter, OVERDRAW_THRESHOLD);
                }
                Err(e) => log::warn!("Skipping overdraw optimization: {e}"),
            }
        }

        self.partition(&indices);

        for i in 0..self.meshlets.len() {
            let mut meshlet = self.meshlets[i];
            self.compute_meshlet_bounds(&mut meshlet);
            self.compute_meshlet_cone(&mut meshlet);
            self.meshlets[i] = meshlet;
        }

        if optimize_for_vertex_fetch {
            self.remap_vertices_by_first_use();
        }

        log::debug!(
            "Built {} meshlets from {} triangles ({} vertices)",
            self.meshlets.len(),
            self.indices.len() / 3,
            self.positions.len()
        );
    }

    /// Greedy partition in index-stream order.
    fn partition(&mut self, indices: &[u32]) {
        let max_verts = self.max_verts_per_meshlet as usize;
        let max_prims = self.max_prims_per_meshlet as usize;

        // Global vertex id -> local slot in the meshlet under construction.
        let mut local = vec![UNASSIGNED; self.positions.len()];
        let mut verts: Vec<u32> = Vec::with_capacity(max_verts);
        let mut tris: Vec<[u32; 3]> = Vec::with_capacity(max_prims);

        for tri in indices.chunks_exact(3) {
            let mut new_verts = 0;
            for (k, &v) in tri.iter().enumerate() {
                if local[v as usize] == UNASSIGNED && !tri[..k].contains(&v) {
                    new_verts += 1;
                }
            }

            if verts.len() + new_verts > max_verts || tris.len() + 1 > max_prims {
                self.flush_meshlet(&mut verts, &mut tris, &mut local);
            }

            let mut corner = [0u32; 3];
            for (k, &v) in tri.iter().enumerate() {
                let slot = &mut local[v as usize];
                if *slot == UNASSIGNED {
                    *slot = verts.len() as u32;
                    verts.push(v);
                }
                corner[k] = *slot;
            }
            tris.push(corner);
        }

        self.flush_meshlet(&mut verts, &mut tris, &mut local);
    }

    fn flush_meshlet(&mut self, verts: &mut Vec<u32>, tris: &mut Vec<[u32; 3]>, local: &mut [u32]) {
        for &v in verts.iter() {
            local[v as usize] = UNASSIGNED;
        }

        // Degenerate (empty) meshlets are never emitted.
        if tris.is_empty() {
            verts.clear();
            return;
        }

        let meshlet = Meshlet {
            vertex_count: verts.len() as u32,
            triangle_count: tris.len() as u32,
            vertex_offset: self.meshlet_vertices.len() as u32,
            triangle_offset: (self.meshlet_indices.len() / 3) as u32,
            ..Default::default()
        };

        self.meshlet_vertices.extend_from_slice(verts);
        self.meshlet_indices.extend(tris.iter().flatten());
        self.meshlets.push(meshlet);

        verts.clear();
        tris.clear();
    }

    /// Global vertex ids of the meshlet's corners, triangle by triangle.
    fn meshlet_triangles(&self, meshlet: &Meshlet) -> impl Iterator<Item = [u32; 3]> + '_ {
        let start = meshlet.triangle_offset as usize * 3;
        let end = start + meshlet.triangle_count as usize * 3;
        let base = meshlet.vertex_offset as usize;
        self.meshlet_indices[start..end].chunks_exact(3).map(move |t| {
            [
                self.meshlet_vertices[base + t[0] as usize],
                self.meshlet_vertices[base + t[1] as usize],
                self.meshlet_vertices[base + t[2] as usize],
            ]
        })
    }

    fn compute_meshlet_bounds(&self, meshlet: &mut Meshlet) {
        let start = meshlet.vertex_offset as usize;
        let end = start + meshlet.vertex_count as usize;

        let points: Vec<Vec3> = self.meshlet_vertices[start..end]
            .iter()
            .filter_map(|&v| self.positions.get(v as usize).copied())
            .collect();

        let sphere = BoundingSphere::from_points(&points);
        meshlet.bounding_sphere = [sphere.center.x, sphere.center.y, sphere.center.z, sphere.radius];
    }

    fn compute_meshlet_cone(&self, meshlet: &mut Meshlet) {
        if !self.has_normals {
            meshlet.cone = [0.0, 0.0, 1.0, 0.0];
            return;
        }

        let triangle_normal = |[a, b, c]: [u32; 3]| {
            let n = (self.normals[a as usize] + self.normals[b as usize] + self.normals[c as usize]) / 3.0;
            n.normalize_or_zero()
        };

        let sum: Vec3 = self.meshlet_triangles(meshlet).map(triangle_normal).sum();
        let axis = sum.try_normalize().unwrap_or(Vec3::Z);

        let cutoff = self
            .meshlet_triangles(meshlet)
            .map(|t| triangle_normal(t).dot(axis).clamp(-1.0, 1.0).acos())
            .fold(0.0_f32, f32::max);

        meshlet.cone = [axis.x, axis.y, axis.z, cutoff];
    }

    /// Renumbers vertices in the order the meshlets first reference them.
    /// Unreferenced vertices keep their relative order after the referenced ones.
    fn remap_vertices_by_first_use(&mut self) {
        let vertex_count = self.positions.len();
        let mut remap = vec![UNASSIGNED; vertex_count];
        let mut next = 0u32;

        for &v in &self.meshlet_vertices {
            let slot = &mut remap[v as usize];
            if *slot == UNASSIGNED {
                *slot = next;
                next += 1;
            }
        }
        for slot in &mut remap {
            if *slot == UNASSIGNED {
                *slot = next;
                next += 1;
            }
        }

        self.positions = permute(&self.positions, &remap);
        if self.has_normals {
            self.normals = permute(&self.normals, &remap);
        }
        for v in self.meshlet_vertices.iter_mut().chain(self.indices.iter_mut()) {
            *v = remap[*v as usize];
        }

        self.vertex_remap = Some(remap);
    }

    /// Partitions the built meshlets into contiguous submeshes of at most
    /// `max_meshlets_per_submesh` meshlets (`0` = one submesh for all).
    #[must_use]
    pub fn generate_submeshes(&self, material_index: u32, max_meshlets_per_submesh: u32) -> Vec<Submesh> {
        if self.meshlets.is_empty() {
            return Vec::new();
        }

        let total = self.meshlets.len();
        let chunk = if max_meshlets_per_submesh == 0 || max_meshlets_per_submesh as usize >= total {
            total
        } else {
            max_meshlets_per_submesh as usize
        };

        self.meshlets
            .chunks(chunk)
            .enumerate()
            .map(|(i, run)| {
                let bounds = run.iter().fold(BoundingBox::EMPTY, |acc, m| acc.union(&m.sphere_bounds()));
                Submesh {
                    meshlet_offset: (i * chunk) as u32,
                    meshlet_count: run.len() as u32,
                    material_index,
                    bounds,
                }
            })
            .collect()
    }

    /// Global vertex ids in meshlet order, three per triangle. Each meshlet's
    /// triangles occupy `[3 * triangle_offset, 3 * (triangle_offset + triangle_count))`.
    #[must_use]
    pub fn meshlet_index_stream(&self) -> Vec<u32> {
        self.meshlets
            .iter()
            .flat_map(|m| self.meshlet_triangles(m))
            .flatten()
            .collect()
    }

    #[must_use]
    pub fn export_meshlet_data(&self) -> MeshletData {
        MeshletData {
            meshlets: self.meshlets.clone(),
            meshlet_vertices: self.meshlet_vertices.clone(),
            meshlet_indices: self.meshlet_indices.clone(),
        }
    }

    /// Drops all input streams and outputs.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    #[inline]
    #[must_use]
    pub fn meshlets(&self) -> &[Meshlet] {
        &self.meshlets
    }

    #[inline]
    #[must_use]
    pub fn meshlet_vertices(&self) -> &[u32] {
        &self.meshlet_vertices
    }

    #[inline]
    #[must_use]
    pub fn meshlet_indices(&self) -> &[u32] {
        &self.meshlet_indices
    }

    #[inline]
    #[must_use]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    /// Empty unless at least one added mesh carried normals.
    #[inline]
    #[must_use]
    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    #[inline]
    #[must_use]
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    #[inline]
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// `remap[old] = new`, present after a build with vertex-fetch optimization.
    #[inline]
    #[must_use]
    pub fn vertex_remap(&self) -> Option<&[u32]> {
        self.vertex_remap.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn max_verts_per_meshlet(&self) -> u32 {
        self.max_verts_per_meshlet
    }

    #[inline]
    #[must_use]
    pub fn max_prims_per_meshlet(&self) -> u32 {
        self.max_prims_per_meshlet
    }
}

/// Scatters `data[old]` to `out[remap[old]]`.
pub(crate) fn permute<T: Copy + Default>(data: &[T], remap: &[u32]) -> Vec<T> {
    let mut out = vec![T::default(); data.len()];
    for (old, &new) in remap.iter().enumerate() {
        if let (Some(&value), Some(slot)) = (data.get(old), out.get_mut(new as usize)) {
            *slot = value;
        }
    }
    out
}
