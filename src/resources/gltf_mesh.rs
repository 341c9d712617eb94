//! glTF 2.0 ingestion.
//!
//! Flattens every triangle primitive of every mesh into a [`MeshRecord`]
//! with de-interleaved attribute streams and a `u32` index list. Node
//! transforms, materials and animation are not read here.

use std::path::Path;

use glam::Vec3;

use crate::errors::{LoaderError, Result};

/// One primitive's worth of vertex streams.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshRecord {
    pub name: String,
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub tangents: Option<Vec<[f32; 4]>>,
    pub uv0: Option<Vec<[f32; 2]>>,
    pub uv1: Option<Vec<[f32; 2]>>,
    pub colors: Option<Vec<[f32; 4]>>,
    pub indices: Vec<u32>,
    pub material_index: Option<usize>,
}

impl MeshRecord {
    #[inline]
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Fills in area-weighted smooth normals if the record has none.
    pub fn ensure_normals(&mut self) {
        if self.normals.is_none() {
            self.normals = Some(generate_smooth_normals(&self.positions, &self.indices));
        }
    }
}

/// Accumulates each face's (unnormalized) cross product into its three
/// vertices, then normalizes per vertex. Vertices with no usable faces keep
/// a zero normal.
#[must_use]
pub fn generate_smooth_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut accum = vec![Vec3::ZERO; positions.len()];

    for tri in indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let (Some(pa), Some(pb), Some(pc)) = (positions.get(a), positions.get(b), positions.get(c)) else {
            continue;
        };
        let (pa, pb, pc) = (Vec3::from(*pa), Vec3::from(*pb), Vec3::from(*pc));
        let face = (pb - pa).cross(pc - pa);
        accum[a] += face;
        accum[b] += face;
        accum[c] += face;
    }

    accum.into_iter().map(|n| n.normalize_or_zero().to_array()).collect()
}

/// Parses a `.gltf` or `.glb` file into mesh records.
pub fn load_mesh_records(path: &Path) -> Result<Vec<MeshRecord>> {
    let gltf::Gltf { document, blob } = gltf::Gltf::open(path).map_err(|e| match e {
        gltf::Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            LoaderError::AssetNotFound(path.display().to_string())
        }
        other => LoaderError::from(other),
    })?;

    let base = path.parent();
    let buffers = gltf::import_buffers(&document, base, blob)?;

    let mut records = Vec::new();
    for mesh in document.meshes() {
        let mesh_name = mesh.name().map_or_else(|| format!("mesh_{}", mesh.index()), str::to_string);

        for primitive in mesh.primitives() {
            let context = format!("{mesh_name}/primitive_{}", primitive.index());

            if primitive.mode() != gltf::mesh::Mode::Triangles {
                log::warn!("Skipping {context}: mode {:?} is not a triangle list", primitive.mode());
                continue;
            }

            if let Some(accessor) = primitive.indices() {
                use gltf::accessor::DataType;
                match accessor.data_type() {
                    DataType::U8 | DataType::U16 | DataType::U32 => {}
                    other => {
                        log::error!("Unsupported index component type {other:?} in {context}");
                        return Err(LoaderError::UnsupportedIndexType {
                            context,
                            component: format!("{other:?}"),
                        });
                    }
                }
            }

            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));

            let positions: Vec<[f32; 3]> = reader.read_positions().map(Iterator::collect).unwrap_or_default();
            if positions.is_empty() {
                log::warn!("Skipping {context}: no POSITION attribute");
                continue;
            }

            let indices: Vec<u32> = match reader.read_indices() {
                Some(iter) => iter.into_u32().collect(),
                None => (0..positions.len() as u32).collect(),
            };
            if indices.len() % 3 != 0 {
                return Err(LoaderError::runtime(format!(
                    "{context}: index count {} is not a multiple of 3",
                    indices.len()
                )));
            }
            if let Some(&bad) = indices.iter().find(|&&i| i as usize >= positions.len()) {
                return Err(LoaderError::runtime(format!(
                    "{context}: index {bad} out of range for {} vertices",
                    positions.len()
                )));
            }

            records.push(MeshRecord {
                name: context,
                normals: reader.read_normals().map(Iterator::collect),
                tangents: reader.read_tangents().map(Iterator::collect),
                uv0: reader.read_tex_coords(0).map(|r| r.into_f32().collect()),
                uv1: reader.read_tex_coords(1).map(|r| r.into_f32().collect()),
                colors: reader.read_colors(0).map(|r| r.into_rgba_f32().collect()),
                material_index: primitive.material().index(),
                positions,
                indices,
            });
        }
    }

    log::debug!("Parsed {} primitives from {}", records.len(), path.display());
    Ok(records)
}
