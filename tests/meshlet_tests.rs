//! Meshlet Builder Tests
//!
//! Tests for:
//! - Single-triangle and cube clustering
//! - Vertex and primitive caps, partition of the triangle set
//! - Meshlet bounding spheres and normal cones
//! - Vertex-fetch remap consistency
//! - Submesh generation and bounds

use glam::Vec3;

use myth_loader::geometry::{Meshlet, MeshletBuilder};
use myth_loader::math::BoundingBox;

const EPSILON: f32 = 1e-4;

fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < EPSILON
}

fn vec3_approx(a: Vec3, b: Vec3) -> bool {
    approx(a.x, b.x) && approx(a.y, b.y) && approx(a.z, b.z)
}

// ============================================================================
// Fixtures
// ============================================================================

fn cube() -> (Vec<Vec3>, Vec<u32>) {
    let positions = vec![
        Vec3::new(-1.0, -1.0, -1.0),
        Vec3::new(1.0, -1.0, -1.0),
        Vec3::new(1.0, 1.0, -1.0),
        Vec3::new(-1.0, 1.0, -1.0),
        Vec3::new(-1.0, -1.0, 1.0),
        Vec3::new(1.0, -1.0, 1.0),
        Vec3::new(1.0, 1.0, 1.0),
        Vec3::new(-1.0, 1.0, 1.0),
    ];
    #[rustfmt::skip]
    let indices = vec![
        0, 2, 1, 0, 3, 2, // -Z
        4, 5, 6, 4, 6, 7, // +Z
        0, 1, 5, 0, 5, 4, // -Y
        3, 7, 6, 3, 6, 2, // +Y
        0, 4, 7, 0, 7, 3, // -X
        1, 2, 6, 1, 6, 5, // +X
    ];
    (positions, indices)
}

/// A `cols x rows` quad grid in the XY plane, two triangles per cell.
fn grid(cols: u32, rows: u32) -> (Vec<Vec3>, Vec<u32>) {
    let mut positions = Vec::new();
    for y in 0..=rows {
        for x in 0..=cols {
            positions.push(Vec3::new(x as f32, y as f32, 0.0));
        }
    }
    let stride = cols + 1;
    let mut indices = Vec::new();
    for y in 0..rows {
        for x in 0..cols {
            let i = y * stride + x;
            indices.extend_from_slice(&[i, i + 1, i + stride + 1, i, i + stride + 1, i + stride]);
        }
    }
    (positions, indices)
}

fn global_triangles(builder: &MeshletBuilder, meshlet: &Meshlet) -> Vec<[u32; 3]> {
    let verts = builder.meshlet_vertices();
    let local = builder.meshlet_indices();
    let start = meshlet.triangle_offset as usize * 3;
    let end = start + meshlet.triangle_count as usize * 3;
    local[start..end]
        .chunks_exact(3)
        .map(|t| {
            let base = meshlet.vertex_offset as usize;
            [verts[base + t[0] as usize], verts[base + t[1] as usize], verts[base + t[2] as usize]]
        })
        .collect()
}

fn sorted(mut t: [u32; 3]) -> [u32; 3] {
    t.sort_unstable();
    t
}

// ============================================================================
// Basic clustering
// ============================================================================

#[test]
fn single_triangle_yields_one_meshlet() {
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&[Vec3::ZERO, Vec3::X, Vec3::Y], &[0, 1, 2], None);
    builder.build(64, 124, false, false);

    let meshlets = builder.meshlets();
    assert_eq!(meshlets.len(), 1);
    assert_eq!(meshlets[0].vertex_count, 3);
    assert_eq!(meshlets[0].triangle_count, 1);
    assert_eq!(meshlets[0].vertex_offset, 0);
    assert_eq!(meshlets[0].triangle_offset, 0);
    assert_eq!(builder.meshlet_indices().len(), 3);
}

#[test]
fn cube_fits_one_meshlet() {
    let (positions, indices) = cube();
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(64, 124, false, false);

    let meshlets = builder.meshlets();
    assert_eq!(meshlets.len(), 1);
    assert_eq!(meshlets[0].vertex_count, 8);
    assert_eq!(meshlets[0].triangle_count, 12);

    let sphere = meshlets[0].sphere();
    assert!(vec3_approx(sphere.center, Vec3::ZERO));
    assert!(approx(sphere.radius, 3.0_f32.sqrt()));
}

#[test]
fn empty_input_builds_nothing() {
    let mut builder = MeshletBuilder::new();
    builder.build(64, 124, true, true);
    assert!(builder.meshlets().is_empty());
    assert!(builder.generate_submeshes(0, 0).is_empty());
    assert!(builder.meshlet_index_stream().is_empty());
}

#[test]
#[should_panic(expected = "multiple of 3")]
fn add_mesh_rejects_partial_triangles() {
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&[Vec3::ZERO, Vec3::X, Vec3::Y], &[0, 1], None);
}

#[test]
#[should_panic(expected = "normal stride must cover xyz")]
fn add_mesh_rejects_short_normal_stride() {
    let mut builder = MeshletBuilder::new();
    let positions = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    let normals = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
    builder.add_mesh(&positions, 3, 3, &[0, 1, 2], Some((&normals, 2)));
}

#[test]
fn add_mesh_offsets_indices_of_later_meshes() {
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&[Vec3::ZERO, Vec3::X, Vec3::Y], &[0, 1, 2], None);
    builder.add_mesh_vec3(&[Vec3::Z, Vec3::ONE, Vec3::NEG_X], &[0, 1, 2], None);
    assert_eq!(builder.vertex_count(), 6);
    assert_eq!(builder.indices(), &[0, 1, 2, 3, 4, 5]);
}

#[test]
fn add_mesh_honors_position_stride() {
    // xyz + uv interleaved
    #[rustfmt::skip]
    let data = [
        0.0, 0.0, 0.0, 9.0, 9.0,
        1.0, 0.0, 0.0, 9.0, 9.0,
        0.0, 1.0, 0.0, 9.0, 9.0,
    ];
    let mut builder = MeshletBuilder::new();
    builder.add_mesh(&data, 5, 3, &[0, 1, 2], None);
    assert_eq!(builder.positions(), &[Vec3::ZERO, Vec3::X, Vec3::Y]);
}

// ============================================================================
// Limits and partition
// ============================================================================

#[test]
fn caps_are_respected() {
    let (positions, indices) = grid(16, 16);
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(32, 20, false, false);

    assert!(builder.meshlets().len() > 1);
    for m in builder.meshlets() {
        assert!(m.vertex_count <= 32);
        assert!(m.triangle_count <= 20);
        assert!(m.triangle_count > 0);
    }
    assert_eq!(builder.max_verts_per_meshlet(), 32);
    assert_eq!(builder.max_prims_per_meshlet(), 20);
}

#[test]
fn meshlets_partition_the_triangle_set() {
    let (positions, indices) = grid(12, 9);
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(24, 16, true, false);

    let mut expected: Vec<[u32; 3]> = indices.chunks_exact(3).map(|t| sorted([t[0], t[1], t[2]])).collect();
    let mut actual: Vec<[u32; 3]> = builder
        .meshlets()
        .iter()
        .flat_map(|m| global_triangles(&builder, m))
        .map(sorted)
        .collect();
    expected.sort_unstable();
    actual.sort_unstable();
    assert_eq!(actual, expected);

    let total: u32 = builder.meshlets().iter().map(|m| m.triangle_count).sum();
    assert_eq!(total as usize, indices.len() / 3);
}

#[test]
fn meshlet_ranges_are_contiguous() {
    let (positions, indices) = grid(10, 10);
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(16, 12, false, false);

    let mut vertex_cursor = 0;
    let mut triangle_cursor = 0;
    for m in builder.meshlets() {
        assert_eq!(m.vertex_offset, vertex_cursor);
        assert_eq!(m.triangle_offset, triangle_cursor);
        vertex_cursor += m.vertex_count;
        triangle_cursor += m.triangle_count;
    }
    assert_eq!(vertex_cursor as usize, builder.meshlet_vertices().len());
    assert_eq!(triangle_cursor as usize * 3, builder.meshlet_indices().len());
}

#[test]
fn meshlet_index_stream_matches_meshlet_triangles() {
    let (positions, indices) = grid(6, 6);
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(10, 8, false, false);

    let stream = builder.meshlet_index_stream();
    for m in builder.meshlets() {
        let start = m.triangle_offset as usize * 3;
        let from_stream: Vec<[u32; 3]> = stream[start..start + m.triangle_count as usize * 3]
            .chunks_exact(3)
            .map(|t| [t[0], t[1], t[2]])
            .collect();
        assert_eq!(from_stream, global_triangles(&builder, m));
    }
}

// ============================================================================
// Bounds and cones
// ============================================================================

#[test]
fn meshlet_spheres_enclose_their_vertices() {
    let (positions, indices) = grid(8, 8);
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(16, 16, false, false);

    for m in builder.meshlets() {
        let sphere = m.sphere();
        let start = m.vertex_offset as usize;
        for &v in &builder.meshlet_vertices()[start..start + m.vertex_count as usize] {
            let p = builder.positions()[v as usize];
            assert!(p.distance(sphere.center) <= sphere.radius + EPSILON);
        }
    }
}

#[test]
fn cone_defaults_without_normals() {
    let (positions, indices) = cube();
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(64, 124, false, false);

    assert_eq!(builder.meshlets()[0].cone, [0.0, 0.0, 1.0, 0.0]);
}

#[test]
fn cone_of_flat_patch_points_along_normal() {
    let (positions, indices) = grid(3, 3);
    let normals = vec![Vec3::Z; positions.len()];
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, Some(&normals));
    builder.build(64, 124, false, false);

    let m = builder.meshlets()[0];
    assert!(vec3_approx(m.cone_axis(), Vec3::Z));
    assert!(approx(m.cone_cutoff(), 0.0));
}

// ============================================================================
// Vertex fetch remap
// ============================================================================

#[test]
fn vertex_fetch_renumbers_by_first_use() {
    let (positions, indices) = grid(5, 5);
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(12, 10, false, true);

    let remap = builder.vertex_remap().expect("remap recorded").to_vec();
    assert_eq!(remap.len(), positions.len());

    // A permutation.
    let mut seen = remap.clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..positions.len() as u32).collect::<Vec<_>>());

    // Positions follow their vertices.
    for (old, &new) in remap.iter().enumerate() {
        assert_eq!(builder.positions()[new as usize], positions[old]);
    }

    // First meshlet references vertices 0.. in order.
    let first = builder.meshlets()[0];
    let verts = &builder.meshlet_vertices()[..first.vertex_count as usize];
    assert_eq!(verts, (0..first.vertex_count).collect::<Vec<_>>().as_slice());
}

#[test]
fn no_remap_without_vertex_fetch() {
    let (positions, indices) = cube();
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(64, 124, false, false);
    assert!(builder.vertex_remap().is_none());
    assert_eq!(builder.positions(), positions.as_slice());
}

// ============================================================================
// Submeshes
// ============================================================================

fn five_meshlet_builder() -> MeshletBuilder {
    // 10 triangles, 2 per meshlet.
    let (positions, indices) = grid(5, 1);
    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(64, 2, false, false);
    builder
}

#[test]
fn one_submesh_covers_all_meshlets() {
    let builder = five_meshlet_builder();
    assert_eq!(builder.meshlets().len(), 5);

    let submeshes = builder.generate_submeshes(3, 0);
    assert_eq!(submeshes.len(), 1);
    assert_eq!(submeshes[0].meshlet_offset, 0);
    assert_eq!(submeshes[0].meshlet_count, 5);
    assert_eq!(submeshes[0].material_index, 3);
}

#[test]
fn submeshes_chunk_meshlets() {
    let builder = five_meshlet_builder();
    let submeshes = builder.generate_submeshes(0, 2);
    let counts: Vec<u32> = submeshes.iter().map(|s| s.meshlet_count).collect();
    let offsets: Vec<u32> = submeshes.iter().map(|s| s.meshlet_offset).collect();
    assert_eq!(counts, vec![2, 2, 1]);
    assert_eq!(offsets, vec![0, 2, 4]);
    assert_eq!(submeshes[2].meshlet_range(), 4..5);
}

#[test]
fn submesh_bounds_union_meshlet_spheres() {
    let builder = five_meshlet_builder();
    let submesh = builder.generate_submeshes(0, 0)[0];
    let expected = builder
        .meshlets()
        .iter()
        .fold(BoundingBox::EMPTY, |acc, m| acc.union(&m.sphere_bounds()));
    assert_eq!(submesh.bounds, expected);
    // The grid spans x in [0, 5].
    assert!(submesh.bounds.min.x <= 0.0);
    assert!(submesh.bounds.max.x >= 5.0);
}

#[test]
fn clear_resets_builder() {
    let mut builder = five_meshlet_builder();
    builder.clear();
    assert_eq!(builder.vertex_count(), 0);
    assert!(builder.meshlets().is_empty());
    assert!(builder.export_meshlet_data().meshlets.is_empty());
}
