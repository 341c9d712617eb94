//! Geometry Resource Tests
//!
//! Tests for:
//! - Factory path selection (preference x device capability)
//! - Vertex path binding and per-submesh index ranges
//! - Meshlet path push constants and task dispatch
//! - Accessors on the closed enum

use glam::Vec3;

use myth_loader::geometry::{
    GeometryGpuData, GeometryResource, GeometryResourceFactory, MeshletBuilder, MeshletPushConstants,
};
use myth_loader::gpu::{
    BufferCreateInfo, BufferUsage, DeviceFeatures, GpuDevice, HeadlessDevice, IndexType, MemoryDomain,
    RecordedCommand, RecordingCommandBuffer, ShaderStageFlags, VertexInput,
};

// ============================================================================
// Fixtures
// ============================================================================

struct Fixture {
    device: HeadlessDevice,
    builder: MeshletBuilder,
    gpu_data: GeometryGpuData,
}

/// Six meshlets of two triangles each, from a 6x1 quad strip.
fn fixture() -> Fixture {
    let mut positions = Vec::new();
    for y in 0..=1 {
        for x in 0..=6 {
            positions.push(Vec3::new(x as f32, y as f32, 0.0));
        }
    }
    let mut indices = Vec::new();
    for x in 0..6u32 {
        indices.extend_from_slice(&[x, x + 1, x + 8, x, x + 8, x + 7]);
    }

    let mut builder = MeshletBuilder::new();
    builder.add_mesh_vec3(&positions, &indices, None);
    builder.build(64, 2, false, false);

    let device = HeadlessDevice::default();
    let make = |usage: BufferUsage| {
        device
            .create_buffer(&BufferCreateInfo {
                size: 256,
                usage: usage | BufferUsage::STORAGE,
                domain: MemoryDomain::Device,
            })
            .expect("buffer")
    };
    let gpu_data = GeometryGpuData {
        position_buffer: make(BufferUsage::VERTEX),
        attribute_buffer: make(BufferUsage::VERTEX),
        index_buffer: make(BufferUsage::INDEX),
        meshlet_buffer: make(BufferUsage::empty()),
        meshlet_vertex_buffer: make(BufferUsage::empty()),
        meshlet_index_buffer: make(BufferUsage::empty()),
        vertex_count: positions.len() as u32,
        index_count: indices.len() as u32,
        meshlet_count: builder.meshlets().len() as u32,
        meshlet_max_vertex_count: 64,
        meshlet_max_triangle_count: 2,
        index_type: IndexType::U16,
    };

    Fixture { device, builder, gpu_data }
}

fn create(f: &Fixture, mesh_shading: bool, prefer: bool, max_per_submesh: u32) -> GeometryResource {
    let features = DeviceFeatures {
        mesh_shading,
        ..Default::default()
    };
    GeometryResourceFactory::create(
        &features,
        f.gpu_data,
        f.builder.generate_submeshes(0, max_per_submesh),
        f.builder.meshlets(),
        VertexInput::position_attribute(),
        prefer,
    )
}

// ============================================================================
// Factory
// ============================================================================

#[test]
fn factory_selects_meshlet_only_when_preferred_and_supported() {
    let f = fixture();
    assert!(create(&f, true, true, 0).supports_mesh_shading());
    assert!(!create(&f, false, true, 0).supports_mesh_shading());
    assert!(!create(&f, true, false, 0).supports_mesh_shading());
    assert!(!create(&f, false, false, 0).supports_mesh_shading());
}

#[test]
fn meshlet_buffers_hidden_on_vertex_path() {
    let f = fixture();
    let vertex = create(&f, false, true, 0);
    assert!(vertex.meshlet_buffer().is_none());
    assert!(vertex.meshlet_vertex_buffer().is_none());
    assert!(vertex.meshlet_index_buffer().is_none());
    assert_eq!(vertex.index_buffer(), f.gpu_data.index_buffer);

    let meshlet = create(&f, true, true, 0);
    assert_eq!(meshlet.meshlet_buffer(), Some(f.gpu_data.meshlet_buffer));
    assert_eq!(meshlet.meshlet_index_buffer(), Some(f.gpu_data.meshlet_index_buffer));
}

#[test]
fn counts_and_bounds_forwarded() {
    let f = fixture();
    let geometry = create(&f, false, true, 4);
    assert_eq!(geometry.vertex_count(), 14);
    assert_eq!(geometry.index_count(), 36);
    assert_eq!(geometry.meshlet_count(), 6);
    assert_eq!(geometry.index_type(), IndexType::U16);
    assert_eq!(geometry.submesh_count(), 2);
    assert!(geometry.submesh(2).is_none());

    let bounds = geometry.bounding_box();
    assert!(bounds.is_valid());
    assert!(bounds.min.x <= 0.0 && bounds.max.x >= 6.0);
    assert_eq!(f.device.live_buffer_count(), 6);
}

// ============================================================================
// Vertex path
// ============================================================================

#[test]
fn vertex_bind_sets_input_and_buffers() {
    let f = fixture();
    let geometry = create(&f, false, true, 0);
    let mut cmd = RecordingCommandBuffer::new(false);
    geometry.bind(&mut cmd);

    assert_eq!(
        cmd.commands(),
        &[
            RecordedCommand::SetVertexInput(VertexInput::position_attribute()),
            RecordedCommand::BindVertexBuffers {
                first_binding: 0,
                buffers: vec![f.gpu_data.position_buffer, f.gpu_data.attribute_buffer],
            },
            RecordedCommand::BindIndexBuffer {
                buffer: f.gpu_data.index_buffer,
                offset: 0,
                index_type: IndexType::U16,
            },
        ]
    );
}

#[test]
fn vertex_draw_uses_submesh_index_range() {
    let f = fixture();
    let geometry = create(&f, false, true, 4);
    let mut cmd = RecordingCommandBuffer::new(false);

    geometry.draw(&mut cmd, 0, 1);
    geometry.draw(&mut cmd, 1, 3);

    // Submesh 0: meshlets 0..4 (8 triangles). Submesh 1: meshlets 4..6.
    assert_eq!(
        cmd.commands(),
        &[
            RecordedCommand::DrawIndexed {
                index_count: 24,
                instance_count: 1,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            },
            RecordedCommand::DrawIndexed {
                index_count: 12,
                instance_count: 3,
                first_index: 24,
                vertex_offset: 0,
                first_instance: 0,
            },
        ]
    );
}

#[test]
fn vertex_draw_out_of_range_records_nothing() {
    let f = fixture();
    let geometry = create(&f, false, true, 0);
    let mut cmd = RecordingCommandBuffer::new(false);
    geometry.draw(&mut cmd, 7, 1);
    assert!(cmd.commands().is_empty());
}

// ============================================================================
// Meshlet path
// ============================================================================

fn push_constants(command: &RecordedCommand) -> MeshletPushConstants {
    match command {
        RecordedCommand::PushConstants { stages, offset, data } => {
            assert_eq!(*stages, ShaderStageFlags::MESH | ShaderStageFlags::TASK);
            assert_eq!(*offset, 0);
            bytemuck::pod_read_unaligned(data)
        }
        other => panic!("expected push constants, got {other:?}"),
    }
}

#[test]
fn meshlet_bind_pushes_limits() {
    let f = fixture();
    let geometry = create(&f, true, true, 0);
    let mut cmd = RecordingCommandBuffer::new(true);
    geometry.bind(&mut cmd);

    assert_eq!(cmd.commands().len(), 1);
    let constants = push_constants(&cmd.commands()[0]);
    assert_eq!(
        constants,
        MeshletPushConstants {
            meshlet_offset: 0,
            max_vertex_count: 64,
            max_triangle_count: 2,
        }
    );
}

#[test]
fn meshlet_draw_dispatches_one_group_per_meshlet() {
    let f = fixture();
    let geometry = create(&f, true, true, 4);
    let mut cmd = RecordingCommandBuffer::new(true);
    geometry.draw(&mut cmd, 1, 1);

    let commands = cmd.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(push_constants(&commands[0]).meshlet_offset, 4);
    assert_eq!(commands[1], RecordedCommand::DrawMeshTasks { x: 2, y: 1, z: 1 });
}
