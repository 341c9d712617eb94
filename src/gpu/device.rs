//! The device boundary the loaders talk to.
//!
//! GPU calls are synchronous; a backend may be driven from worker threads,
//! so [`GpuDevice`] is `Send + Sync`. Command recording is single-threaded
//! and goes through [`CommandRecorder`].

use crate::errors::Result;

use super::types::{
    BufferCreateInfo, BufferHandle, DescriptorBinding, DescriptorSetLayoutHandle, DeviceFeatures,
    ImageCreateInfo, ImageHandle, IndexType, PipelineLayoutHandle, PipelineType, ProgramHandle,
    PushConstantRange, ShaderModuleHandle, ShaderStage, ShaderStageFlags, TransferCommand, VertexInput,
};

pub trait GpuDevice: Send + Sync {
    fn features(&self) -> DeviceFeatures;

    // --- Buffers ---
    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle>;
    fn destroy_buffer(&self, handle: BufferHandle);
    fn buffer_info(&self, handle: BufferHandle) -> Option<BufferCreateInfo>;

    /// Maps a host-visible buffer. Fails for device-local memory.
    fn map_memory(&self, handle: BufferHandle) -> Result<()>;
    /// Writes through an active mapping.
    fn write_mapped(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    fn unmap_memory(&self, handle: BufferHandle);

    // --- Images ---
    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle>;
    fn destroy_image(&self, handle: ImageHandle);

    // --- Shaders & pipelines ---
    fn create_shader_module(&self, stage: ShaderStage, code: &[u32]) -> Result<ShaderModuleHandle>;
    fn destroy_shader_module(&self, handle: ShaderModuleHandle);

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&self, handle: DescriptorSetLayoutHandle);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constants: Option<PushConstantRange>,
    ) -> Result<PipelineLayoutHandle>;
    fn destroy_pipeline_layout(&self, handle: PipelineLayoutHandle);

    fn create_program(
        &self,
        pipeline_type: PipelineType,
        stages: &[(ShaderStage, ShaderModuleHandle, String)],
        layout: PipelineLayoutHandle,
        vertex_input: &VertexInput,
    ) -> Result<ProgramHandle>;
    fn destroy_program(&self, handle: ProgramHandle);

    // --- Submission ---
    /// Executes transfer work and blocks until it has completed.
    fn submit_and_wait(&self, commands: &[TransferCommand]) -> Result<()>;
    fn wait_idle(&self);
}

/// Draw-time command recording.
pub trait CommandRecorder {
    fn supports_mesh_shading(&self) -> bool;

    fn set_vertex_input(&mut self, input: &VertexInput);
    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[BufferHandle]);
    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType);
    fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]);

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn draw_mesh_tasks(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32);
}
