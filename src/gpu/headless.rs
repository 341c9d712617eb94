//! In-memory backend.
//!
//! [`HeadlessDevice`] keeps every resource in host memory so loaders can run
//! in tooling and tests without a GPU. Transfer commands are executed
//! eagerly on submission; the raw bytes of buffers and image levels can be
//! read back for inspection.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::errors::{LoaderError, Result};

use super::device::{CommandRecorder, GpuDevice};
use super::types::{
    BufferCreateInfo, BufferHandle, DescriptorBinding, DescriptorSetLayoutHandle, DeviceFeatures,
    ImageCreateInfo, ImageHandle, IndexType, PipelineLayoutHandle, PipelineType, ProgramHandle,
    PushConstantRange, ShaderModuleHandle, ShaderStage, ShaderStageFlags, TransferCommand, VertexInput,
};

struct BufferEntry {
    info: BufferCreateInfo,
    data: Vec<u8>,
    mapped: bool,
}

struct ImageEntry {
    info: ImageCreateInfo,
    /// `layer * mip_levels + level`
    levels: Vec<Vec<u8>>,
}

impl ImageEntry {
    fn level_size(&self, level: u32) -> usize {
        let e = self.info.extent.mip_level(level);
        (e.width * e.height * e.depth * self.info.format.block_size()) as usize
    }
}

/// Snapshot of a created program, for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDesc {
    pub pipeline_type: PipelineType,
    pub stages: Vec<(ShaderStage, ShaderModuleHandle, String)>,
    pub layout: PipelineLayoutHandle,
    pub vertex_input: VertexInput,
}

#[derive(Default)]
struct Registry {
    buffers: SlotMap<BufferHandle, BufferEntry>,
    images: SlotMap<ImageHandle, ImageEntry>,
    shader_modules: SlotMap<ShaderModuleHandle, (ShaderStage, Vec<u32>)>,
    set_layouts: SlotMap<DescriptorSetLayoutHandle, Vec<DescriptorBinding>>,
    pipeline_layouts: SlotMap<PipelineLayoutHandle, (Vec<DescriptorSetLayoutHandle>, Option<PushConstantRange>)>,
    programs: SlotMap<ProgramHandle, ProgramDesc>,
}

pub struct HeadlessDevice {
    features: DeviceFeatures,
    registry: Mutex<Registry>,
    submitted: Mutex<Vec<TransferCommand>>,
    submit_count: AtomicUsize,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(DeviceFeatures::default())
    }
}

impl HeadlessDevice {
    #[must_use]
    pub fn new(features: DeviceFeatures) -> Self {
        Self {
            features,
            registry: Mutex::new(Registry::default()),
            submitted: Mutex::new(Vec::new()),
            submit_count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_mesh_shading() -> Self {
        Self::new(DeviceFeatures {
            mesh_shading: true,
            ..Default::default()
        })
    }

    // --- Inspection ---

    #[must_use]
    pub fn buffer_data(&self, handle: BufferHandle) -> Option<Vec<u8>> {
        self.registry.lock().buffers.get(handle).map(|b| b.data.clone())
    }

    #[must_use]
    pub fn is_mapped(&self, handle: BufferHandle) -> bool {
        self.registry.lock().buffers.get(handle).is_some_and(|b| b.mapped)
    }

    #[must_use]
    pub fn image_info(&self, handle: ImageHandle) -> Option<ImageCreateInfo> {
        self.registry.lock().images.get(handle).map(|i| i.info)
    }

    #[must_use]
    pub fn image_level(&self, handle: ImageHandle, layer: u32, level: u32) -> Option<Vec<u8>> {
        let registry = self.registry.lock();
        let image = registry.images.get(handle)?;
        let idx = (layer * image.info.mip_levels + level) as usize;
        image.levels.get(idx).cloned()
    }

    #[must_use]
    pub fn shader_module_code(&self, handle: ShaderModuleHandle) -> Option<Vec<u32>> {
        self.registry.lock().shader_modules.get(handle).map(|(_, code)| code.clone())
    }

    #[must_use]
    pub fn program(&self, handle: ProgramHandle) -> Option<ProgramDesc> {
        self.registry.lock().programs.get(handle).cloned()
    }

    #[must_use]
    pub fn set_layout_bindings(&self, handle: DescriptorSetLayoutHandle) -> Option<Vec<DescriptorBinding>> {
        self.registry.lock().set_layouts.get(handle).cloned()
    }

    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.registry.lock().buffers.len()
    }

    #[must_use]
    pub fn live_image_count(&self) -> usize {
        self.registry.lock().images.len()
    }

    #[must_use]
    pub fn live_shader_module_count(&self) -> usize {
        self.registry.lock().shader_modules.len()
    }

    #[must_use]
    pub fn live_program_count(&self) -> usize {
        self.registry.lock().programs.len()
    }

    /// Total number of resources of every kind still alive.
    #[must_use]
    pub fn live_resource_count(&self) -> usize {
        let r = self.registry.lock();
        r.buffers.len()
            + r.images.len()
            + r.shader_modules.len()
            + r.set_layouts.len()
            + r.pipeline_layouts.len()
            + r.programs.len()
    }

    #[must_use]
    pub fn submit_count(&self) -> usize {
        self.submit_count.load(Ordering::Relaxed)
    }

    /// Every transfer command executed so far, in submission order.
    #[must_use]
    pub fn submitted_commands(&self) -> Vec<TransferCommand> {
        self.submitted.lock().clone()
    }

    fn execute(registry: &mut Registry, command: &TransferCommand) -> Result<()> {
        match command {
            TransferCommand::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                let bytes = {
                    let src = registry
                        .buffers
                        .get(*src)
                        .ok_or_else(|| LoaderError::Device("copy from a destroyed buffer".into()))?;
                    slice_range(&src.data, *src_offset, *size)?.to_vec()
                };
                let dst = registry
                    .buffers
                    .get_mut(*dst)
                    .ok_or_else(|| LoaderError::Device("copy into a destroyed buffer".into()))?;
                write_range(&mut dst.data, *dst_offset, &bytes)
            }
            TransferCommand::UpdateBuffer { dst, dst_offset, data } => {
                let dst = registry
                    .buffers
                    .get_mut(*dst)
                    .ok_or_else(|| LoaderError::Device("update of a destroyed buffer".into()))?;
                write_range(&mut dst.data, *dst_offset, data)
            }
            TransferCommand::CopyBufferToImage { src, src_offset, dst, mip_level, array_layer } => {
                let image = registry
                    .images
                    .get(*dst)
                    .ok_or_else(|| LoaderError::Device("copy into a destroyed image".into()))?;
                if *mip_level >= image.info.mip_levels || *array_layer >= image.info.array_layers {
                    return Err(LoaderError::Device(format!(
                        "image subresource (layer {array_layer}, level {mip_level}) out of range"
                    )));
                }
                let size = image.level_size(*mip_level) as u64;
                let idx = (*array_layer * image.info.mip_levels + *mip_level) as usize;

                let bytes = {
                    let src = registry
                        .buffers
                        .get(*src)
                        .ok_or_else(|| LoaderError::Device("copy from a destroyed buffer".into()))?;
                    slice_range(&src.data, *src_offset, size)?.to_vec()
                };
                if let Some(image) = registry.images.get_mut(*dst) {
                    image.levels[idx] = bytes;
                }
                Ok(())
            }
        }
    }
}

fn slice_range(data: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
    let start = offset as usize;
    let end = start.saturating_add(size as usize);
    data.get(start..end)
        .ok_or_else(|| LoaderError::Device(format!("range {start}..{end} exceeds buffer of {} bytes", data.len())))
}

fn write_range(data: &mut [u8], offset: u64, bytes: &[u8]) -> Result<()> {
    let start = offset as usize;
    let end = start.saturating_add(bytes.len());
    let len = data.len();
    data.get_mut(start..end)
        .ok_or_else(|| LoaderError::Device(format!("range {start}..{end} exceeds buffer of {len} bytes")))?
        .copy_from_slice(bytes);
    Ok(())
}

impl GpuDevice for HeadlessDevice {
    fn features(&self) -> DeviceFeatures {
        self.features
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        if info.size == 0 {
            return Err(LoaderError::Device("zero-sized buffer".into()));
        }
        let entry = BufferEntry {
            info: *info,
            data: vec![0; info.size as usize],
            mapped: false,
        };
        Ok(self.registry.lock().buffers.insert(entry))
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        if self.registry.lock().buffers.remove(handle).is_none() {
            log::warn!("destroy_buffer: stale handle {handle:?}");
        }
    }

    fn buffer_info(&self, handle: BufferHandle) -> Option<BufferCreateInfo> {
        self.registry.lock().buffers.get(handle).map(|b| b.info)
    }

    fn map_memory(&self, handle: BufferHandle) -> Result<()> {
        let mut registry = self.registry.lock();
        let buffer = registry
            .buffers
            .get_mut(handle)
            .ok_or_else(|| LoaderError::Device(format!("map of unknown buffer {handle:?}")))?;
        if !buffer.info.domain.is_host_visible() {
            return Err(LoaderError::Device("device-local memory cannot be mapped".into()));
        }
        buffer.mapped = true;
        Ok(())
    }

    fn write_mapped(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut registry = self.registry.lock();
        let buffer = registry
            .buffers
            .get_mut(handle)
            .ok_or_else(|| LoaderError::Device(format!("write to unknown buffer {handle:?}")))?;
        if !buffer.mapped {
            return Err(LoaderError::Device("write to an unmapped buffer".into()));
        }
        write_range(&mut buffer.data, offset, data)
    }

    fn unmap_memory(&self, handle: BufferHandle) {
        if let Some(buffer) = self.registry.lock().buffers.get_mut(handle) {
            buffer.mapped = false;
        }
    }

    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        if info.extent.width == 0 || info.extent.height == 0 || info.mip_levels == 0 || info.array_layers == 0 {
            return Err(LoaderError::Device("degenerate image extent".into()));
        }
        let mut entry = ImageEntry {
            info: *info,
            levels: Vec::with_capacity((info.mip_levels * info.array_layers) as usize),
        };
        for _layer in 0..info.array_layers {
            for level in 0..info.mip_levels {
                let size = entry.level_size(level);
                entry.levels.push(vec![0; size]);
            }
        }
        Ok(self.registry.lock().images.insert(entry))
    }

    fn destroy_image(&self, handle: ImageHandle) {
        if self.registry.lock().images.remove(handle).is_none() {
            log::warn!("destroy_image: stale handle {handle:?}");
        }
    }

    fn create_shader_module(&self, stage: ShaderStage, code: &[u32]) -> Result<ShaderModuleHandle> {
        if code.is_empty() {
            return Err(LoaderError::Device(format!("empty {} shader module", stage.name())));
        }
        Ok(self.registry.lock().shader_modules.insert((stage, code.to_vec())))
    }

    fn destroy_shader_module(&self, handle: ShaderModuleHandle) {
        if self.registry.lock().shader_modules.remove(handle).is_none() {
            log::warn!("destroy_shader_module: stale handle {handle:?}");
        }
    }

    fn create_descriptor_set_layout(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetLayoutHandle> {
        Ok(self.registry.lock().set_layouts.insert(bindings.to_vec()))
    }

    fn destroy_descriptor_set_layout(&self, handle: DescriptorSetLayoutHandle) {
        if self.registry.lock().set_layouts.remove(handle).is_none() {
            log::warn!("destroy_descriptor_set_layout: stale handle {handle:?}");
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constants: Option<PushConstantRange>,
    ) -> Result<PipelineLayoutHandle> {
        let mut registry = self.registry.lock();
        if let Some(missing) = set_layouts.iter().find(|h| !registry.set_layouts.contains_key(**h)) {
            return Err(LoaderError::Device(format!("unknown descriptor set layout {missing:?}")));
        }
        Ok(registry.pipeline_layouts.insert((set_layouts.to_vec(), push_constants)))
    }

    fn destroy_pipeline_layout(&self, handle: PipelineLayoutHandle) {
        if self.registry.lock().pipeline_layouts.remove(handle).is_none() {
            log::warn!("destroy_pipeline_layout: stale handle {handle:?}");
        }
    }

    fn create_program(
        &self,
        pipeline_type: PipelineType,
        stages: &[(ShaderStage, ShaderModuleHandle, String)],
        layout: PipelineLayoutHandle,
        vertex_input: &VertexInput,
    ) -> Result<ProgramHandle> {
        let mut registry = self.registry.lock();
        if !registry.pipeline_layouts.contains_key(layout) {
            return Err(LoaderError::Device(format!("unknown pipeline layout {layout:?}")));
        }
        if let Some((stage, ..)) = stages.iter().find(|(_, m, _)| !registry.shader_modules.contains_key(*m)) {
            return Err(LoaderError::Device(format!("{} stage references a destroyed module", stage.name())));
        }
        Ok(registry.programs.insert(ProgramDesc {
            pipeline_type,
            stages: stages.to_vec(),
            layout,
            vertex_input: vertex_input.clone(),
        }))
    }

    fn destroy_program(&self, handle: ProgramHandle) {
        if self.registry.lock().programs.remove(handle).is_none() {
            log::warn!("destroy_program: stale handle {handle:?}");
        }
    }

    fn submit_and_wait(&self, commands: &[TransferCommand]) -> Result<()> {
        let mut registry = self.registry.lock();
        for command in commands {
            Self::execute(&mut registry, command)?;
        }
        self.submitted.lock().extend_from_slice(commands);
        self.submit_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait_idle(&self) {}
}

// ============================================================================
// Recording command buffer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    SetVertexInput(VertexInput),
    BindVertexBuffers { first_binding: u32, buffers: Vec<BufferHandle> },
    BindIndexBuffer { buffer: BufferHandle, offset: u64, index_type: IndexType },
    PushConstants { stages: ShaderStageFlags, offset: u32, data: Vec<u8> },
    DrawIndexed { index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32 },
    DrawMeshTasks { x: u32, y: u32, z: u32 },
}

/// A [`CommandRecorder`] that stores the command stream for inspection.
#[derive(Debug, Default)]
pub struct RecordingCommandBuffer {
    mesh_shading: bool,
    commands: Vec<RecordedCommand>,
}

impl RecordingCommandBuffer {
    #[must_use]
    pub fn new(mesh_shading: bool) -> Self {
        Self {
            mesh_shading,
            commands: Vec::new(),
        }
    }

    #[must_use]
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl CommandRecorder for RecordingCommandBuffer {
    fn supports_mesh_shading(&self) -> bool {
        self.mesh_shading
    }

    fn set_vertex_input(&mut self, input: &VertexInput) {
        self.commands.push(RecordedCommand::SetVertexInput(input.clone()));
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[BufferHandle]) {
        self.commands.push(RecordedCommand::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
        });
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        self.commands.push(RecordedCommand::BindIndexBuffer { buffer, offset, index_type });
    }

    fn push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        self.commands.push(RecordedCommand::PushConstants {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.commands.push(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    fn draw_mesh_tasks(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.commands.push(RecordedCommand::DrawMeshTasks {
            x: group_count_x,
            y: group_count_y,
            z: group_count_z,
        });
    }
}
