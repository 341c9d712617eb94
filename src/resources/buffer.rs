//! Buffer Loading
//!
//! Turns a [`BufferLoadInfo`] into a device buffer plus a [`BufferAsset`]
//! facade, and implements the live update path used by
//! [`ResourceLoader::update`](super::ResourceLoader::update).
//!
//! Initial data reaches the buffer one of two ways:
//! - Host-visible memory is mapped and written directly
//! - Device-local memory is filled through staging buffers, at most
//!   `max_upload_size` bytes per submission

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::errors::{LoaderError, Result};
use crate::gpu::{BufferCreateInfo, BufferHandle, BufferUsage, GpuDevice, MemoryDomain, TransferCommand, WHOLE_SIZE};

use super::timestamp_now;

/// Updates up to this size are recorded inline into the command stream.
pub const LIMIT_BUFFER_CMD_UPDATE_SIZE: u64 = 64 * 1024;
/// Default cap on bytes per staging submission.
pub const LIMIT_BUFFER_UPLOAD_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferContentType {
    Unknown,
    Vertex,
    Index,
    Uniform,
    Storage,
    Indirect,
    #[default]
    RawData,
}

impl BufferContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BufferContentType::Vertex => "Vertex Data",
            BufferContentType::Index => "Index Data",
            BufferContentType::Uniform => "Uniform Data",
            BufferContentType::Storage => "Storage Data",
            BufferContentType::Indirect => "Indirect Commands",
            BufferContentType::RawData => "Raw Data",
            BufferContentType::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferLoadInfo {
    pub debug_name: String,
    /// Initial contents; must fit in `create_info.size`.
    pub data: Option<Vec<u8>>,
    pub create_info: BufferCreateInfo,
    pub content_type: BufferContentType,
    /// No effect: buffers are never cached.
    pub force_uncached: bool,
}

impl BufferLoadInfo {
    /// A buffer sized to and initialized with `data`.
    pub fn from_slice<T: bytemuck::Pod>(
        debug_name: impl Into<String>,
        data: &[T],
        usage: BufferUsage,
        content_type: BufferContentType,
    ) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        Self {
            debug_name: debug_name.into(),
            data: Some(bytes.to_vec()),
            create_info: BufferCreateInfo {
                size: bytes.len() as u64,
                usage,
                domain: MemoryDomain::Device,
            },
            content_type,
            force_uncached: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data.as_ref().map_or(0, |d| d.len() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRange {
    pub offset: u64,
    /// [`WHOLE_SIZE`] means "to the end of the buffer".
    pub size: u64,
}

impl Default for BufferRange {
    fn default() -> Self {
        Self {
            offset: 0,
            size: WHOLE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferUpdateInfo<'a> {
    pub data: &'a [u8],
    pub range: BufferRange,
}

impl<'a> BufferUpdateInfo<'a> {
    #[must_use]
    pub fn new(data: &'a [u8], offset: u64) -> Self {
        Self {
            data,
            range: BufferRange {
                offset,
                size: data.len() as u64,
            },
        }
    }
}

// ============================================================================
// Asset
// ============================================================================

pub struct BufferAsset {
    handle: BufferHandle,
    device: Arc<dyn GpuDevice>,
    create_info: BufferCreateInfo,

    source_desc: String,
    debug_name: String,
    content_type: BufferContentType,
    load_timestamp: u64,
    mapped: AtomicBool,
}

impl fmt::Debug for BufferAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferAsset")
            .field("handle", &self.handle)
            .field("debug_name", &self.debug_name)
            .field("size", &self.create_info.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl BufferAsset {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.create_info.size
    }

    #[inline]
    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.create_info.usage
    }

    /// The resolved memory domain (never [`MemoryDomain::Auto`]).
    #[inline]
    #[must_use]
    pub fn domain(&self) -> MemoryDomain {
        self.create_info.domain
    }

    #[must_use]
    pub fn source_desc(&self) -> &str {
        &self.source_desc
    }

    #[must_use]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    #[must_use]
    pub fn content_type(&self) -> BufferContentType {
        self.content_type
    }

    #[must_use]
    pub fn load_timestamp(&self) -> u64 {
        self.load_timestamp
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Maps the whole buffer. Only host-visible buffers can be mapped.
    pub fn map(&self) -> Result<()> {
        self.device.map_memory(self.handle)?;
        self.mapped.store(true, Ordering::Release);
        Ok(())
    }

    pub fn write_mapped(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.is_mapped() {
            return Err(LoaderError::runtime(format!("Buffer '{}' is not mapped", self.debug_name)));
        }
        self.device.write_mapped(self.handle, offset, data)
    }

    pub fn unmap(&self) {
        if self.mapped.swap(false, Ordering::AcqRel) {
            self.device.unmap_memory(self.handle);
        }
    }

    #[must_use]
    pub fn usage_string(&self) -> String {
        self.usage().to_string()
    }

    #[must_use]
    pub fn content_type_string(&self) -> &'static str {
        self.content_type.as_str()
    }

    #[must_use]
    pub fn info_string(&self) -> String {
        format!(
            "Buffer: {}\nSize: {} bytes\nUsage: {}\nContent Type: {}\nSource: {}",
            if self.debug_name.is_empty() { "Unnamed" } else { &self.debug_name },
            self.size(),
            self.usage_string(),
            self.content_type_string(),
            if self.source_desc.is_empty() { "Unknown" } else { &self.source_desc },
        )
    }
}

// ============================================================================
// Loader
// ============================================================================

pub struct BufferLoader;

impl BufferLoader {
    pub fn load(device: &Arc<dyn GpuDevice>, info: &BufferLoadInfo, max_upload_size: u64) -> Result<BufferAsset> {
        if info.create_info.size == 0 {
            return Err(LoaderError::runtime("Buffer size cannot be zero"));
        }
        if info.data_size() > info.create_info.size {
            return Err(LoaderError::runtime(format!(
                "Data size ({}) exceeds buffer size ({}) for '{}'",
                info.data_size(),
                info.create_info.size,
                info.debug_name
            )));
        }

        let data = info.data.as_deref().filter(|d| !d.is_empty());

        let mut create_info = info.create_info;
        if data.is_some() {
            create_info.usage |= BufferUsage::TRANSFER_DST;
        }
        if create_info.domain == MemoryDomain::Auto {
            create_info.domain = if create_info.usage.intersects(BufferUsage::UNIFORM | BufferUsage::STORAGE) {
                MemoryDomain::Host
            } else {
                MemoryDomain::Device
            };
        }

        let handle = device.create_buffer(&create_info)?;

        if let Some(bytes) = data {
            let upload = if create_info.domain.is_host_visible() {
                write_host_visible(device.as_ref(), handle, 0, bytes)
            } else {
                upload_via_staging(device.as_ref(), handle, 0, bytes, max_upload_size)
            };
            if let Err(e) = upload {
                device.destroy_buffer(handle);
                return Err(e);
            }
        }

        log::debug!("Loaded buffer '{}' ({} bytes)", info.debug_name, create_info.size);

        Ok(BufferAsset {
            handle,
            device: device.clone(),
            create_info,
            source_desc: format!("Raw data buffer ({} bytes)", info.data_size()),
            debug_name: info.debug_name.clone(),
            content_type: info.content_type,
            load_timestamp: timestamp_now(),
            mapped: AtomicBool::new(false),
        })
    }

    /// Writes `update.data` into `asset` at `update.range`.
    pub fn update(asset: &BufferAsset, update: &BufferUpdateInfo<'_>, max_upload_size: u64) -> Result<()> {
        let buffer_size = asset.size();
        let offset = update.range.offset;
        if offset > buffer_size {
            return Err(LoaderError::runtime(format!(
                "Update offset {offset} is past the end of '{}' ({buffer_size} bytes)",
                asset.debug_name
            )));
        }

        let size = if update.range.size == WHOLE_SIZE {
            buffer_size - offset
        } else {
            update.range.size
        };
        if offset.checked_add(size).is_none_or(|end| end > buffer_size) {
            return Err(LoaderError::runtime(format!(
                "Update range {offset}+{size} exceeds '{}' ({buffer_size} bytes)",
                asset.debug_name
            )));
        }
        if (update.data.len() as u64) < size {
            return Err(LoaderError::runtime(format!(
                "Update data ({} bytes) is shorter than the range ({size} bytes)",
                update.data.len()
            )));
        }
        if size == 0 {
            return Ok(());
        }

        let bytes = &update.data[..size as usize];
        let device = asset.device.as_ref();

        if asset.domain().is_host_visible() {
            // Leave a caller's own mapping in place.
            let mapped_here = !asset.is_mapped();
            if mapped_here {
                asset.map()?;
            }
            let result = asset.write_mapped(offset, bytes);
            if mapped_here {
                asset.unmap();
            }
            result
        } else if size <= LIMIT_BUFFER_CMD_UPDATE_SIZE {
            device.submit_and_wait(&[TransferCommand::UpdateBuffer {
                dst: asset.handle,
                dst_offset: offset,
                data: bytes.to_vec(),
            }])
        } else {
            upload_via_staging(device, asset.handle, offset, bytes, max_upload_size)
        }
    }

    pub fn destroy(asset: &BufferAsset) {
        asset.unmap();
        asset.device.destroy_buffer(asset.handle);
    }
}

fn write_host_visible(device: &dyn GpuDevice, handle: BufferHandle, offset: u64, bytes: &[u8]) -> Result<()> {
    device.map_memory(handle)?;
    let result = device.write_mapped(handle, offset, bytes);
    device.unmap_memory(handle);
    result
}

/// Copies `bytes` into a device-local buffer through short-lived staging
/// buffers. Each chunk is submitted and waited on before the next one, which
/// bounds peak staging memory to `max_chunk` bytes.
pub(crate) fn upload_via_staging(
    device: &dyn GpuDevice,
    dst: BufferHandle,
    dst_offset: u64,
    bytes: &[u8],
    max_chunk: u64,
) -> Result<()> {
    let chunk_size = max_chunk.max(1) as usize;
    for (i, chunk) in bytes.chunks(chunk_size).enumerate() {
        let staging = device.create_buffer(&BufferCreateInfo {
            size: chunk.len() as u64,
            usage: BufferUsage::TRANSFER_SRC,
            domain: MemoryDomain::Upload,
        })?;

        let result = write_host_visible(device, staging, 0, chunk).and_then(|()| {
            device.submit_and_wait(&[TransferCommand::CopyBuffer {
                src: staging,
                src_offset: 0,
                dst,
                dst_offset: dst_offset + (i * chunk_size) as u64,
                size: chunk.len() as u64,
            }])
        });
        device.destroy_buffer(staging);
        result?;
    }
    Ok(())
}
