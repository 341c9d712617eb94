//! Image Loading
//!
//! Decodes PNG/JPEG sources (or raw RGBA8 pixels) into an [`ImageData`] mip
//! chain, uploads it through staging buffers and wraps the result in an
//! [`ImageAsset`].
//!
//! Decoded data is de-duplicated through an explicitly owned
//! [`ImageCache`], keyed by resolved path, feature flags and format. The
//! cache is append-only; call [`ImageCache::clear`] to reset it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use image::imageops::FilterType;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::Xxh3;

use crate::errors::{LoaderError, Result};
use crate::gpu::{
    BufferCreateInfo, BufferUsage, Extent3d, Format, GpuDevice, ImageCreateInfo, ImageHandle, ImageUsage,
    MemoryDomain, TransferCommand,
};

use super::timestamp_now;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageFeatureFlags: u32 {
        const GENERATE_MIPS = 1 << 0;
        const FLIP_Y        = 1 << 1;
        const CUBEMAP       = 1 << 2;
        const SRGB          = 1 << 3;
        /// Skip the de-dup cache.
        const FORCE_RELOAD  = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageContainerType {
    /// Detect from the file extension.
    #[default]
    Default,
    Ktx,
    Ktx2,
    Png,
    Jpg,
}

impl ImageContainerType {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "ktx" => ImageContainerType::Ktx,
            "ktx2" => ImageContainerType::Ktx2,
            "png" => ImageContainerType::Png,
            "jpg" | "jpeg" => ImageContainerType::Jpg,
            _ => ImageContainerType::Default,
        }
    }

    fn image_format(self) -> Option<image::ImageFormat> {
        match self {
            ImageContainerType::Png => Some(image::ImageFormat::Png),
            ImageContainerType::Jpg => Some(image::ImageFormat::Jpeg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    /// Tightly packed RGBA8 pixels.
    Raw { width: u32, height: u32, data: Vec<u8> },
}

impl Default for ImageSource {
    fn default() -> Self {
        ImageSource::Path(PathBuf::new())
    }
}

#[derive(Debug, Clone)]
pub struct ImageLoadInfo {
    pub debug_name: String,
    pub source: ImageSource,
    pub container_type: ImageContainerType,
    pub feature_flags: ImageFeatureFlags,
    pub usage: ImageUsage,
    pub force_uncached: bool,
}

impl Default for ImageLoadInfo {
    fn default() -> Self {
        Self {
            debug_name: String::new(),
            source: ImageSource::default(),
            container_type: ImageContainerType::Default,
            feature_flags: ImageFeatureFlags::empty(),
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            force_uncached: false,
        }
    }
}

impl ImageLoadInfo {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            debug_name: path.display().to_string(),
            source: ImageSource::Path(path),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn format(&self) -> Format {
        if self.feature_flags.contains(ImageFeatureFlags::SRGB) {
            Format::Rgba8Srgb
        } else {
            Format::Rgba8Unorm
        }
    }
}

/// Decoded RGBA8 pixels, `levels[layer][mip]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub levels: Vec<Vec<Vec<u8>>>,
}

impl ImageData {
    #[must_use]
    pub fn mip_levels(&self) -> u32 {
        self.levels.first().map_or(0, |l| l.len() as u32)
    }

    #[must_use]
    pub fn array_layers(&self) -> u32 {
        self.levels.len() as u32
    }
}

/// Number of levels in a full mip chain: `floor(log2(max(w, h))) + 1`.
#[must_use]
pub fn full_mip_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Default)]
pub struct ImageCache {
    entries: Mutex<FxHashMap<String, Arc<ImageData>>>,
}

impl ImageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn generate_cache_key(path: &Path, flags: ImageFeatureFlags, format: Format) -> String {
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut hasher = Xxh3::new();
        hasher.update(resolved.to_string_lossy().as_bytes());
        // FORCE_RELOAD only controls lookup, not the decoded result.
        hasher.update(&(flags - ImageFeatureFlags::FORCE_RELOAD).bits().to_le_bytes());
        hasher.update(&(format as u32).to_le_bytes());
        format!("{:016x}", hasher.digest())
    }

    pub fn find(&self, key: &str) -> Option<Arc<ImageData>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: String, data: Arc<ImageData>) {
        self.entries.lock().insert(key, data);
    }

    pub fn remove(&self, key: &str) -> Option<Arc<ImageData>> {
        self.entries.lock().remove(key)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ============================================================================
// Asset
// ============================================================================

pub struct ImageAsset {
    handle: ImageHandle,
    device: Arc<dyn GpuDevice>,
    create_info: ImageCreateInfo,

    source_desc: String,
    debug_name: String,
    container_type: ImageContainerType,
    feature_flags: ImageFeatureFlags,
    load_timestamp: u64,
    from_cache: bool,
    cache_key: Option<String>,
}

impl fmt::Debug for ImageAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAsset")
            .field("handle", &self.handle)
            .field("debug_name", &self.debug_name)
            .field("extent", &self.create_info.extent)
            .field("format", &self.create_info.format)
            .finish_non_exhaustive()
    }
}

impl ImageAsset {
    #[must_use]
    pub fn handle(&self) -> ImageHandle {
        self.handle
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.create_info.extent.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.create_info.extent.height
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.create_info.extent.depth
    }

    #[must_use]
    pub fn mip_levels(&self) -> u32 {
        self.create_info.mip_levels
    }

    #[must_use]
    pub fn array_layers(&self) -> u32 {
        self.create_info.array_layers
    }

    #[must_use]
    pub fn format(&self) -> Format {
        self.create_info.format
    }

    #[must_use]
    pub fn aspect_ratio(&self) -> f32 {
        if self.height() == 0 {
            return 1.0;
        }
        self.width() as f32 / self.height() as f32
    }

    #[must_use]
    pub fn is_cubemap(&self) -> bool {
        self.create_info.cube_compatible
    }

    #[must_use]
    pub fn has_mipmaps(&self) -> bool {
        self.mip_levels() > 1
    }

    #[must_use]
    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    #[must_use]
    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
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
    pub fn container_type(&self) -> ImageContainerType {
        self.container_type
    }

    #[must_use]
    pub fn feature_flags(&self) -> ImageFeatureFlags {
        self.feature_flags
    }

    #[must_use]
    pub fn load_timestamp(&self) -> u64 {
        self.load_timestamp
    }

    #[must_use]
    pub fn info_string(&self) -> String {
        format!(
            "Image: {}\nDimensions: {}x{}x{}\nMip Levels: {}\nArray Layers: {}\nFormat: {:?}\nCubemap: {}\nFrom Cache: {}\nSource: {}",
            if self.debug_name.is_empty() { "Unnamed" } else { &self.debug_name },
            self.width(),
            self.height(),
            self.depth(),
            self.mip_levels(),
            self.array_layers(),
            self.format(),
            if self.is_cubemap() { "Yes" } else { "No" },
            if self.from_cache { "Yes" } else { "No" },
            self.source_desc,
        )
    }
}

// ============================================================================
// Loader
// ============================================================================

const CUBEMAP_FACES: [&str; 6] = ["posx", "negx", "posy", "negy", "posz", "negz"];

pub struct ImageLoader;

impl ImageLoader {
    pub fn load(device: &Arc<dyn GpuDevice>, cache: &ImageCache, info: &ImageLoadInfo) -> Result<ImageAsset> {
        let format = info.format();
        let skip_cache = info.force_uncached || info.feature_flags.contains(ImageFeatureFlags::FORCE_RELOAD);

        let (data, source_desc, container_type, cache_key, from_cache) = match &info.source {
            ImageSource::Raw { width, height, data } => {
                let pixels = decode_raw(*width, *height, data, info.feature_flags, format)?;
                (pixels, format!("Raw data ({width}x{height})"), ImageContainerType::Default, None, false)
            }
            ImageSource::Path(path) => {
                let container = match info.container_type {
                    ImageContainerType::Default => ImageContainerType::from_path(path),
                    explicit => explicit,
                };
                let key = ImageCache::generate_cache_key(path, info.feature_flags, format);

                let cached = if skip_cache {
                    log::info!("Skipping image cache for {}", path.display());
                    None
                } else {
                    cache.find(&key)
                };

                if let Some(data) = cached {
                    log::info!("Image cache hit: {}", path.display());
                    (data, path.display().to_string(), container, Some(key), true)
                } else {
                    let data = Arc::new(decode_path(path, container, info.feature_flags, format)?);
                    if !skip_cache {
                        cache.insert(key.clone(), data.clone());
                    }
                    (data, path.display().to_string(), container, Some(key), false)
                }
            }
        };

        let create_info = ImageCreateInfo {
            extent: Extent3d::new_2d(data.width, data.height),
            format,
            mip_levels: data.mip_levels(),
            array_layers: data.array_layers(),
            usage: info.usage | ImageUsage::TRANSFER_DST,
            cube_compatible: data.array_layers() == 6 && info.feature_flags.contains(ImageFeatureFlags::CUBEMAP),
        };

        let handle = device.create_image(&create_info)?;
        if let Err(e) = upload_image(device.as_ref(), handle, &data) {
            device.destroy_image(handle);
            return Err(e);
        }

        log::debug!(
            "Loaded image '{}' ({}x{}, {} mips, {} layers)",
            info.debug_name,
            data.width,
            data.height,
            create_info.mip_levels,
            create_info.array_layers
        );

        Ok(ImageAsset {
            handle,
            device: device.clone(),
            create_info,
            source_desc,
            debug_name: info.debug_name.clone(),
            container_type,
            feature_flags: info.feature_flags,
            load_timestamp: timestamp_now(),
            from_cache,
            cache_key,
        })
    }

    pub fn destroy(asset: &ImageAsset) {
        asset.device.destroy_image(asset.handle);
    }
}

fn cubemap_face_paths(path: &Path) -> [PathBuf; 6] {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("png");
    CUBEMAP_FACES.map(|face| path.with_file_name(format!("{stem}_{face}.{ext}")))
}

fn decode_path(path: &Path, container: ImageContainerType, flags: ImageFeatureFlags, format: Format) -> Result<ImageData> {
    let Some(image_format) = container.image_format() else {
        return Err(LoaderError::UnsupportedFormat(format!(
            "{:?} container for {}",
            container,
            path.display()
        )));
    };

    let faces: Vec<image::RgbaImage> = if flags.contains(ImageFeatureFlags::CUBEMAP) {
        let faces = cubemap_face_paths(path)
            .iter()
            .map(|p| decode_file(p, image_format, flags))
            .collect::<Result<Vec<_>>>()?;
        let (w, h) = faces[0].dimensions();
        if faces.iter().any(|f| f.dimensions() != (w, h)) {
            return Err(LoaderError::runtime("Cube map faces must have the same dimensions"));
        }
        faces
    } else {
        vec![decode_file(path, image_format, flags)?]
    };

    Ok(build_image_data(faces, flags, format))
}

fn decode_file(path: &Path, format: image::ImageFormat, flags: ImageFeatureFlags) -> Result<image::RgbaImage> {
    let bytes = std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LoaderError::AssetNotFound(path.display().to_string())
        } else {
            LoaderError::Io(e)
        }
    })?;
    // RGB sources are promoted to RGBA with an opaque alpha channel.
    let mut rgba = image::load_from_memory_with_format(&bytes, format)?.into_rgba8();
    if flags.contains(ImageFeatureFlags::FLIP_Y) {
        image::imageops::flip_vertical_in_place(&mut rgba);
    }
    Ok(rgba)
}

fn decode_raw(width: u32, height: u32, data: &[u8], flags: ImageFeatureFlags, format: Format) -> Result<Arc<ImageData>> {
    let expected = width as usize * height as usize * 4;
    if width == 0 || height == 0 || data.len() != expected {
        return Err(LoaderError::runtime(format!(
            "Raw image data is {} bytes, expected {expected} for {width}x{height} RGBA8",
            data.len()
        )));
    }
    let mut rgba = image::RgbaImage::from_raw(width, height, data.to_vec())
        .ok_or_else(|| LoaderError::runtime("Raw image buffer does not match its dimensions"))?;
    if flags.contains(ImageFeatureFlags::FLIP_Y) {
        image::imageops::flip_vertical_in_place(&mut rgba);
    }
    Ok(Arc::new(build_image_data(vec![rgba], flags, format)))
}

fn build_image_data(faces: Vec<image::RgbaImage>, flags: ImageFeatureFlags, format: Format) -> ImageData {
    let (width, height) = faces[0].dimensions();
    let mip_count = if flags.contains(ImageFeatureFlags::GENERATE_MIPS) {
        full_mip_count(width, height)
    } else {
        1
    };

    let levels = faces
        .into_iter()
        .map(|base| {
            let mut chain = Vec::with_capacity(mip_count as usize);
            let mut current = base;
            for level in 1..mip_count {
                let e = Extent3d::new_2d(width, height).mip_level(level);
                let next = image::imageops::resize(&current, e.width, e.height, FilterType::Triangle);
                chain.push(std::mem::replace(&mut current, next).into_raw());
            }
            chain.push(current.into_raw());
            chain
        })
        .collect();

    ImageData {
        width,
        height,
        format,
        levels,
    }
}

/// Uploads every layer and level, one staging buffer and submission per layer.
fn upload_image(device: &dyn GpuDevice, image: ImageHandle, data: &ImageData) -> Result<()> {
    for (layer, chain) in data.levels.iter().enumerate() {
        let total: usize = chain.iter().map(Vec::len).sum();
        let staging = device.create_buffer(&BufferCreateInfo {
            size: total as u64,
            usage: BufferUsage::TRANSFER_SRC,
            domain: MemoryDomain::Upload,
        })?;

        let result = (|| {
            device.map_memory(staging)?;
            let mut offset = 0u64;
            let mut commands = Vec::with_capacity(chain.len());
            for (level, bytes) in chain.iter().enumerate() {
                device.write_mapped(staging, offset, bytes)?;
                commands.push(TransferCommand::CopyBufferToImage {
                    src: staging,
                    src_offset: offset,
                    dst: image,
                    mip_level: level as u32,
                    array_layer: layer as u32,
                });
                offset += bytes.len() as u64;
            }
            device.unmap_memory(staging);
            device.submit_and_wait(&commands)
        })();

        device.destroy_buffer(staging);
        result?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_count_matches_log2() {
        assert_eq!(full_mip_count(1, 1), 1);
        assert_eq!(full_mip_count(256, 256), 9);
        assert_eq!(full_mip_count(300, 20), 9);
        assert_eq!(full_mip_count(2, 1), 2);
    }

    #[test]
    fn container_detected_from_extension() {
        assert_eq!(ImageContainerType::from_path(Path::new("a/b.PNG")), ImageContainerType::Png);
        assert_eq!(ImageContainerType::from_path(Path::new("c.jpeg")), ImageContainerType::Jpg);
        assert_eq!(ImageContainerType::from_path(Path::new("d.ktx2")), ImageContainerType::Ktx2);
        assert_eq!(ImageContainerType::from_path(Path::new("e.bmp")), ImageContainerType::Default);
    }

    #[test]
    fn cubemap_faces_use_suffixes() {
        let faces = cubemap_face_paths(Path::new("env/sky.png"));
        assert_eq!(faces[0], Path::new("env/sky_posx.png"));
        assert_eq!(faces[5], Path::new("env/sky_negz.png"));
    }

    #[test]
    fn cache_key_ignores_force_reload() {
        let p = Path::new("does/not/exist.png");
        let a = ImageCache::generate_cache_key(p, ImageFeatureFlags::GENERATE_MIPS, Format::Rgba8Unorm);
        let b = ImageCache::generate_cache_key(
            p,
            ImageFeatureFlags::GENERATE_MIPS | ImageFeatureFlags::FORCE_RELOAD,
            Format::Rgba8Unorm,
        );
        let c = ImageCache::generate_cache_key(p, ImageFeatureFlags::GENERATE_MIPS, Format::Rgba8Srgb);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn raw_mip_chain_halves_each_level() {
        let data = build_image_data(
            vec![image::RgbaImage::from_pixel(8, 4, image::Rgba([10, 20, 30, 255]))],
            ImageFeatureFlags::GENERATE_MIPS,
            Format::Rgba8Unorm,
        );
        assert_eq!(data.mip_levels(), 4);
        let sizes: Vec<usize> = data.levels[0].iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![8 * 4 * 4, 4 * 2 * 4, 2 * 4, 4]);
    }
}
