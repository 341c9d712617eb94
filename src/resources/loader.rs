//! Resource Loader
//!
//! The single entry point for creating and destroying assets.
//!
//! - [`ResourceLoader::load`] dispatches on the load-info type, stores the
//!   asset in a typed arena and registers how to unload it.
//! - [`ResourceLoader::unload`] runs that registration exactly once.
//! - [`LoadRequest`] batches loads and runs them inline or on the worker
//!   pool.
//!
//! The loader is cheap to clone; all clones share the same state.
//!
//! ```rust,ignore
//! let loader = ResourceLoader::new(device, ResourceLoaderCreateInfo::default())?;
//!
//! let mut request = loader.create_request();
//! let mesh = request.add(GeometryLoadInfo::from_path("models/bunny.glb"));
//! let albedo = request.add(ImageLoadInfo::from_path("textures/albedo.png"));
//! request.load_async().wait()?;
//!
//! let mesh = loader.geometry(mesh.get().unwrap()).unwrap();
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::assets::{
    AssetHandle, AssetStorage, BufferAssetHandle, GeometryAssetHandle, ImageAssetHandle, ShaderAssetHandle,
};
use crate::errors::{LoaderError, Result};
use crate::gpu::{DeviceFeatures, GpuDevice};
use crate::tasks::{TaskFuture, TaskGroup, TaskManager, default_thread_count};

use super::buffer::{BufferAsset, BufferLoadInfo, BufferLoader, BufferUpdateInfo, LIMIT_BUFFER_UPLOAD_SIZE};
use super::geometry::{GeometryAsset, GeometryLoadInfo, GeometryLoader};
use super::image::{ImageAsset, ImageCache, ImageLoadInfo, ImageLoader};
use super::shader::{DEFAULT_SHADER_CACHE_DIR, ShaderAsset, ShaderCache, ShaderCompiler, ShaderLoadInfo, ShaderLoader};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone)]
pub struct ResourceLoaderCreateInfo {
    /// When false, [`LoadRequest::load_async`] runs on the caller's thread.
    pub async_loading: bool,
    /// ORed into every shader, image and geometry request.
    pub force_uncached: bool,
    pub worker_threads: usize,
    pub shader_cache_dir: PathBuf,
    /// Largest single staging upload, in bytes.
    pub max_upload_size: u64,
    /// Shared image cache; a private one is created when `None`.
    pub image_cache: Option<Arc<ImageCache>>,
    /// Defaults to the WGSL compiler when the `wgsl` feature is enabled.
    pub shader_compiler: Option<Arc<dyn ShaderCompiler>>,
}

impl Default for ResourceLoaderCreateInfo {
    fn default() -> Self {
        Self {
            async_loading: true,
            force_uncached: false,
            worker_threads: default_thread_count(),
            shader_cache_dir: PathBuf::from(DEFAULT_SHADER_CACHE_DIR),
            max_upload_size: LIMIT_BUFFER_UPLOAD_SIZE,
            image_cache: None,
            shader_compiler: None,
        }
    }
}

impl fmt::Debug for ResourceLoaderCreateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLoaderCreateInfo")
            .field("async_loading", &self.async_loading)
            .field("force_uncached", &self.force_uncached)
            .field("worker_threads", &self.worker_threads)
            .field("shader_cache_dir", &self.shader_cache_dir)
            .field("max_upload_size", &self.max_upload_size)
            .field("image_cache", &self.image_cache.is_some())
            .field("shader_compiler", &self.shader_compiler.is_some())
            .finish()
    }
}

// ============================================================================
// Shared state
// ============================================================================

type UnloadFn = Box<dyn FnOnce(&LoaderContext) + Send>;

struct LoaderContext {
    device: Arc<dyn GpuDevice>,
    async_loading: bool,
    force_uncached: bool,
    max_upload_size: u64,

    tasks: TaskManager,
    image_cache: Arc<ImageCache>,
    shader_loader: ShaderLoader,

    buffers: AssetStorage<BufferAssetHandle, BufferAsset>,
    images: AssetStorage<ImageAssetHandle, ImageAsset>,
    geometries: AssetStorage<GeometryAssetHandle, GeometryAsset>,
    shaders: AssetStorage<ShaderAssetHandle, ShaderAsset>,

    unload_table: Mutex<FxHashMap<AssetHandle, UnloadFn>>,
    update_lock: Mutex<()>,
}

impl LoaderContext {
    fn register(&self, handle: impl Into<AssetHandle>, unload: UnloadFn) {
        self.unload_table.lock().insert(handle.into(), unload);
    }
}

impl Drop for LoaderContext {
    fn drop(&mut self) {
        let pending = self.unload_table.get_mut().len();
        if pending > 0 {
            log::warn!("ResourceLoader dropped with {pending} assets still loaded");
        }
    }
}

// ============================================================================
// Typed loads
// ============================================================================

/// Load descriptions accepted by [`ResourceLoader::load`].
pub trait LoadInfo: Send + 'static {
    type Handle: Copy + Into<AssetHandle> + Send + Sync + 'static;

    fn load_with(self, loader: &ResourceLoader) -> Result<Self::Handle>;
}

impl LoadInfo for BufferLoadInfo {
    type Handle = BufferAssetHandle;

    fn load_with(self, loader: &ResourceLoader) -> Result<Self::Handle> {
        let ctx = &loader.inner;
        let asset = BufferLoader::load(&ctx.device, &self, ctx.max_upload_size)?;
        let handle = ctx.buffers.add(asset);
        ctx.register(
            handle,
            Box::new(move |ctx: &LoaderContext| {
                if let Some(asset) = ctx.buffers.remove(handle) {
                    BufferLoader::destroy(&asset);
                }
            }),
        );
        Ok(handle)
    }
}

impl LoadInfo for ImageLoadInfo {
    type Handle = ImageAssetHandle;

    fn load_with(mut self, loader: &ResourceLoader) -> Result<Self::Handle> {
        let ctx = &loader.inner;
        self.force_uncached |= ctx.force_uncached;
        let asset = ImageLoader::load(&ctx.device, &ctx.image_cache, &self)?;
        let handle = ctx.images.add(asset);
        ctx.register(
            handle,
            Box::new(move |ctx: &LoaderContext| {
                if let Some(asset) = ctx.images.remove(handle) {
                    ImageLoader::destroy(&asset);
                }
            }),
        );
        Ok(handle)
    }
}

impl LoadInfo for GeometryLoadInfo {
    type Handle = GeometryAssetHandle;

    fn load_with(mut self, loader: &ResourceLoader) -> Result<Self::Handle> {
        let ctx = &loader.inner;
        self.force_uncached |= ctx.force_uncached;
        let asset = GeometryLoader::load(&ctx.device, &self, ctx.max_upload_size)?;
        let handle = ctx.geometries.add(asset);
        ctx.register(
            handle,
            Box::new(move |ctx: &LoaderContext| {
                if let Some(asset) = ctx.geometries.remove(handle) {
                    GeometryLoader::destroy(&asset);
                }
            }),
        );
        Ok(handle)
    }
}

impl LoadInfo for ShaderLoadInfo {
    type Handle = ShaderAssetHandle;

    fn load_with(self, loader: &ResourceLoader) -> Result<Self::Handle> {
        let ctx = &loader.inner;
        let asset = ctx.shader_loader.load(&self, ctx.force_uncached)?;
        let handle = ctx.shaders.add(asset);
        ctx.register(
            handle,
            Box::new(move |ctx: &LoaderContext| {
                if let Some(asset) = ctx.shaders.remove(handle) {
                    ShaderLoader::destroy(&asset);
                }
            }),
        );
        Ok(handle)
    }
}

// ============================================================================
// Loader
// ============================================================================

#[derive(Clone)]
pub struct ResourceLoader {
    inner: Arc<LoaderContext>,
}

impl fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("tracked", &self.tracked_count())
            .field("async_loading", &self.inner.async_loading)
            .finish_non_exhaustive()
    }
}

impl ResourceLoader {
    pub fn new(device: Arc<dyn GpuDevice>, info: ResourceLoaderCreateInfo) -> Result<Self> {
        let tasks = TaskManager::new(info.worker_threads)?;

        let compiler = info.shader_compiler.or_else(default_compiler);
        let shader_loader = ShaderLoader::new(Arc::clone(&device), compiler, &tasks, info.shader_cache_dir);

        log::info!(
            "ResourceLoader ready ({} workers, async: {})",
            tasks.worker_count(),
            info.async_loading
        );

        Ok(Self {
            inner: Arc::new(LoaderContext {
                device,
                async_loading: info.async_loading,
                force_uncached: info.force_uncached,
                max_upload_size: info.max_upload_size.max(1),
                tasks,
                image_cache: info.image_cache.unwrap_or_default(),
                shader_loader,
                buffers: AssetStorage::new(),
                images: AssetStorage::new(),
                geometries: AssetStorage::new(),
                shaders: AssetStorage::new(),
                unload_table: Mutex::new(FxHashMap::default()),
                update_lock: Mutex::new(()),
            }),
        })
    }

    /// Loads one asset. On error nothing is registered.
    pub fn load<I: LoadInfo>(&self, info: I) -> Result<I::Handle> {
        info.load_with(self)
    }

    /// Destroys the asset behind `handle`.
    ///
    /// # Panics
    ///
    /// If the handle is not tracked: never loaded here, or already unloaded.
    pub fn unload<H: Into<AssetHandle>>(&self, handle: H) {
        let handle = handle.into();
        let unload = self.inner.unload_table.lock().remove(&handle);
        match unload {
            Some(unload) => unload(&self.inner),
            None => panic!("unload of untracked asset handle {handle:?}"),
        }
    }

    /// Writes `info.data` into a loaded buffer.
    pub fn update(&self, info: &BufferUpdateInfo<'_>, handle: BufferAssetHandle) -> Result<()> {
        let _guard = self.inner.update_lock.lock();
        let asset = self
            .inner
            .buffers
            .get(handle)
            .ok_or_else(|| LoaderError::AssetNotFound(format!("buffer {handle:?}")))?;
        BufferLoader::update(&asset, info, self.inner.max_upload_size)
    }

    #[must_use]
    pub fn create_request(&self) -> LoadRequest {
        LoadRequest {
            loader: self.clone(),
            group: TaskGroup::new(),
        }
    }

    /// Waits for the device, then unloads everything still tracked.
    pub fn cleanup(&self) {
        self.inner.device.wait_idle();
        let pending: Vec<UnloadFn> = self.inner.unload_table.lock().drain().map(|(_, f)| f).collect();
        let count = pending.len();
        for unload in pending {
            unload(&self.inner);
        }
        self.inner.shader_loader.release_modules();
        log::debug!("ResourceLoader cleanup released {count} assets");
    }

    // --- Accessors ---

    #[must_use]
    pub fn buffer(&self, handle: BufferAssetHandle) -> Option<Arc<BufferAsset>> {
        self.inner.buffers.get(handle)
    }

    #[must_use]
    pub fn image(&self, handle: ImageAssetHandle) -> Option<Arc<ImageAsset>> {
        self.inner.images.get(handle)
    }

    #[must_use]
    pub fn geometry(&self, handle: GeometryAssetHandle) -> Option<Arc<GeometryAsset>> {
        self.inner.geometries.get(handle)
    }

    #[must_use]
    pub fn shader(&self, handle: ShaderAssetHandle) -> Option<Arc<ShaderAsset>> {
        self.inner.shaders.get(handle)
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.inner.device
    }

    #[must_use]
    pub fn features(&self) -> DeviceFeatures {
        self.inner.device.features()
    }

    #[must_use]
    pub fn image_cache(&self) -> &Arc<ImageCache> {
        &self.inner.image_cache
    }

    #[must_use]
    pub fn shader_cache(&self) -> &ShaderCache {
        self.inner.shader_loader.cache()
    }

    #[must_use]
    pub fn task_manager(&self) -> &TaskManager {
        &self.inner.tasks
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.inner.async_loading
    }

    /// Number of assets awaiting unload.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.inner.unload_table.lock().len()
    }
}

fn default_compiler() -> Option<Arc<dyn ShaderCompiler>> {
    #[cfg(feature = "wgsl")]
    {
        Some(Arc::new(super::shader::WgslCompiler::new()))
    }
    #[cfg(not(feature = "wgsl"))]
    {
        None
    }
}

// ============================================================================
// Batched loads
// ============================================================================

/// Receives the handle of one load in a [`LoadRequest`].
#[derive(Debug)]
pub struct AssetSlot<H> {
    cell: Arc<OnceLock<H>>,
}

impl<H> Clone for AssetSlot<H> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<H: Copy> AssetSlot<H> {
    /// The handle, once its load has succeeded.
    #[must_use]
    pub fn get(&self) -> Option<H> {
        self.cell.get().copied()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[must_use = "a load request does nothing until `load` or `load_async` is called"]
pub struct LoadRequest {
    loader: ResourceLoader,
    group: TaskGroup,
}

impl LoadRequest {
    pub fn add<I: LoadInfo>(&mut self, info: I) -> AssetSlot<I::Handle> {
        let slot = AssetSlot {
            cell: Arc::new(OnceLock::new()),
        };
        let cell = Arc::clone(&slot.cell);
        let loader = self.loader.clone();
        self.group.add_task(move || {
            let handle = loader.load(info)?;
            // Each task owns its slot; it is filled at most once.
            let _ = cell.set(handle);
            Ok(())
        });
        slot
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.group.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.group.is_empty()
    }

    /// Runs every load in order on the calling thread.
    pub fn load(self) -> Result<()> {
        self.group.run_inline()
    }

    /// Submits the batch to the worker pool. With async loading disabled the
    /// batch runs now and the returned future is already complete.
    pub fn load_async(self) -> TaskFuture {
        let Self { loader, group } = self;
        if !loader.inner.async_loading {
            return TaskFuture::ready(group.run_inline());
        }
        group.submit(&loader.inner.tasks)
    }
}
