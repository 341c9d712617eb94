//! Shader program loading.
//!
//! Each source file is resolved through three layers, cheapest first:
//!
//! 1. the in-memory single-flight map (a shared future per request)
//! 2. the binary disk cache
//! 3. the compiler, run outside every lock
//!
//! Concurrent loads of the same request therefore compile once; unrelated
//! requests compile in parallel on whatever threads issued them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::channel::oneshot;
use parking_lot::Mutex;
use xxhash_rust::xxh3::Xxh3;

use crate::errors::{LoaderError, Result};
use crate::gpu::{
    DescriptorSetLayoutHandle, GpuDevice, PipelineLayoutHandle, PipelineType, ProgramHandle, PushConstantRange,
    ShaderModuleHandle, ShaderStage, VertexInput,
};
use crate::resources::timestamp_now;
use crate::tasks::{Task, TaskManager};

use super::cache::{
    CompileRequest, CompiledStage, ShaderCache, ShaderCacheData, SharedShaderFuture, StageBytecode, ensure_directory,
    resolved_future,
};
use super::compiler::ShaderCompiler;
use super::reflection::{ReflectionResult, reflect_cached, spirv_entry_points};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShaderContainerType {
    /// Detect from the file extension.
    #[default]
    Default,
    /// Precompiled SPIR-V; bypasses the compiler and its cache.
    Spirv,
    Wgsl,
}

impl ShaderContainerType {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("spv") => ShaderContainerType::Spirv,
            _ => ShaderContainerType::Wgsl,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShaderLoadInfo {
    pub debug_name: String,
    pub data: Vec<PathBuf>,
    /// Entry point per requested stage.
    pub stage_info: BTreeMap<ShaderStage, String>,
    pub container_type: ShaderContainerType,
    /// Template for every source file's request; `filename` is overwritten.
    pub compile_request: CompileRequest,
    pub force_uncached: bool,
}

impl ShaderLoadInfo {
    #[must_use]
    pub fn new(debug_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            debug_name: debug_name.into(),
            data: vec![path.into()],
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_stage(mut self, stage: ShaderStage, entry_point: impl Into<String>) -> Self {
        self.stage_info.insert(stage, entry_point.into());
        self
    }
}

// ============================================================================
// Asset
// ============================================================================

pub struct ShaderAsset {
    device: Arc<dyn GpuDevice>,
    program: ProgramHandle,
    pipeline_layout: PipelineLayoutHandle,
    set_layouts: Vec<DescriptorSetLayoutHandle>,
    pipeline_type: PipelineType,
    stages: Vec<Arc<CompiledStage>>,
    reflection: ReflectionResult,

    source_desc: String,
    debug_name: String,
    load_timestamp: u64,
}

impl fmt::Debug for ShaderAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderAsset")
            .field("debug_name", &self.debug_name)
            .field("pipeline_type", &self.pipeline_type)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl ShaderAsset {
    #[must_use]
    pub fn program(&self) -> ProgramHandle {
        self.program
    }

    #[must_use]
    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    #[must_use]
    pub fn pipeline_layout(&self) -> PipelineLayoutHandle {
        self.pipeline_layout
    }

    #[must_use]
    pub fn set_layouts(&self) -> &[DescriptorSetLayoutHandle] {
        &self.set_layouts
    }

    /// Stages in pipeline order.
    #[must_use]
    pub fn stages(&self) -> &[Arc<CompiledStage>] {
        &self.stages
    }

    #[must_use]
    pub fn shader(&self, stage: ShaderStage) -> Option<&Arc<CompiledStage>> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    #[must_use]
    pub fn reflection(&self) -> &ReflectionResult {
        &self.reflection
    }

    #[must_use]
    pub fn vertex_input(&self) -> &VertexInput {
        &self.reflection.vertex_input
    }

    #[must_use]
    pub fn push_constant_range(&self) -> Option<PushConstantRange> {
        self.reflection.push_constant_range
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
    pub fn load_timestamp(&self) -> u64 {
        self.load_timestamp
    }

    #[must_use]
    pub fn info_string(&self) -> String {
        let stages: Vec<String> = self
            .stages
            .iter()
            .map(|s| format!("{} ({})", s.stage.name(), s.entry_point))
            .collect();
        format!(
            "Shader: {}\nPipeline: {:?}\nStages: {}\nDescriptor Sets: {}\nPush Constants: {} bytes\nSource: {}",
            if self.debug_name.is_empty() { "Unnamed" } else { &self.debug_name },
            self.pipeline_type,
            stages.join(", "),
            self.set_layouts.len(),
            self.reflection.push_constant_range.map_or(0, |r| r.size),
            self.source_desc,
        )
    }
}

// ============================================================================
// Loader
// ============================================================================

pub struct ShaderLoader {
    device: Arc<dyn GpuDevice>,
    compiler: Option<Arc<dyn ShaderCompiler>>,
    cache: ShaderCache,
    load_lock: Mutex<()>,

    init_task: Mutex<Option<Task<()>>>,
    init_result: OnceLock<std::result::Result<(), String>>,

    /// Every module created through the cache; they outlive the programs
    /// that reference them.
    modules: Mutex<Vec<ShaderModuleHandle>>,
}

impl ShaderLoader {
    /// Kicks off compiler initialization on the worker pool.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        compiler: Option<Arc<dyn ShaderCompiler>>,
        tasks: &TaskManager,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        let init_task = compiler.clone().map(|compiler| tasks.submit(move || compiler.initialize()));
        Self {
            device,
            compiler,
            cache: ShaderCache::new(cache_dir),
            load_lock: Mutex::new(()),
            init_task: Mutex::new(init_task),
            init_result: OnceLock::new(),
            modules: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &ShaderCache {
        &self.cache
    }

    /// Blocks until the compiler finished initializing. Every caller sees
    /// the same outcome.
    pub fn wait_for_initialization(&self) -> Result<()> {
        let outcome = self.init_result.get_or_init(|| match self.init_task.lock().take() {
            Some(task) => task.wait().map_err(|e| e.to_string()),
            None => Ok(()),
        });
        outcome
            .clone()
            .map_err(|e| LoaderError::ShaderCompile(format!("compiler initialization failed: {e}")))
    }

    pub fn load(&self, info: &ShaderLoadInfo, force_uncached: bool) -> Result<ShaderAsset> {
        let force_uncached = force_uncached || info.force_uncached || info.compile_request.force_uncached;
        if info.stage_info.is_empty() {
            return Err(LoaderError::runtime(format!("Shader '{}' requests no stages", info.debug_name)));
        }

        let mut required: BTreeMap<ShaderStage, Arc<CompiledStage>> = BTreeMap::new();
        for path in &info.data {
            let container = match info.container_type {
                ShaderContainerType::Default => ShaderContainerType::from_path(path),
                other => other,
            };
            let stages = match container {
                ShaderContainerType::Spirv => self.load_spirv(path, &info.stage_info)?,
                _ => self.load_source(path, info, force_uncached)?,
            };
            required.extend(stages);
        }

        let pipeline_type = determine_pipeline_type(&required)
            .ok_or_else(|| LoaderError::runtime("unsupported shader stage combination"))?;
        let ordered = order_stages(&required, pipeline_type);

        let cache_dir = (!force_uncached).then(|| self.cache.cache_directory());
        let refs: Vec<&CompiledStage> = ordered.iter().map(Arc::as_ref).collect();
        let reflection = reflect_cached(&refs, cache_dir.as_deref())?;

        let active_sets = reflection.active_sets();
        let max_sets = self.device.features().max_bound_descriptor_sets;
        if active_sets.len() as u32 > max_sets {
            log::error!(
                "Shader '{}': number of sets {} exceeds device limit of {max_sets}",
                info.debug_name,
                active_sets.len()
            );
        }

        let (set_layouts, pipeline_layout, program) = self.create_program(pipeline_type, &ordered, &reflection)?;

        let source_desc = info
            .data
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        log::debug!("Loaded shader '{}' ({pipeline_type:?})", info.debug_name);
        Ok(ShaderAsset {
            device: Arc::clone(&self.device),
            program,
            pipeline_layout,
            set_layouts,
            pipeline_type,
            stages: ordered,
            reflection,
            source_desc,
            debug_name: info.debug_name.clone(),
            load_timestamp: timestamp_now(),
        })
    }

    /// Destroys the program, its pipeline layout and set layouts. Shader
    /// modules stay with the cache.
    pub fn destroy(asset: &ShaderAsset) {
        asset.device.destroy_program(asset.program);
        asset.device.destroy_pipeline_layout(asset.pipeline_layout);
        for &layout in &asset.set_layouts {
            asset.device.destroy_descriptor_set_layout(layout);
        }
    }

    /// Drops the in-memory cache and destroys every cached shader module.
    pub fn release_modules(&self) {
        self.cache.clear();
        for module in self.modules.lock().drain(..) {
            self.device.destroy_shader_module(module);
        }
    }

    // ------------------------------------------------------------------------

    fn load_spirv(
        &self,
        path: &Path,
        stage_info: &BTreeMap<ShaderStage, String>,
    ) -> Result<Vec<(ShaderStage, Arc<CompiledStage>)>> {
        let bytes = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LoaderError::AssetNotFound(path.display().to_string())
            } else {
                LoaderError::Io(e)
            }
        })?;
        if bytes.len() % 4 != 0 {
            return Err(LoaderError::Reflection(format!(
                "{}: size is not a multiple of 4",
                path.display()
            )));
        }
        let code: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();

        let entries = spirv_entry_points(&code)?;
        let bytecode = stage_info
            .iter()
            .filter(|&(stage, entry)| entries.iter().any(|(s, e)| s == stage && e == entry))
            .map(|(&stage, entry)| StageBytecode {
                stage,
                entry_point: entry.clone(),
                code: code.clone(),
            });

        let data = self.create_modules(bytecode)?;
        Ok(data.into_iter().collect())
    }

    fn load_source(
        &self,
        path: &Path,
        info: &ShaderLoadInfo,
        force_uncached: bool,
    ) -> Result<Vec<(ShaderStage, Arc<CompiledStage>)>> {
        let mut request = info.compile_request.clone();
        request.filename = path.to_string_lossy().into_owned();
        request.force_uncached = force_uncached;
        let key = memory_key(&request, &info.stage_info);

        // --- 1. memory ---
        if !force_uncached {
            if let Some(future) = self.cache.find(&key) {
                log::info!("Using cached shader from memory: {}", path.display());
                return pick_stages(wait_shared(future)?, &info.stage_info);
            }
        } else {
            log::info!("Skipping shader caches (force uncached): {}", path.display());
        }

        // --- 2. disk, then claim the key ---
        let sender = {
            let guard = self.load_lock.lock();

            if !force_uncached {
                if let Some(future) = self.cache.find(&key) {
                    drop(guard);
                    return pick_stages(wait_shared(future)?, &info.stage_info);
                }
                if let Some(data) = self.read_disk_cache(&request, &info.stage_info)? {
                    log::info!("Loaded shader from disk cache: {}", path.display());
                    self.cache.insert(key.clone(), resolved_future(data.clone()));
                    return pick_stages(data, &info.stage_info);
                }
            }

            let (tx, rx) = oneshot::channel::<ShaderCacheData>();
            if !force_uncached {
                self.cache.insert(key.clone(), rx.shared());
            }
            tx
        };

        // --- 3. compile outside the lock ---
        match self.compile(&request, &info.stage_info, force_uncached) {
            Ok(data) => {
                // Waiters may all have given up already.
                let _ = sender.send(data.clone());
                pick_stages(data, &info.stage_info)
            }
            Err(e) => {
                if !force_uncached {
                    self.cache.remove(&key);
                }
                drop(sender);
                log::error!("Failed to compile {}: {e}", path.display());
                Err(e)
            }
        }
    }

    fn read_disk_cache(
        &self,
        request: &CompileRequest,
        stage_info: &BTreeMap<ShaderStage, String>,
    ) -> Result<Option<ShaderCacheData>> {
        let Some(cache_path) = self.cache.check_shader_cache(request) else {
            return Ok(None);
        };
        let Some(mut stages) = ShaderCache::read_shader_cache(&cache_path) else {
            return Ok(None);
        };

        let covered = stage_info
            .iter()
            .all(|(stage, entry)| stages.get(stage).is_some_and(|s| s.entry_point == *entry));
        if !covered {
            log::debug!("Disk cache {} lacks requested stages", cache_path.display());
            return Ok(None);
        }

        stages.retain(|stage, _| stage_info.contains_key(stage));
        match self.create_modules(stages.into_values()) {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                log::warn!("Discarding disk cache {}: {e}", cache_path.display());
                Ok(None)
            }
        }
    }

    fn compile(
        &self,
        request: &CompileRequest,
        stage_info: &BTreeMap<ShaderStage, String>,
        force_uncached: bool,
    ) -> Result<ShaderCacheData> {
        self.wait_for_initialization()?;
        let compiler = self
            .compiler
            .as_ref()
            .ok_or_else(|| LoaderError::FeatureNotEnabled("shader compiler".into()))?;

        let compiled: BTreeMap<ShaderStage, StageBytecode> = compiler
            .compile(request, stage_info)?
            .into_iter()
            .map(|b| (b.stage, b))
            .collect();

        for (stage, entry) in stage_info {
            if !compiled.get(stage).is_some_and(|b| b.entry_point == *entry) {
                return Err(LoaderError::ShaderCompile(format!(
                    "{}: compiler produced no {} stage for '{entry}'",
                    request.filename,
                    stage.name()
                )));
            }
        }

        if let Some(dir) = &request.spv_dump_path {
            dump_spirv(dir, &request.filename, &compiled);
        }

        if force_uncached {
            log::info!("Skipping shader disk cache write (force uncached): {}", request.filename);
        } else {
            let path = self.cache.cache_file_path(&ShaderCache::generate_cache_key(request));
            match ShaderCache::write_shader_cache(&path, &compiled) {
                Ok(()) => log::info!("Compiled and cached shader: {} -> {}", request.filename, path.display()),
                Err(e) => log::warn!("Failed to cache shader {}: {e}", request.filename),
            }
        }

        self.create_modules(compiled.into_values().filter(|b| stage_info.contains_key(&b.stage)))
    }

    fn create_modules(&self, stages: impl IntoIterator<Item = StageBytecode>) -> Result<ShaderCacheData> {
        let mut data = ShaderCacheData::new();
        for bytecode in stages {
            match self.device.create_shader_module(bytecode.stage, &bytecode.code) {
                Ok(module) => {
                    data.insert(
                        bytecode.stage,
                        Arc::new(CompiledStage {
                            stage: bytecode.stage,
                            entry_point: bytecode.entry_point,
                            code: bytecode.code,
                            module,
                        }),
                    );
                }
                Err(e) => {
                    for stage in data.values() {
                        self.device.destroy_shader_module(stage.module);
                    }
                    return Err(e);
                }
            }
        }
        self.modules.lock().extend(data.values().map(|s| s.module));
        Ok(data)
    }

    fn create_program(
        &self,
        pipeline_type: PipelineType,
        ordered: &[Arc<CompiledStage>],
        reflection: &ReflectionResult,
    ) -> Result<(Vec<DescriptorSetLayoutHandle>, PipelineLayoutHandle, ProgramHandle)> {
        let device = &self.device;
        let mut set_layouts = Vec::new();
        let release = |set_layouts: &[DescriptorSetLayoutHandle]| {
            for &layout in set_layouts {
                device.destroy_descriptor_set_layout(layout);
            }
        };

        for set in reflection.active_sets() {
            match device.create_descriptor_set_layout(reflection.set_bindings(set)) {
                Ok(layout) => set_layouts.push(layout),
                Err(e) => {
                    release(&set_layouts);
                    return Err(e);
                }
            }
        }

        let pipeline_layout = match device.create_pipeline_layout(&set_layouts, reflection.push_constant_range) {
            Ok(layout) => layout,
            Err(e) => {
                release(&set_layouts);
                return Err(e);
            }
        };

        let stages: Vec<(ShaderStage, ShaderModuleHandle, String)> = ordered
            .iter()
            .map(|s| (s.stage, s.module, s.entry_point.clone()))
            .collect();
        match device.create_program(pipeline_type, &stages, pipeline_layout, &reflection.vertex_input) {
            Ok(program) => Ok((set_layouts, pipeline_layout, program)),
            Err(e) => {
                device.destroy_pipeline_layout(pipeline_layout);
                release(&set_layouts);
                Err(e)
            }
        }
    }
}

impl Drop for ShaderLoader {
    fn drop(&mut self) {
        self.release_modules();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Single-flight key: the compile request plus the requested entry points.
fn memory_key(request: &CompileRequest, stage_info: &BTreeMap<ShaderStage, String>) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(ShaderCache::generate_cache_key(request).as_bytes());
    for (stage, entry) in stage_info {
        hasher.update(&stage.id().to_le_bytes());
        hasher.update(entry.as_bytes());
    }
    format!("{:016x}", hasher.digest())
}

fn wait_shared(future: SharedShaderFuture) -> Result<ShaderCacheData> {
    pollster::block_on(future)
        .map_err(|_| LoaderError::ShaderCompile("concurrent compilation of this shader failed".into()))
}

fn pick_stages(
    data: ShaderCacheData,
    stage_info: &BTreeMap<ShaderStage, String>,
) -> Result<Vec<(ShaderStage, Arc<CompiledStage>)>> {
    stage_info
        .iter()
        .map(|(&stage, entry)| match data.get(&stage) {
            Some(compiled) if compiled.entry_point == *entry => Ok((stage, Arc::clone(compiled))),
            _ => Err(LoaderError::runtime(format!(
                "cached shader lacks {} stage '{entry}'",
                stage.name()
            ))),
        })
        .collect()
}

fn dump_spirv(dir: &Path, filename: &str, stages: &BTreeMap<ShaderStage, StageBytecode>) {
    if !ensure_directory(dir) {
        log::warn!("SPIR-V dump disabled for {filename}");
        return;
    }
    let stem = Path::new(filename)
        .file_stem()
        .map_or_else(|| "shader".into(), |s| s.to_string_lossy().into_owned());
    for bytecode in stages.values() {
        let path = dir.join(format!("{stem}.{}.{}.spv", bytecode.stage.name(), bytecode.entry_point));
        if let Err(e) = std::fs::write(&path, bytemuck::cast_slice::<u32, u8>(&bytecode.code)) {
            log::warn!("Failed to dump SPIR-V to {}: {e}", path.display());
        }
    }
}

/// CS wins outright; otherwise MS+FS is a mesh pipeline and VS+FS a
/// classic one.
#[must_use]
pub fn determine_pipeline_type<V>(stages: &BTreeMap<ShaderStage, V>) -> Option<PipelineType> {
    let has = |s| stages.contains_key(&s);
    if has(ShaderStage::Compute) {
        Some(PipelineType::Compute)
    } else if has(ShaderStage::Mesh) && has(ShaderStage::Fragment) {
        Some(PipelineType::Mesh)
    } else if has(ShaderStage::Vertex) && has(ShaderStage::Fragment) {
        Some(PipelineType::Geometry)
    } else {
        None
    }
}

fn order_stages(
    stages: &BTreeMap<ShaderStage, Arc<CompiledStage>>,
    pipeline_type: PipelineType,
) -> Vec<Arc<CompiledStage>> {
    let order: &[ShaderStage] = match pipeline_type {
        PipelineType::Compute => &[ShaderStage::Compute],
        PipelineType::Mesh => &[ShaderStage::Task, ShaderStage::Mesh, ShaderStage::Fragment],
        PipelineType::Geometry => &[ShaderStage::Vertex, ShaderStage::Fragment],
    };
    order.iter().filter_map(|s| stages.get(s).cloned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_type_rules() {
        let set = |stages: &[ShaderStage]| stages.iter().map(|&s| (s, ())).collect::<BTreeMap<_, _>>();

        assert_eq!(
            determine_pipeline_type(&set(&[ShaderStage::Compute, ShaderStage::Vertex])),
            Some(PipelineType::Compute)
        );
        assert_eq!(
            determine_pipeline_type(&set(&[ShaderStage::Task, ShaderStage::Mesh, ShaderStage::Fragment])),
            Some(PipelineType::Mesh)
        );
        assert_eq!(
            determine_pipeline_type(&set(&[ShaderStage::Vertex, ShaderStage::Fragment])),
            Some(PipelineType::Geometry)
        );
        assert_eq!(determine_pipeline_type(&set(&[ShaderStage::Vertex])), None);
        assert_eq!(determine_pipeline_type(&set(&[ShaderStage::Mesh])), None);
    }

    #[test]
    fn container_detection() {
        assert_eq!(ShaderContainerType::from_path(Path::new("a/b.SPV")), ShaderContainerType::Spirv);
        assert_eq!(ShaderContainerType::from_path(Path::new("a/b.wgsl")), ShaderContainerType::Wgsl);
    }

    #[test]
    fn memory_key_depends_on_entry_points() {
        let request = CompileRequest::new("x.wgsl");
        let mut a = BTreeMap::new();
        a.insert(ShaderStage::Vertex, "vs".to_string());
        let mut b = a.clone();
        b.insert(ShaderStage::Vertex, "vs2".to_string());
        assert_ne!(memory_key(&request, &a), memory_key(&request, &b));
        assert_eq!(memory_key(&request, &a), memory_key(&request, &a.clone()));
    }
}
