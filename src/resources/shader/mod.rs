//! Shader programs: compile cache, front-ends, reflection and loading.

pub mod cache;
pub mod compiler;
pub mod loader;
pub mod reflection;

pub use cache::{
    CompileRequest, CompiledStage, DEFAULT_SHADER_CACHE_DIR, ShaderCache, ShaderCacheData, SharedShaderFuture,
    StageBytecode,
};
#[cfg(feature = "wgsl")]
pub use compiler::WgslCompiler;
pub use compiler::ShaderCompiler;
pub use loader::{ShaderAsset, ShaderContainerType, ShaderLoadInfo, ShaderLoader, determine_pipeline_type};
pub use reflection::{ReflectionResult, reflect_program, spirv_entry_points};
