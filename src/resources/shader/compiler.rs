//! Shader front-ends.
//!
//! A [`ShaderCompiler`] turns a [`CompileRequest`] into SPIR-V for the
//! requested entry points. Initialization is split out so the loader can run
//! it on the worker pool while the rest of the engine starts up.

use std::collections::BTreeMap;

use crate::errors::Result;
use crate::gpu::ShaderStage;

use super::cache::{CompileRequest, StageBytecode};

pub trait ShaderCompiler: Send + Sync {
    /// One-time setup. Called exactly once, off the caller's thread.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Compiles `request.filename` (plus its modules) for every
    /// `(stage, entry point)` pair in `stages`.
    fn compile(&self, request: &CompileRequest, stages: &BTreeMap<ShaderStage, String>) -> Result<Vec<StageBytecode>>;
}

#[cfg(feature = "wgsl")]
pub use wgsl::WgslCompiler;

#[cfg(feature = "wgsl")]
mod wgsl {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    use crate::errors::{LoaderError, Result};
    use crate::gpu::ShaderStage;
    use crate::resources::shader::cache::{CompileRequest, StageBytecode, ensure_directory};

    use super::ShaderCompiler;

    /// WGSL → SPIR-V through `naga`.
    ///
    /// Module sources are prepended to the main file in name order, so a
    /// module can declare helpers and bindings shared by several programs.
    #[derive(Debug, Default)]
    pub struct WgslCompiler;

    impl WgslCompiler {
        #[must_use]
        pub fn new() -> Self {
            Self
        }

        fn assemble_source(request: &CompileRequest) -> Result<String> {
            let main = fs::read_to_string(&request.filename).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LoaderError::AssetNotFound(request.filename.clone())
                } else {
                    LoaderError::Io(e)
                }
            })?;

            let mut source = String::new();
            for (name, module) in &request.modules {
                source.push_str(&format!("// module: {name}\n"));
                source.push_str(module);
                source.push('\n');
            }
            source.push_str(&main);
            Ok(source)
        }

        fn naga_stage(stage: ShaderStage) -> Result<naga::ShaderStage> {
            match stage {
                ShaderStage::Vertex => Ok(naga::ShaderStage::Vertex),
                ShaderStage::Fragment => Ok(naga::ShaderStage::Fragment),
                ShaderStage::Compute => Ok(naga::ShaderStage::Compute),
                ShaderStage::Task | ShaderStage::Mesh => Err(LoaderError::ShaderCompile(format!(
                    "WGSL has no {} stage",
                    stage.name()
                ))),
            }
        }

        fn dump_source(request: &CompileRequest, source: &str) {
            let Some(dir) = &request.source_dump_path else { return };
            if !ensure_directory(dir) {
                log::warn!("Source dump disabled for {}", request.filename);
                return;
            }
            let name = Path::new(&request.filename)
                .file_name()
                .map_or_else(|| "shader.wgsl".into(), |n| n.to_string_lossy().into_owned());
            if let Err(e) = fs::write(dir.join(name), source) {
                log::warn!("Failed to dump shader source: {e}");
            }
        }
    }

    impl ShaderCompiler for WgslCompiler {
        fn compile(
            &self,
            request: &CompileRequest,
            stages: &BTreeMap<ShaderStage, String>,
        ) -> Result<Vec<StageBytecode>> {
            let source = Self::assemble_source(request)?;
            Self::dump_source(request, &source);

            let module = naga::front::wgsl::parse_str(&source).map_err(|e| {
                LoaderError::ShaderCompile(format!(
                    "{}: WGSL parse error: {}",
                    request.filename,
                    e.emit_to_string(&source)
                ))
            })?;

            let mut validator =
                naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::all());
            let info = validator.validate(&module).map_err(|e| {
                LoaderError::ShaderCompile(format!("{}: validation error: {e}", request.filename))
            })?;

            let options = naga::back::spv::Options {
                lang_version: (1, 3),
                ..Default::default()
            };

            let mut out = Vec::with_capacity(stages.len());
            for (&stage, entry_point) in stages {
                let naga_stage = Self::naga_stage(stage)?;
                if !module
                    .entry_points
                    .iter()
                    .any(|ep| ep.name == *entry_point && ep.stage == naga_stage)
                {
                    return Err(LoaderError::ShaderCompile(format!(
                        "{}: entry point '{entry_point}' not found for {} stage",
                        request.filename,
                        stage.name()
                    )));
                }

                let pipeline_options = naga::back::spv::PipelineOptions {
                    shader_stage: naga_stage,
                    entry_point: entry_point.clone(),
                };
                let code = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
                    .map_err(|e| {
                        LoaderError::ShaderCompile(format!("{}: SPIR-V generation error: {e}", request.filename))
                    })?;

                log::trace!("Compiled {}:{entry_point} ({} words)", request.filename, code.len());
                out.push(StageBytecode {
                    stage,
                    entry_point: entry_point.clone(),
                    code,
                });
            }
            Ok(out)
        }
    }
}
