//! Shader compile cache.
//!
//! Two layers:
//! - an in-memory map of shared futures keyed by request hash, which gives
//!   single-flight semantics to concurrent loads
//! - one binary file per request under the cache directory
//!
//! # File format
//!
//! Little-endian, stages in ascending id order:
//!
//! ```text
//! u32 stage_count
//! repeat stage_count {
//!     u32 stage_id
//!     u32 entry_point_len
//!     u8  entry_point[entry_point_len]
//!     u32 code_size_bytes
//!     u8  code[code_size_bytes]        // packed u32 words
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::Shared;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use xxhash_rust::xxh3::Xxh3;

use crate::errors::Result;
use crate::gpu::{ShaderModuleHandle, ShaderStage};

/// Default location of the disk cache, relative to the working directory.
pub const DEFAULT_SHADER_CACHE_DIR: &str = "cache/shaders";

/// Input to a shader compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileRequest {
    pub filename: String,
    /// Extra modules made visible to the main file, by name.
    pub modules: BTreeMap<String, String>,
    pub force_uncached: bool,
    /// Directory that receives the compiled SPIR-V of every stage.
    pub spv_dump_path: Option<PathBuf>,
    /// Directory that receives the final source handed to the front-end.
    pub source_dump_path: Option<PathBuf>,
}

impl CompileRequest {
    #[must_use]
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    pub fn add_module(&mut self, name: impl Into<String>, source: impl Into<String>) -> &mut Self {
        self.modules.insert(name.into(), source.into());
        self
    }
}

/// Bytecode of one stage as produced by a compiler or read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBytecode {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub code: Vec<u32>,
}

/// A stage whose shader module has been created on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStage {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub code: Vec<u32>,
    pub module: ShaderModuleHandle,
}

pub type ShaderCacheData = BTreeMap<ShaderStage, Arc<CompiledStage>>;

/// Resolves once the owning load finishes. A dropped sender (failed
/// compile) resolves every waiter with `Canceled`.
pub type SharedShaderFuture = Shared<oneshot::Receiver<ShaderCacheData>>;

pub struct ShaderCache {
    memory: Mutex<FxHashMap<String, SharedShaderFuture>>,
    directory: Mutex<PathBuf>,
}

impl Default for ShaderCache {
    fn default() -> Self {
        Self::new(DEFAULT_SHADER_CACHE_DIR)
    }
}

impl ShaderCache {
    /// Creates the cache and its directory. A directory that cannot be
    /// created only disables disk caching.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        ensure_directory(&directory);
        Self {
            memory: Mutex::new(FxHashMap::default()),
            directory: Mutex::new(directory),
        }
    }

    // ========================================================================
    // Keys & paths
    // ========================================================================

    /// Deterministic 16-hex-digit key over the filename and every module
    /// (sorted by name).
    #[must_use]
    pub fn generate_cache_key(request: &CompileRequest) -> String {
        let mut hasher = Xxh3::new();
        hasher.update(request.filename.as_bytes());
        for (name, source) in &request.modules {
            hasher.update(name.as_bytes());
            hasher.update(source.as_bytes());
        }
        format!("{:016x}", hasher.digest())
    }

    #[must_use]
    pub fn cache_file_path(&self, key: &str) -> PathBuf {
        self.directory.lock().join(format!("{key}.cache"))
    }

    /// Path of the cache file for `request`, if the file exists.
    #[must_use]
    pub fn check_shader_cache(&self, request: &CompileRequest) -> Option<PathBuf> {
        if !self.cache_directory().is_dir() {
            return None;
        }
        let path = self.cache_file_path(&Self::generate_cache_key(request));
        path.is_file().then_some(path)
    }

    // ========================================================================
    // Disk layer
    // ========================================================================

    /// Reads a cache file. Any truncation is a miss: partial data is
    /// discarded and `None` is returned.
    #[must_use]
    pub fn read_shader_cache(path: &Path) -> Option<BTreeMap<ShaderStage, StageBytecode>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to read shader cache {}: {e}", path.display());
                return None;
            }
        };
        if bytes.is_empty() {
            log::warn!("Empty shader cache file: {}", path.display());
            return None;
        }

        let parsed = decode_cache(&bytes);
        if let Err(what) = &parsed {
            log::warn!("Shader cache corrupted ({what}): {}", path.display());
        }
        parsed.ok()
    }

    /// Writes every stage of `stages` to `path`.
    pub fn write_shader_cache(path: &Path, stages: &BTreeMap<ShaderStage, StageBytecode>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, encode_cache(stages))?;
        Ok(())
    }

    // ========================================================================
    // Memory layer
    // ========================================================================

    #[must_use]
    pub fn find(&self, key: &str) -> Option<SharedShaderFuture> {
        self.memory.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, future: SharedShaderFuture) {
        self.memory.lock().insert(key.into(), future);
    }

    pub fn remove(&self, key: &str) {
        self.memory.lock().remove(key);
    }

    pub fn clear(&self) {
        self.memory.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.lock().is_empty()
    }

    pub fn set_cache_directory(&self, directory: impl Into<PathBuf>) {
        let directory = directory.into();
        ensure_directory(&directory);
        *self.directory.lock() = directory;
    }

    #[must_use]
    pub fn cache_directory(&self) -> PathBuf {
        self.directory.lock().clone()
    }
}

/// An already-resolved shared future, for disk hits.
#[must_use]
pub fn resolved_future(data: ShaderCacheData) -> SharedShaderFuture {
    let (tx, rx) = oneshot::channel();
    // The receiver is alive on the line below.
    let _ = tx.send(data);
    futures::FutureExt::shared(rx)
}

/// Creates `dir` if missing. Returns whether it exists afterwards.
pub(crate) fn ensure_directory(dir: &Path) -> bool {
    if dir.is_dir() {
        return true;
    }
    match fs::create_dir_all(dir) {
        Ok(()) => {
            log::info!("Created directory: {}", dir.display());
            true
        }
        Err(e) => {
            log::warn!("Failed to create directory {}: {e}", dir.display());
            false
        }
    }
}

fn encode_cache(stages: &BTreeMap<ShaderStage, StageBytecode>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(stages.len() as u32).to_le_bytes());
    for (stage, bytecode) in stages {
        out.extend_from_slice(&stage.id().to_le_bytes());
        out.extend_from_slice(&(bytecode.entry_point.len() as u32).to_le_bytes());
        out.extend_from_slice(bytecode.entry_point.as_bytes());
        out.extend_from_slice(&((bytecode.code.len() * 4) as u32).to_le_bytes());
        for word in &bytecode.code {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &'static str) -> std::result::Result<&'a [u8], &'static str> {
        let end = self.offset.checked_add(len).ok_or(what)?;
        let slice = self.bytes.get(self.offset..end).ok_or(what)?;
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self, what: &'static str) -> std::result::Result<u32, &'static str> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn decode_cache(bytes: &[u8]) -> std::result::Result<BTreeMap<ShaderStage, StageBytecode>, &'static str> {
    let mut reader = Reader { bytes, offset: 0 };
    let count = reader.u32("header")?;

    let mut stages = BTreeMap::new();
    for _ in 0..count {
        let stage_id = reader.u32("stage header")?;
        let entry_len = reader.u32("stage header")? as usize;
        let stage = ShaderStage::from_id(stage_id).ok_or("unknown stage id")?;

        let entry_point = String::from_utf8_lossy(reader.take(entry_len, "entry point")?).into_owned();

        let code_size = reader.u32("code size")? as usize;
        if code_size == 0 || code_size % 4 != 0 {
            return Err("SPIR-V code size is not a whole number of words");
        }
        let code = reader
            .take(code_size, "SPIR-V code")?
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();

        stages.insert(
            stage,
            StageBytecode {
                stage,
                entry_point,
                code,
            },
        );
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BTreeMap<ShaderStage, StageBytecode> {
        let mut stages = BTreeMap::new();
        stages.insert(
            ShaderStage::Fragment,
            StageBytecode {
                stage: ShaderStage::Fragment,
                entry_point: "fs_main".into(),
                code: vec![0x0723_0203, 7, 8],
            },
        );
        stages.insert(
            ShaderStage::Vertex,
            StageBytecode {
                stage: ShaderStage::Vertex,
                entry_point: "vs".into(),
                code: vec![0x0723_0203, 1],
            },
        );
        stages
    }

    #[test]
    fn encoding_is_little_endian_in_stage_order() {
        let bytes = encode_cache(&sample());
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        // Vertex (id 0) precedes Fragment (id 3).
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &2u32.to_le_bytes());
        assert_eq!(&bytes[12..14], b"vs");
        assert_eq!(&bytes[14..18], &8u32.to_le_bytes());
        assert_eq!(&bytes[18..22], &0x0723_0203u32.to_le_bytes());
        assert_eq!(bytes.len(), 4 + (8 + 2 + 4 + 8) + (8 + 7 + 4 + 12));
    }

    #[test]
    fn decode_roundtrip() {
        let stages = sample();
        assert_eq!(decode_cache(&encode_cache(&stages)).unwrap(), stages);
    }

    #[test]
    fn partial_word_code_is_rejected() {
        let mut stages = sample();
        for stage in stages.values_mut() {
            stage.code.clear();
        }
        assert!(decode_cache(&encode_cache(&stages)).is_err());

        let mut bytes = encode_cache(&sample());
        // Vertex code size 8 -> 7, with the trailing byte dropped to keep the
        // rest of the stream aligned.
        bytes[14..18].copy_from_slice(&7u32.to_le_bytes());
        bytes.remove(18);
        assert!(decode_cache(&bytes).is_err());
    }

    #[test]
    fn every_truncation_is_rejected() {
        let bytes = encode_cache(&sample());
        for len in 0..bytes.len() {
            assert!(decode_cache(&bytes[..len]).is_err(), "prefix of {len} bytes accepted");
        }
    }

    #[test]
    fn key_ignores_module_insertion_order() {
        let mut a = CompileRequest::new("main.wgsl");
        a.add_module("b", "B").add_module("a", "A");
        let mut b = CompileRequest::new("main.wgsl");
        b.add_module("a", "A").add_module("b", "B");

        let key = ShaderCache::generate_cache_key(&a);
        assert_eq!(key, ShaderCache::generate_cache_key(&b));
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        b.add_module("c", "C");
        assert_ne!(key, ShaderCache::generate_cache_key(&b));
    }

    #[test]
    fn resolved_future_is_ready() {
        let future = resolved_future(ShaderCacheData::new());
        assert!(pollster::block_on(future).unwrap().is_empty());
    }
}
