//! SPIR-V reflection.
//!
//! A single pass over the instruction stream collects decorations, types
//! and module-scope variables; from those we derive descriptor bindings,
//! the push-constant block size and the vertex input layout.
//!
//! Results can be cached as JSON next to the compile cache, keyed by a hash
//! of every stage's bytecode and entry point.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::errors::{LoaderError, Result};
use crate::gpu::{
    DescriptorBinding, DescriptorType, Format, PushConstantRange, ShaderStage, ShaderStageFlags, VertexAttribute,
    VertexBindingLayout, VertexInput,
};

use super::cache::{CompiledStage, ensure_directory};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

mod op {
    pub const ENTRY_POINT: u16 = 15;
    pub const TYPE_INT: u16 = 21;
    pub const TYPE_FLOAT: u16 = 22;
    pub const TYPE_VECTOR: u16 = 23;
    pub const TYPE_MATRIX: u16 = 24;
    pub const TYPE_IMAGE: u16 = 25;
    pub const TYPE_SAMPLER: u16 = 26;
    pub const TYPE_SAMPLED_IMAGE: u16 = 27;
    pub const TYPE_ARRAY: u16 = 28;
    pub const TYPE_RUNTIME_ARRAY: u16 = 29;
    pub const TYPE_STRUCT: u16 = 30;
    pub const TYPE_POINTER: u16 = 32;
    pub const CONSTANT: u16 = 43;
    pub const VARIABLE: u16 = 59;
    pub const DECORATE: u16 = 71;
    pub const MEMBER_DECORATE: u16 = 72;
}

mod decoration {
    pub const BLOCK: u32 = 2;
    pub const BUFFER_BLOCK: u32 = 3;
    pub const ARRAY_STRIDE: u32 = 6;
    pub const BUILT_IN: u32 = 11;
    pub const LOCATION: u32 = 30;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const OFFSET: u32 = 35;
}

mod storage {
    pub const UNIFORM_CONSTANT: u32 = 0;
    pub const INPUT: u32 = 1;
    pub const UNIFORM: u32 = 2;
    pub const PUSH_CONSTANT: u32 = 9;
    pub const STORAGE_BUFFER: u32 = 12;
}

/// Merged reflection of every stage of a program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionResult {
    /// Bindings per descriptor set, sorted by binding.
    pub sets: BTreeMap<u32, Vec<DescriptorBinding>>,
    pub push_constant_range: Option<PushConstantRange>,
    pub vertex_input: VertexInput,
}

impl ReflectionResult {
    #[must_use]
    pub fn active_sets(&self) -> Vec<u32> {
        self.sets.keys().copied().collect()
    }

    #[must_use]
    pub fn set_bindings(&self, set: u32) -> &[DescriptorBinding] {
        self.sets.get(&set).map_or(&[], Vec::as_slice)
    }

    fn merge_binding(&mut self, set: u32, binding: DescriptorBinding) {
        let bindings = self.sets.entry(set).or_default();
        match bindings.iter_mut().find(|b| b.binding == binding.binding) {
            Some(existing) => {
                if existing.descriptor_type != binding.descriptor_type {
                    log::error!(
                        "Descriptor set {set} binding {} declared as {:?} and {:?}",
                        binding.binding,
                        existing.descriptor_type,
                        binding.descriptor_type
                    );
                }
                existing.stages |= binding.stages;
                existing.count = existing.count.max(binding.count);
            }
            None => {
                bindings.push(binding);
                bindings.sort_by_key(|b| b.binding);
            }
        }
    }

    fn merge_push_constants(&mut self, size: u32, stages: ShaderStageFlags) {
        let range = self.push_constant_range.get_or_insert(PushConstantRange {
            offset: 0,
            size: 0,
            stages: ShaderStageFlags::empty(),
        });
        range.size = range.size.max(size);
        range.stages |= stages;
    }
}

// ============================================================================
// Module parsing
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum SpvType {
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, count: u32 },
    Image { sampled: u32 },
    Sampler,
    SampledImage,
    Array { element: u32, length_id: u32 },
    RuntimeArray { element: u32 },
    Struct,
    Pointer { pointee: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Variable {
    id: u32,
    type_id: u32,
    storage: u32,
}

#[derive(Default)]
struct Module {
    types: FxHashMap<u32, SpvType>,
    struct_members: FxHashMap<u32, Vec<u32>>,
    constants: FxHashMap<u32, u32>,
    decorations: FxHashMap<u32, Vec<(u32, u32)>>,
    member_offsets: FxHashMap<(u32, u32), u32>,
    variables: Vec<Variable>,
    entry_points: Vec<(u32, String, Vec<u32>)>,
}

impl Module {
    fn parse(words: &[u32]) -> Result<Self> {
        if words.len() < 5 || words[0] != SPIRV_MAGIC {
            return Err(LoaderError::Reflection("missing SPIR-V header".into()));
        }

        let mut module = Module::default();
        let mut cursor = 5;
        while cursor < words.len() {
            let opcode = (words[cursor] & 0xFFFF) as u16;
            let count = (words[cursor] >> 16) as usize;
            if count == 0 || cursor + count > words.len() {
                return Err(LoaderError::Reflection(format!("truncated instruction at word {cursor}")));
            }
            module.record(opcode, &words[cursor + 1..cursor + count])?;
            cursor += count;
        }
        Ok(module)
    }

    fn record(&mut self, opcode: u16, operands: &[u32]) -> Result<()> {
        let need = |n: usize| {
            if operands.len() < n {
                Err(LoaderError::Reflection(format!("opcode {opcode} has too few operands")))
            } else {
                Ok(())
            }
        };

        match opcode {
            op::ENTRY_POINT => {
                need(3)?;
                let (name, rest) = read_string(&operands[2..]);
                self.entry_points.push((operands[0], name, rest.to_vec()));
            }
            op::TYPE_INT => {
                need(3)?;
                self.types.insert(
                    operands[0],
                    SpvType::Int {
                        width: operands[1],
                        signed: operands[2] != 0,
                    },
                );
            }
            op::TYPE_FLOAT => {
                need(2)?;
                self.types.insert(operands[0], SpvType::Float { width: operands[1] });
            }
            op::TYPE_VECTOR => {
                need(3)?;
                self.types.insert(
                    operands[0],
                    SpvType::Vector {
                        component: operands[1],
                        count: operands[2],
                    },
                );
            }
            op::TYPE_MATRIX => {
                need(3)?;
                self.types.insert(
                    operands[0],
                    SpvType::Matrix {
                        column: operands[1],
                        count: operands[2],
                    },
                );
            }
            op::TYPE_IMAGE => {
                need(8)?;
                self.types.insert(operands[0], SpvType::Image { sampled: operands[6] });
            }
            op::TYPE_SAMPLER => {
                need(1)?;
                self.types.insert(operands[0], SpvType::Sampler);
            }
            op::TYPE_SAMPLED_IMAGE => {
                need(2)?;
                self.types.insert(operands[0], SpvType::SampledImage);
            }
            op::TYPE_ARRAY => {
                need(3)?;
                self.types.insert(
                    operands[0],
                    SpvType::Array {
                        element: operands[1],
                        length_id: operands[2],
                    },
                );
            }
            op::TYPE_RUNTIME_ARRAY => {
                need(2)?;
                self.types.insert(operands[0], SpvType::RuntimeArray { element: operands[1] });
            }
            op::TYPE_STRUCT => {
                need(1)?;
                self.types.insert(operands[0], SpvType::Struct);
                self.struct_members.insert(operands[0], operands[1..].to_vec());
            }
            op::TYPE_POINTER => {
                need(3)?;
                // Storage class is taken from OpVariable, not the pointer type.
                self.types.insert(operands[0], SpvType::Pointer { pointee: operands[2] });
            }
            op::CONSTANT => {
                // Only 32-bit integer constants matter here (array lengths).
                if operands.len() == 3 {
                    self.constants.insert(operands[1], operands[2]);
                }
            }
            op::VARIABLE => {
                need(3)?;
                self.variables.push(Variable {
                    type_id: operands[0],
                    id: operands[1],
                    storage: operands[2],
                });
            }
            op::DECORATE => {
                need(2)?;
                let value = operands.get(2).copied().unwrap_or(0);
                self.decorations.entry(operands[0]).or_default().push((operands[1], value));
            }
            op::MEMBER_DECORATE => {
                need(3)?;
                if operands[2] == decoration::OFFSET {
                    if let Some(&offset) = operands.get(3) {
                        self.member_offsets.insert((operands[0], operands[1]), offset);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn decoration(&self, id: u32, kind: u32) -> Option<u32> {
        self.decorations
            .get(&id)?
            .iter()
            .find(|(d, _)| *d == kind)
            .map(|&(_, v)| v)
    }

    fn has_decoration(&self, id: u32, kind: u32) -> bool {
        self.decoration(id, kind).is_some()
    }

    fn pointee(&self, pointer_type: u32) -> Option<u32> {
        match self.types.get(&pointer_type)? {
            SpvType::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    /// Strips arrays, returning the element type and the element count
    /// (0 for runtime arrays).
    fn unwrap_array(&self, mut type_id: u32) -> (u32, u32) {
        let mut count = 1u32;
        loop {
            match self.types.get(&type_id) {
                Some(SpvType::Array { element, length_id }) => {
                    count = count.saturating_mul(self.constants.get(length_id).copied().unwrap_or(1));
                    type_id = *element;
                }
                Some(SpvType::RuntimeArray { element }) => {
                    count = 0;
                    type_id = *element;
                }
                _ => return (type_id, count),
            }
        }
    }

    fn descriptor_type(&self, var: &Variable, type_id: u32) -> Option<DescriptorType> {
        match var.storage {
            storage::UNIFORM => {
                if self.has_decoration(type_id, decoration::BUFFER_BLOCK) {
                    Some(DescriptorType::StorageBuffer)
                } else {
                    Some(DescriptorType::UniformBuffer)
                }
            }
            storage::STORAGE_BUFFER => Some(DescriptorType::StorageBuffer),
            storage::UNIFORM_CONSTANT => match self.types.get(&type_id)? {
                SpvType::Image { sampled: 2 } => Some(DescriptorType::StorageImage),
                SpvType::Image { .. } => Some(DescriptorType::SampledImage),
                SpvType::Sampler => Some(DescriptorType::Sampler),
                SpvType::SampledImage => Some(DescriptorType::CombinedImageSampler),
                _ => None,
            },
            _ => None,
        }
    }

    /// Byte size of a type under the explicit layout decorations.
    fn type_size(&self, type_id: u32) -> u32 {
        match self.types.get(&type_id) {
            Some(SpvType::Int { width, .. } | SpvType::Float { width }) => width / 8,
            Some(SpvType::Vector { component, count }) => self.type_size(*component) * count,
            Some(SpvType::Matrix { column, count }) => self.type_size(*column) * count,
            Some(SpvType::Array { element, length_id }) => {
                let length = self.constants.get(length_id).copied().unwrap_or(1);
                let stride = self
                    .decoration(type_id, decoration::ARRAY_STRIDE)
                    .unwrap_or_else(|| self.type_size(*element));
                stride * length
            }
            Some(SpvType::Struct) => {
                let members = self.struct_members.get(&type_id).map_or(&[][..], Vec::as_slice);
                members
                    .iter()
                    .enumerate()
                    .map(|(i, &member)| {
                        let offset = self.member_offsets.get(&(type_id, i as u32)).copied().unwrap_or(0);
                        offset + self.type_size(member)
                    })
                    .max()
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn vertex_format(&self, type_id: u32) -> Option<Format> {
        let (scalar, count) = match self.types.get(&type_id)? {
            SpvType::Vector { component, count } => (*component, *count),
            _ => (type_id, 1),
        };
        let format = match (self.types.get(&scalar)?, count) {
            (SpvType::Float { width: 32 }, 1) => Format::R32Float,
            (SpvType::Float { width: 32 }, 2) => Format::Rg32Float,
            (SpvType::Float { width: 32 }, 3) => Format::Rgb32Float,
            (SpvType::Float { width: 32 }, 4) => Format::Rgba32Float,
            (SpvType::Int { width: 32, signed: false }, 1) => Format::R32Uint,
            (SpvType::Int { width: 32, signed: false }, 2) => Format::Rg32Uint,
            (SpvType::Int { width: 32, signed: false }, 3) => Format::Rgb32Uint,
            (SpvType::Int { width: 32, signed: false }, 4) => Format::Rgba32Uint,
            (SpvType::Int { width: 32, signed: true }, 1) => Format::R32Sint,
            (SpvType::Int { width: 32, signed: true }, 2) => Format::Rg32Sint,
            (SpvType::Int { width: 32, signed: true }, 3) => Format::Rgb32Sint,
            (SpvType::Int { width: 32, signed: true }, 4) => Format::Rgba32Sint,
            _ => return None,
        };
        Some(format)
    }
}

fn read_string(words: &[u32]) -> (String, &[u32]) {
    let mut bytes = Vec::new();
    for (i, word) in words.iter().enumerate() {
        for b in word.to_le_bytes() {
            if b == 0 {
                return (String::from_utf8_lossy(&bytes).into_owned(), &words[i + 1..]);
            }
            bytes.push(b);
        }
    }
    (String::from_utf8_lossy(&bytes).into_owned(), &[])
}

fn stage_for_execution_model(model: u32) -> Option<ShaderStage> {
    match model {
        0 => Some(ShaderStage::Vertex),
        4 => Some(ShaderStage::Fragment),
        5 => Some(ShaderStage::Compute),
        5267 | 5364 => Some(ShaderStage::Task),
        5268 | 5365 => Some(ShaderStage::Mesh),
        _ => None,
    }
}

// ============================================================================
// Public entry points
// ============================================================================

/// `(stage, name)` of every entry point declared by a SPIR-V module.
pub fn spirv_entry_points(words: &[u32]) -> Result<Vec<(ShaderStage, String)>> {
    let module = Module::parse(words)?;
    Ok(module
        .entry_points
        .iter()
        .filter_map(|(model, name, _)| Some((stage_for_execution_model(*model)?, name.clone())))
        .collect())
}

/// Reflects a single stage and merges it into `result`.
pub fn reflect_stage(result: &mut ReflectionResult, stage: ShaderStage, entry_point: &str, words: &[u32]) -> Result<()> {
    let module = Module::parse(words)?;
    let stage_flag = stage.flag();

    for var in &module.variables {
        let Some(pointee) = module.pointee(var.type_id) else {
            continue;
        };

        if var.storage == storage::PUSH_CONSTANT {
            result.merge_push_constants(module.type_size(pointee), stage_flag);
            continue;
        }

        let (Some(set), Some(binding)) = (
            module.decoration(var.id, decoration::DESCRIPTOR_SET),
            module.decoration(var.id, decoration::BINDING),
        ) else {
            continue;
        };

        let (element, count) = module.unwrap_array(pointee);
        let Some(descriptor_type) = module.descriptor_type(var, element) else {
            log::warn!("Unrecognized resource at set {set} binding {binding}, skipped");
            continue;
        };
        if var.storage == storage::UNIFORM
            && !module.has_decoration(element, decoration::BLOCK)
            && !module.has_decoration(element, decoration::BUFFER_BLOCK)
        {
            log::warn!("Uniform at set {set} binding {binding} lacks a Block decoration");
        }

        result.merge_binding(
            set,
            DescriptorBinding {
                binding,
                descriptor_type,
                count,
                stages: stage_flag,
            },
        );
    }

    if stage == ShaderStage::Vertex {
        let interface = module
            .entry_points
            .iter()
            .find(|(model, name, _)| *model == 0 && name == entry_point)
            .map(|(_, _, ids)| ids.as_slice())
            .unwrap_or(&[]);
        result.vertex_input = reflect_vertex_input(&module, interface);
    }

    Ok(())
}

fn reflect_vertex_input(module: &Module, interface: &[u32]) -> VertexInput {
    let mut located: Vec<(u32, Format)> = module
        .variables
        .iter()
        .filter(|v| v.storage == storage::INPUT && interface.contains(&v.id))
        .filter(|v| !module.has_decoration(v.id, decoration::BUILT_IN))
        .filter_map(|v| {
            let location = module.decoration(v.id, decoration::LOCATION)?;
            let format = module.vertex_format(module.pointee(v.type_id)?)?;
            Some((location, format))
        })
        .collect();
    located.sort_by_key(|&(location, _)| location);

    let mut input = VertexInput::default();
    if located.is_empty() {
        return input;
    }

    let mut offset = 0;
    for (location, format) in located {
        input.attributes.push(VertexAttribute {
            location,
            binding: 0,
            format,
            offset,
        });
        offset += format.block_size();
    }
    input.bindings.push(VertexBindingLayout { binding: 0, stride: offset });
    input
}

/// Reflects the program made of `stages` (already ordered for the pipeline).
pub fn reflect_program(stages: &[&CompiledStage]) -> Result<ReflectionResult> {
    let mut result = ReflectionResult::default();
    for stage in stages {
        reflect_stage(&mut result, stage.stage, &stage.entry_point, &stage.code)?;
    }
    Ok(result)
}

// ============================================================================
// JSON cache
// ============================================================================

/// `<dir>/<hash>.reflection.json`, hashing stage id, code and entry point
/// of every stage in order.
#[must_use]
pub fn reflection_cache_path(dir: &Path, stages: &[&CompiledStage]) -> PathBuf {
    let mut hasher = Xxh3::new();
    for stage in stages {
        hasher.update(&stage.stage.id().to_le_bytes());
        hasher.update(bytemuck::cast_slice(&stage.code));
        hasher.update(stage.entry_point.as_bytes());
    }
    dir.join(format!("{:016x}.reflection.json", hasher.digest()))
}

/// Reflection with an optional on-disk JSON cache.
pub fn reflect_cached(stages: &[&CompiledStage], cache_dir: Option<&Path>) -> Result<ReflectionResult> {
    let Some(dir) = cache_dir else {
        return reflect_program(stages);
    };
    if !ensure_directory(dir) {
        return reflect_program(stages);
    }

    let path = reflection_cache_path(dir, stages);
    if let Ok(text) = fs::read_to_string(&path) {
        match serde_json::from_str::<ReflectionResult>(&text) {
            Ok(result) => {
                log::debug!("Reflection cache hit: {}", path.display());
                return Ok(result);
            }
            Err(e) => log::warn!("Ignoring malformed reflection cache {}: {e}", path.display()),
        }
    }

    let result = reflect_program(stages)?;
    match serde_json::to_string_pretty(&result) {
        Ok(json) => {
            if let Err(e) = fs::write(&path, json) {
                log::warn!("Failed to write reflection cache {}: {e}", path.display());
            }
        }
        Err(e) => log::warn!("Failed to serialize reflection: {e}"),
    }
    Ok(result)
}
