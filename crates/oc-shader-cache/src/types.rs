//! Shader cache data model

use crate::codec::{make_magic, BinaryReader, BinaryWriter};
use crate::specialization::SpecializationState;
use bytemuck::{Pod, Zeroable};
use oc_core::{FormatError, Result};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Index of an entry in the guest code store
pub type GuestCodeId = u32;

/// Position of a program in the shared program TOC
pub type ProgramSlot = usize;

/// Number of graphics stages that produce host shaders
pub const MAX_GRAPHICS_STAGES: usize = 5;

/// Graphics stage slots: the VertexA pre-merge half followed by every stage
pub const GRAPHICS_STAGE_SLOTS: usize = MAX_GRAPHICS_STAGES + 1;

/// Slot of the VertexA half of a combined vertex shader
pub const VERTEX_A_SLOT: usize = 0;

/// Slot of the vertex shader VertexA merges into
pub const VERTEX_B_SLOT: usize = 1;

const SHADER_INFO_MAGIC: u32 = make_magic(b"SHDI");
const BUFFER_DESCRIPTOR_MAGIC: u32 = make_magic(b"BUFD");
const TEXTURE_DESCRIPTOR_MAGIC: u32 = make_magic(b"TEXD");

/// Shader pipeline stage
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Compute = 0,
    Vertex = 1,
    TessellationControl = 2,
    TessellationEvaluation = 3,
    Geometry = 4,
    Fragment = 5,
}

impl ShaderStage {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Compute),
            1 => Some(Self::Vertex),
            2 => Some(Self::TessellationControl),
            3 => Some(Self::TessellationEvaluation),
            4 => Some(Self::Geometry),
            5 => Some(Self::Fragment),
            _ => None,
        }
    }

    /// Stage held by graphics slot `slot`
    pub fn for_graphics_slot(slot: usize) -> Self {
        match slot {
            0 | 1 => Self::Vertex,
            2 => Self::TessellationControl,
            3 => Self::TessellationEvaluation,
            4 => Self::Geometry,
            _ => Self::Fragment,
        }
    }
}

/// Constant or storage buffer binding reported by the translator
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BufferBinding {
    pub binding: u32,
    pub slot: u32,
    pub flags: u32,
}

/// Texture or image binding reported by the translator
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TextureBinding {
    pub binding: u32,
    pub target: u32,
    pub format: u32,
    pub cbuf_slot: i32,
    pub handle: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ShaderInfoRecord {
    stage: u32,
    constant_buffer_count: u16,
    storage_buffer_count: u16,
    texture_count: u16,
    image_count: u16,
    fragment_output_map: u32,
    uses_instance_id: u8,
    uses_rt_layer: u8,
    clip_distances_written: u8,
    reserved: u8,
}

/// Resource usage of a translated shader
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderReflection {
    pub stage: ShaderStage,
    pub constant_buffers: Vec<BufferBinding>,
    pub storage_buffers: Vec<BufferBinding>,
    pub textures: Vec<TextureBinding>,
    pub images: Vec<TextureBinding>,
    pub fragment_output_map: u32,
    pub uses_instance_id: bool,
    pub uses_rt_layer: bool,
    pub clip_distances_written: u8,
}

impl ShaderReflection {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            constant_buffers: Vec::new(),
            storage_buffers: Vec::new(),
            textures: Vec::new(),
            images: Vec::new(),
            fragment_output_map: 0,
            uses_instance_id: false,
            uses_rt_layer: false,
            clip_distances_written: 0,
        }
    }

    pub fn write<W: Write>(&self, writer: &mut BinaryWriter<W>) -> io::Result<()> {
        let record = ShaderInfoRecord {
            stage: self.stage as u32,
            constant_buffer_count: self.constant_buffers.len() as u16,
            storage_buffer_count: self.storage_buffers.len() as u16,
            texture_count: self.textures.len() as u16,
            image_count: self.images.len() as u16,
            fragment_output_map: self.fragment_output_map,
            uses_instance_id: self.uses_instance_id as u8,
            uses_rt_layer: self.uses_rt_layer as u8,
            clip_distances_written: self.clip_distances_written,
            reserved: 0,
        };
        writer.write_with_header(&record, SHADER_INFO_MAGIC)?;

        for buffer in self.constant_buffers.iter().chain(&self.storage_buffers) {
            writer.write_with_header(buffer, BUFFER_DESCRIPTOR_MAGIC)?;
        }
        for texture in self.textures.iter().chain(&self.images) {
            writer.write_with_header(texture, TEXTURE_DESCRIPTOR_MAGIC)?;
        }
        Ok(())
    }

    pub fn read<R: BufRead>(reader: &mut BinaryReader<R>) -> Result<Self> {
        let record: ShaderInfoRecord = reader.read_with_header(SHADER_INFO_MAGIC)?;
        let stage = ShaderStage::from_u32(record.stage).ok_or_else(|| {
            FormatError::CorruptRecord(format!("unknown shader stage {}", record.stage))
        })?;

        let read_buffers = |reader: &mut BinaryReader<R>, count: u16| {
            (0..count)
                .map(|_| reader.read_with_header(BUFFER_DESCRIPTOR_MAGIC))
                .collect::<Result<Vec<BufferBinding>>>()
        };
        let constant_buffers = read_buffers(&mut *reader, record.constant_buffer_count)?;
        let storage_buffers = read_buffers(&mut *reader, record.storage_buffer_count)?;

        let read_textures = |reader: &mut BinaryReader<R>, count: u16| {
            (0..count)
                .map(|_| reader.read_with_header(TEXTURE_DESCRIPTOR_MAGIC))
                .collect::<Result<Vec<TextureBinding>>>()
        };
        let textures = read_textures(&mut *reader, record.texture_count)?;
        let images = read_textures(&mut *reader, record.image_count)?;

        Ok(Self {
            stage,
            constant_buffers,
            storage_buffers,
            textures,
            images,
            fragment_output_map: record.fragment_output_map,
            uses_instance_id: record.uses_instance_id != 0,
            uses_rt_layer: record.uses_rt_layer != 0,
            clip_distances_written: record.clip_distances_written,
        })
    }
}

/// Guest data of one stage of a cached program
#[derive(Debug, Clone, PartialEq)]
pub struct CachedShaderStage {
    /// Reflection of the translated stage; `None` for VertexA
    pub reflection: Option<ShaderReflection>,
    /// Guest shader machine code
    pub code: Arc<[u8]>,
    /// Constant buffer 1 bytes the translation read
    pub cb1_data: Arc<[u8]>,
}

/// Opaque handle of a host program owned by the graphics backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostProgramHandle(pub u64);

impl HostProgramHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Opaque handle of a compiled host shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostShaderHandle(pub u64);

/// A translated program variant
#[derive(Debug, Clone)]
pub struct CachedShaderProgram {
    /// Host program, referenced but not owned
    pub host_program: HostProgramHandle,
    /// State the translation depended on
    pub specialization: SpecializationState,
    /// One entry for compute programs, [`GRAPHICS_STAGE_SLOTS`] for graphics
    pub stages: Vec<Option<CachedShaderStage>>,
}

impl CachedShaderProgram {
    pub fn is_compute(&self) -> bool {
        self.specialization.is_compute()
    }

    /// Bit `i` is set when stage slot `i` is present
    pub fn stages_bit_mask(&self) -> u32 {
        stages_bit_mask(&self.stages)
    }

    /// Reflection of every present, non-VertexA stage in slot order
    pub fn reflections(&self) -> Vec<&ShaderReflection> {
        stage_reflections(&self.stages)
    }
}

/// Reflection of every stage in `stages` that carries one, in slot order
pub fn stage_reflections(stages: &[Option<CachedShaderStage>]) -> Vec<&ShaderReflection> {
    stages
        .iter()
        .flatten()
        .filter_map(|s| s.reflection.as_ref())
        .collect()
}

/// Bit `i` is set when `stages[i]` is present
pub fn stages_bit_mask(stages: &[Option<CachedShaderStage>]) -> u32 {
    stages
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_some())
        .fold(0, |mask, (i, _)| mask | (1 << i))
}
