//! Specialization state
//!
//! A translation may depend on GPU state sampled while it ran. The accessor
//! records every such query here, so at draw time a cached variant is only
//! reused when the state it depended on still agrees with the live state.

use crate::channel::{GpuChannelPoolState, GpuChannelState, TextureDescriptor, TextureTarget};
use crate::codec::{make_magic, BinaryReader, BinaryWriter};
use crate::types::{ShaderStage, GRAPHICS_STAGE_SLOTS};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use oc_core::{FormatError, Result};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

const COMPUTE_STATE_MAGIC: u32 = make_magic(b"COMS");
const GRAPHICS_STATE_MAGIC: u32 = make_magic(b"GFXS");
const TRANSFORM_FEEDBACK_MAGIC: u32 = make_magic(b"TFBD");
const TEXTURE_KEY_MAGIC: u32 = make_magic(b"TEXK");
const TEXTURE_STATE_MAGIC: u32 = make_magic(b"TEXS");

/// Number of vertex attribute type slots in [`GraphicsStaticState`]
pub const MAX_VERTEX_ATTRIBUTES: usize = 16;

/// Maximum varyings captured per transform feedback buffer
pub const MAX_TRANSFORM_FEEDBACK_VARYINGS: usize = 128;

bitflags! {
    /// Program-wide state queries issued during translation. Persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueriedStateFlags: u32 {
        const EARLY_Z_FORCE = 1 << 0;
        const PRIMITIVE_TOPOLOGY = 1 << 1;
        const CONSTANT_BUFFER_USE = 1 << 2;
        const TRANSFORM_FEEDBACK = 1 << 3;
    }
}

bitflags! {
    /// Per-texture state queries issued during translation. Persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueriedTextureStateFlags: u32 {
        const TEXTURE_FORMAT = 1 << 0;
        const SAMPLER_TYPE = 1 << 1;
        const COORD_NORMALIZED = 1 << 2;
    }
}

/// Static graphics pipeline state a graphics translation was built against
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GraphicsStaticState {
    pub early_z_force: u32,
    pub topology: u32,
    pub tessellation_mode: u32,
    pub viewport_transform_disable: u32,
    pub alpha_to_coverage_enable: u32,
    pub program_point_size_enable: u32,
    pub point_size: f32,
    pub reserved: u32,
    pub attribute_types: [u8; MAX_VERTEX_ATTRIBUTES],
}

impl Default for GraphicsStaticState {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Static compute dispatch state a compute translation was built against
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct ComputeStaticState {
    pub local_size_x: u32,
    pub local_size_y: u32,
    pub local_size_z: u32,
    pub shared_memory_size: u32,
    pub texture_buffer_index: u32,
}

/// Layout of one transform feedback buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TransformFeedbackDescriptor {
    pub buffer_index: u32,
    pub stride: u32,
    pub varying_count: u32,
    pub varying_locations: [u8; MAX_TRANSFORM_FEEDBACK_VARYINGS],
}

/// Identifies a texture handle read by a stage
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct TextureKey {
    pub stage: u32,
    pub handle: i32,
    pub cbuf_slot: i32,
}

impl TextureKey {
    pub fn new(stage: ShaderStage, handle: i32, cbuf_slot: i32) -> Self {
        Self {
            stage: stage as u32,
            handle,
            cbuf_slot,
        }
    }

    pub fn shader_stage(&self) -> Option<ShaderStage> {
        ShaderStage::from_u32(self.stage)
    }
}

/// Recorded descriptor snapshot for one texture handle
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct TextureSpecialization {
    pub queried: u32,
    pub format: u32,
    pub format_srgb: u8,
    pub texture_target: u8,
    pub coord_normalized: u8,
    pub reserved: u8,
}

impl TextureSpecialization {
    pub fn queried_flags(&self) -> QueriedTextureStateFlags {
        QueriedTextureStateFlags::from_bits_retain(self.queried)
    }

    fn set_queried(&mut self, flag: QueriedTextureStateFlags) {
        self.queried |= flag.bits();
    }

    fn snapshot(&mut self, descriptor: &TextureDescriptor) {
        self.format = descriptor.format;
        self.format_srgb = descriptor.srgb as u8;
        self.texture_target = descriptor.target as u8;
        self.coord_normalized = descriptor.coord_normalized as u8;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SpecializationHeader {
    queried: u32,
    is_compute: u32,
    transform_feedback_count: u32,
    texture_count: u32,
    constant_buffer_use: [u32; GRAPHICS_STAGE_SLOTS],
}

/// State a translated program depends on
#[derive(Debug, Clone, PartialEq)]
pub struct SpecializationState {
    is_compute: bool,
    graphics_state: GraphicsStaticState,
    compute_state: ComputeStaticState,
    queried: QueriedStateFlags,
    constant_buffer_use: [u32; GRAPHICS_STAGE_SLOTS],
    transform_feedback: Option<Vec<TransformFeedbackDescriptor>>,
    textures: BTreeMap<TextureKey, TextureSpecialization>,
}

impl SpecializationState {
    /// State for a compute program
    pub fn new_compute(state: ComputeStaticState) -> Self {
        Self {
            is_compute: true,
            graphics_state: GraphicsStaticState::default(),
            compute_state: state,
            queried: QueriedStateFlags::empty(),
            constant_buffer_use: [0; GRAPHICS_STAGE_SLOTS],
            transform_feedback: None,
            textures: BTreeMap::new(),
        }
    }

    /// State for a graphics program
    pub fn new_graphics(state: GraphicsStaticState) -> Self {
        Self {
            is_compute: false,
            graphics_state: state,
            compute_state: ComputeStaticState::default(),
            queried: QueriedStateFlags::empty(),
            constant_buffer_use: [0; GRAPHICS_STAGE_SLOTS],
            transform_feedback: None,
            textures: BTreeMap::new(),
        }
    }

    pub fn is_compute(&self) -> bool {
        self.is_compute
    }

    pub fn graphics_state(&self) -> &GraphicsStaticState {
        &self.graphics_state
    }

    pub fn compute_state(&self) -> &ComputeStaticState {
        &self.compute_state
    }

    pub fn queried_flags(&self) -> QueriedStateFlags {
        self.queried
    }

    pub fn record_early_z_force(&mut self) {
        self.queried |= QueriedStateFlags::EARLY_Z_FORCE;
    }

    pub fn record_primitive_topology(&mut self) {
        self.queried |= QueriedStateFlags::PRIMITIVE_TOPOLOGY;
    }

    pub fn record_constant_buffer_use(&mut self, stage: ShaderStage, mask: u32) {
        self.queried |= QueriedStateFlags::CONSTANT_BUFFER_USE;
        self.constant_buffer_use[stage as usize] = mask;
    }

    /// Constant buffer use mask recorded for `stage`, if it was queried
    pub fn constant_buffer_use(&self, stage: ShaderStage) -> Option<u32> {
        self.queried
            .contains(QueriedStateFlags::CONSTANT_BUFFER_USE)
            .then(|| self.constant_buffer_use[stage as usize])
    }

    pub fn record_transform_feedback(
        &mut self,
        descriptors: Option<Vec<TransformFeedbackDescriptor>>,
    ) {
        self.queried |= QueriedStateFlags::TRANSFORM_FEEDBACK;
        self.transform_feedback = descriptors;
    }

    pub fn transform_feedback(&self) -> Option<&[TransformFeedbackDescriptor]> {
        self.transform_feedback.as_deref()
    }

    /// Snapshot the descriptor backing a texture handle.
    ///
    /// Registration alone does not mark any field as depended upon; the
    /// `record_texture_*` calls do.
    pub fn register_texture(
        &mut self,
        stage: ShaderStage,
        handle: i32,
        cbuf_slot: i32,
        descriptor: &TextureDescriptor,
    ) {
        self.textures
            .entry(TextureKey::new(stage, handle, cbuf_slot))
            .or_default()
            .snapshot(descriptor);
    }

    pub fn record_texture_format(&mut self, stage: ShaderStage, handle: i32, cbuf_slot: i32) {
        self.texture_entry(stage, handle, cbuf_slot)
            .set_queried(QueriedTextureStateFlags::TEXTURE_FORMAT);
    }

    pub fn record_texture_sampler_type(&mut self, stage: ShaderStage, handle: i32, cbuf_slot: i32) {
        self.texture_entry(stage, handle, cbuf_slot)
            .set_queried(QueriedTextureStateFlags::SAMPLER_TYPE);
    }

    pub fn record_texture_coord_normalized(
        &mut self,
        stage: ShaderStage,
        handle: i32,
        cbuf_slot: i32,
    ) {
        self.texture_entry(stage, handle, cbuf_slot)
            .set_queried(QueriedTextureStateFlags::COORD_NORMALIZED);
    }

    fn texture_entry(
        &mut self,
        stage: ShaderStage,
        handle: i32,
        cbuf_slot: i32,
    ) -> &mut TextureSpecialization {
        self.textures
            .entry(TextureKey::new(stage, handle, cbuf_slot))
            .or_default()
    }

    pub fn texture(
        &self,
        stage: ShaderStage,
        handle: i32,
        cbuf_slot: i32,
    ) -> Option<&TextureSpecialization> {
        self.textures.get(&TextureKey::new(stage, handle, cbuf_slot))
    }

    /// Recorded `(format, srgb)` of a texture handle
    pub fn texture_format(
        &self,
        stage: ShaderStage,
        handle: i32,
        cbuf_slot: i32,
    ) -> Option<(u32, bool)> {
        self.texture(stage, handle, cbuf_slot)
            .map(|t| (t.format, t.format_srgb != 0))
    }

    pub fn texture_target(
        &self,
        stage: ShaderStage,
        handle: i32,
        cbuf_slot: i32,
    ) -> Option<TextureTarget> {
        self.texture(stage, handle, cbuf_slot)
            .map(|t| TextureTarget::from(t.texture_target))
    }

    pub fn texture_coord_normalized(
        &self,
        stage: ShaderStage,
        handle: i32,
        cbuf_slot: i32,
    ) -> Option<bool> {
        self.texture(stage, handle, cbuf_slot)
            .map(|t| t.coord_normalized != 0)
    }

    pub fn textures(&self) -> impl Iterator<Item = (&TextureKey, &TextureSpecialization)> {
        self.textures.iter()
    }

    /// Check whether the live channel state is compatible with this state.
    ///
    /// Only coordinate normalization is compared. Format and sampler type
    /// queries are recorded but not enforced, and handles whose constant
    /// buffer is currently inaccessible are skipped.
    pub fn matches(&self, channel: &dyn GpuChannelState, pool: &GpuChannelPoolState) -> bool {
        for (key, recorded) in &self.textures {
            if !recorded
                .queried_flags()
                .contains(QueriedTextureStateFlags::COORD_NORMALIZED)
            {
                continue;
            }

            let Some(stage) = key.shader_stage() else {
                return false;
            };

            let live = channel.texture_descriptor(stage, key.handle, key.cbuf_slot, pool);
            let Some(live) = live else {
                continue;
            };

            if live.coord_normalized != (recorded.coord_normalized != 0) {
                return false;
            }
        }

        true
    }

    pub fn write<W: Write>(&self, writer: &mut BinaryWriter<W>) -> io::Result<()> {
        let header = SpecializationHeader {
            queried: self.queried.bits(),
            is_compute: self.is_compute as u32,
            transform_feedback_count: self
                .transform_feedback
                .as_ref()
                .map_or(0, |tf| tf.len() as u32),
            texture_count: self.textures.len() as u32,
            constant_buffer_use: self.constant_buffer_use,
        };
        writer.write(&header)?;

        if self.is_compute {
            writer.write_with_header(&self.compute_state, COMPUTE_STATE_MAGIC)?;
        } else {
            writer.write_with_header(&self.graphics_state, GRAPHICS_STATE_MAGIC)?;
        }

        for descriptor in self.transform_feedback.iter().flatten() {
            writer.write_with_header(descriptor, TRANSFORM_FEEDBACK_MAGIC)?;
        }

        for (key, state) in &self.textures {
            writer.write_with_header(key, TEXTURE_KEY_MAGIC)?;
            writer.write_with_header(state, TEXTURE_STATE_MAGIC)?;
        }

        Ok(())
    }

    pub fn read<R: BufRead>(reader: &mut BinaryReader<R>) -> Result<Self> {
        let header: SpecializationHeader = reader.read("specialization header")?;
        let is_compute = match header.is_compute {
            0 => false,
            1 => true,
            other => {
                return Err(FormatError::CorruptRecord(format!("bad compute flag {}", other)).into())
            }
        };

        let mut state = if is_compute {
            Self::new_compute(reader.read_with_header(COMPUTE_STATE_MAGIC)?)
        } else {
            Self::new_graphics(reader.read_with_header(GRAPHICS_STATE_MAGIC)?)
        };

        state.queried = QueriedStateFlags::from_bits_retain(header.queried);
        state.constant_buffer_use = header.constant_buffer_use;

        if state.queried.contains(QueriedStateFlags::TRANSFORM_FEEDBACK)
            && header.transform_feedback_count > 0
        {
            let descriptors = (0..header.transform_feedback_count)
                .map(|_| reader.read_with_header(TRANSFORM_FEEDBACK_MAGIC))
                .collect::<Result<Vec<_>>>()?;
            state.transform_feedback = Some(descriptors);
        }

        for _ in 0..header.texture_count {
            let key: TextureKey = reader.read_with_header(TEXTURE_KEY_MAGIC)?;
            let texture: TextureSpecialization = reader.read_with_header(TEXTURE_STATE_MAGIC)?;
            state.textures.insert(key, texture);
        }

        Ok(state)
    }
}
