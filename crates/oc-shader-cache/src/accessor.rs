//! GPU state access for the shader translator
//!
//! The translator reads guest code and queries GPU state only through
//! [`GpuAccessor`]. On first translation [`RecordingGpuAccessor`] answers from
//! live state and records every query; when retranslating from the disk cache
//! [`ReplayGpuAccessor`] answers from what was recorded.

use crate::channel::{GpuChannelPoolState, GpuChannelState, GuestMemory, TextureTarget};
use crate::specialization::{SpecializationState, TransformFeedbackDescriptor};
use crate::types::{CachedShaderStage, ShaderStage};

/// Capabilities the shader translator needs from its environment
pub trait GpuAccessor {
    /// Stage being translated
    fn stage(&self) -> ShaderStage;

    /// Borrow `len` bytes of guest code starting `offset` bytes into the shader
    fn code(&self, offset: usize, len: usize) -> Option<&[u8]>;

    /// Read a word of constant buffer 1
    fn constant_buffer1_read(&mut self, offset: usize) -> u32;

    fn query_primitive_topology(&mut self) -> u32;

    fn query_early_z_force(&mut self) -> bool;

    fn query_constant_buffer_use(&mut self) -> u32;

    fn query_transform_feedback(&mut self) -> Option<Vec<TransformFeedbackDescriptor>>;

    /// Compute workgroup size; `[1, 1, 1]` for graphics stages
    fn query_compute_local_size(&self) -> [u32; 3];

    /// `(format, srgb)` of the texture bound to `handle`
    fn query_texture_format(&mut self, handle: i32, cbuf_slot: i32) -> (u32, bool);

    fn query_sampler_type(&mut self, handle: i32, cbuf_slot: i32) -> TextureTarget;

    fn query_texture_coord_normalized(&mut self, handle: i32, cbuf_slot: i32) -> bool;

    /// Note that the translated code samples `handle`
    fn register_texture(&mut self, handle: i32, cbuf_slot: i32);
}

fn read_word(data: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    if let Some(bytes) = data.get(offset..offset + 4) {
        word.copy_from_slice(bytes);
    }
    u32::from_le_bytes(word)
}

/// Accessor used when a program is translated for the first time
pub struct RecordingGpuAccessor<'a> {
    memory: &'a dyn GuestMemory,
    channel: &'a dyn GpuChannelState,
    pool: GpuChannelPoolState,
    stage: ShaderStage,
    code_va: u64,
    state: &'a mut SpecializationState,
    /// One past the last constant buffer 1 byte read so far
    cb1_read_end: usize,
}

impl<'a> RecordingGpuAccessor<'a> {
    pub fn new(
        memory: &'a dyn GuestMemory,
        channel: &'a dyn GpuChannelState,
        pool: GpuChannelPoolState,
        stage: ShaderStage,
        code_va: u64,
        state: &'a mut SpecializationState,
    ) -> Self {
        Self {
            memory,
            channel,
            pool,
            stage,
            code_va,
            state,
            cb1_read_end: 0,
        }
    }

    /// The prefix of constant buffer 1 the translation read, to be stored
    /// alongside the guest code
    pub fn cb1_snapshot(&self) -> Vec<u8> {
        let cb1 = self.channel.constant_buffer1(self.stage);
        cb1[..self.cb1_read_end.min(cb1.len())].to_vec()
    }

    fn ensure_texture_registered(&mut self, handle: i32, cbuf_slot: i32) {
        if self.state.texture(self.stage, handle, cbuf_slot).is_none() {
            self.register_texture(handle, cbuf_slot);
        }
    }
}

impl GpuAccessor for RecordingGpuAccessor<'_> {
    fn stage(&self) -> ShaderStage {
        self.stage
    }

    fn code(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.memory.get_span(self.code_va + offset as u64, len)
    }

    fn constant_buffer1_read(&mut self, offset: usize) -> u32 {
        self.cb1_read_end = self.cb1_read_end.max(offset + 4);
        read_word(self.channel.constant_buffer1(self.stage), offset)
    }

    fn query_primitive_topology(&mut self) -> u32 {
        self.state.record_primitive_topology();
        self.state.graphics_state().topology
    }

    fn query_early_z_force(&mut self) -> bool {
        self.state.record_early_z_force();
        self.state.graphics_state().early_z_force != 0
    }

    fn query_constant_buffer_use(&mut self) -> u32 {
        let mask = self.channel.constant_buffer_use(self.stage);
        self.state.record_constant_buffer_use(self.stage, mask);
        mask
    }

    fn query_transform_feedback(&mut self) -> Option<Vec<TransformFeedbackDescriptor>> {
        let descriptors = self.channel.transform_feedback();
        self.state.record_transform_feedback(descriptors.clone());
        descriptors
    }

    fn query_compute_local_size(&self) -> [u32; 3] {
        if self.state.is_compute() {
            let cs = self.state.compute_state();
            [cs.local_size_x, cs.local_size_y, cs.local_size_z]
        } else {
            [1, 1, 1]
        }
    }

    fn query_texture_format(&mut self, handle: i32, cbuf_slot: i32) -> (u32, bool) {
        self.ensure_texture_registered(handle, cbuf_slot);
        self.state.record_texture_format(self.stage, handle, cbuf_slot);
        self.state
            .texture_format(self.stage, handle, cbuf_slot)
            .unwrap_or_default()
    }

    fn query_sampler_type(&mut self, handle: i32, cbuf_slot: i32) -> TextureTarget {
        self.ensure_texture_registered(handle, cbuf_slot);
        self.state.record_texture_sampler_type(self.stage, handle, cbuf_slot);
        self.state
            .texture_target(self.stage, handle, cbuf_slot)
            .unwrap_or_default()
    }

    fn query_texture_coord_normalized(&mut self, handle: i32, cbuf_slot: i32) -> bool {
        self.ensure_texture_registered(handle, cbuf_slot);
        self.state.record_texture_coord_normalized(self.stage, handle, cbuf_slot);
        self.state
            .texture_coord_normalized(self.stage, handle, cbuf_slot)
            .unwrap_or(true)
    }

    fn register_texture(&mut self, handle: i32, cbuf_slot: i32) {
        // An inaccessible constant buffer snapshots a default descriptor
        let descriptor = self
            .channel
            .texture_descriptor(self.stage, handle, cbuf_slot, &self.pool)
            .unwrap_or_default();
        self.state.register_texture(self.stage, handle, cbuf_slot, &descriptor);
    }
}

/// Accessor used when retranslating a program loaded from the disk cache
pub struct ReplayGpuAccessor<'a> {
    stage_data: &'a CachedShaderStage,
    state: &'a SpecializationState,
    stage: ShaderStage,
}

impl<'a> ReplayGpuAccessor<'a> {
    pub fn new(
        stage_data: &'a CachedShaderStage,
        state: &'a SpecializationState,
        stage: ShaderStage,
    ) -> Self {
        Self {
            stage_data,
            state,
            stage,
        }
    }
}

impl GpuAccessor for ReplayGpuAccessor<'_> {
    fn stage(&self) -> ShaderStage {
        self.stage
    }

    fn code(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.stage_data.code.get(offset..offset.checked_add(len)?)
    }

    fn constant_buffer1_read(&mut self, offset: usize) -> u32 {
        read_word(&self.stage_data.cb1_data, offset)
    }

    fn query_primitive_topology(&mut self) -> u32 {
        self.state.graphics_state().topology
    }

    fn query_early_z_force(&mut self) -> bool {
        self.state.graphics_state().early_z_force != 0
    }

    fn query_constant_buffer_use(&mut self) -> u32 {
        self.state.constant_buffer_use(self.stage).unwrap_or(0)
    }

    fn query_transform_feedback(&mut self) -> Option<Vec<TransformFeedbackDescriptor>> {
        self.state.transform_feedback().map(|tf| tf.to_vec())
    }

    fn query_compute_local_size(&self) -> [u32; 3] {
        if self.state.is_compute() {
            let cs = self.state.compute_state();
            [cs.local_size_x, cs.local_size_y, cs.local_size_z]
        } else {
            [1, 1, 1]
        }
    }

    fn query_texture_format(&mut self, handle: i32, cbuf_slot: i32) -> (u32, bool) {
        self.state
            .texture_format(self.stage, handle, cbuf_slot)
            .unwrap_or_default()
    }

    fn query_sampler_type(&mut self, handle: i32, cbuf_slot: i32) -> TextureTarget {
        self.state
            .texture_target(self.stage, handle, cbuf_slot)
            .unwrap_or_default()
    }

    fn query_texture_coord_normalized(&mut self, handle: i32, cbuf_slot: i32) -> bool {
        self.state
            .texture_coord_normalized(self.stage, handle, cbuf_slot)
            .unwrap_or(true)
    }

    fn register_texture(&mut self, _handle: i32, _cbuf_slot: i32) {}
}
