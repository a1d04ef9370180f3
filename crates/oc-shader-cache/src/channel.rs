//! Views of live GPU state consumed by the cache
//!
//! The emulator's GPU channel and guest memory manager implement these traits;
//! the cache never owns either.

use crate::specialization::TransformFeedbackDescriptor;
use crate::types::ShaderStage;

/// Read access to guest GPU virtual memory
pub trait GuestMemory {
    /// Whether `gpu_va` is backed by mapped memory
    fn is_mapped(&self, gpu_va: u64) -> bool;

    /// Borrow `size` bytes starting at `gpu_va`, or `None` if any part of the
    /// range is unmapped
    fn get_span(&self, gpu_va: u64, size: usize) -> Option<&[u8]>;
}

/// Texture pool binding used to resolve texture handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuChannelPoolState {
    pub texture_pool_gpu_va: u64,
    pub texture_pool_maximum_id: i32,
    pub texture_buffer_index: i32,
}

/// Sampler dimensionality of a texture
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureTarget {
    #[default]
    Texture1D = 0,
    Texture2D = 1,
    Texture3D = 2,
    TextureCube = 3,
    Texture1DArray = 4,
    Texture2DArray = 5,
    TextureCubeArray = 6,
    TextureBuffer = 7,
}

impl From<u8> for TextureTarget {
    fn from(v: u8) -> Self {
        match v {
            1 => TextureTarget::Texture2D,
            2 => TextureTarget::Texture3D,
            3 => TextureTarget::TextureCube,
            4 => TextureTarget::Texture1DArray,
            5 => TextureTarget::Texture2DArray,
            6 => TextureTarget::TextureCubeArray,
            7 => TextureTarget::TextureBuffer,
            _ => TextureTarget::Texture1D,
        }
    }
}

/// The parts of a live texture descriptor a translation can depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureDescriptor {
    pub format: u32,
    pub srgb: bool,
    pub target: TextureTarget,
    pub coord_normalized: bool,
}

/// Current state of a GPU channel
pub trait GpuChannelState {
    /// Resolve the texture descriptor bound to `handle` for `stage`.
    ///
    /// Returns `None` when the constant buffer that holds the handle is not
    /// currently accessible.
    fn texture_descriptor(
        &self,
        stage: ShaderStage,
        handle: i32,
        cbuf_slot: i32,
        pool: &GpuChannelPoolState,
    ) -> Option<TextureDescriptor>;

    /// Contents of constant buffer 1 bound to `stage`
    fn constant_buffer1(&self, stage: ShaderStage) -> &[u8];

    /// Mask of constant buffers currently bound to `stage`
    fn constant_buffer_use(&self, stage: ShaderStage) -> u32;

    /// Transform feedback layout, if transform feedback is enabled
    fn transform_feedback(&self) -> Option<Vec<TransformFeedbackDescriptor>>;
}
