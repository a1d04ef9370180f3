//! Persistent shader variant cache for the oxidized-cell RSX layer
//!
//! Guest shader code is deduplicated into an append-only store, every
//! translated program is recorded together with the GPU state its
//! translation depended on, and host program binaries are kept per graphics
//! API and GPU vendor. At startup the cache is reloaded in parallel; at
//! runtime lookups go through content-addressable in-memory indexes.

pub mod accessor;
pub mod backend;
pub mod channel;
pub mod codec;
pub mod guest_store;
pub mod hash;
pub mod index;
pub mod loader;
pub mod program_store;
pub mod shader_cache;
pub mod specialization;
pub mod toc;
pub mod types;
pub mod writer;

pub use accessor::{GpuAccessor, RecordingGpuAccessor, ReplayGpuAccessor};
pub use backend::{
    HostContext, HostStoreKey, LinkStatus, ShaderTranslator, TranslatedShader, CODEGEN_VERSION,
};
pub use channel::{
    GpuChannelPoolState, GpuChannelState, GuestMemory, TextureDescriptor, TextureTarget,
};
pub use guest_store::{GuestCodeStore, GuestStoreStats};
pub use index::{ShaderAddresses, ShaderIndexes, ShaderSpecializationList};
pub use loader::{LoadSummary, ParallelDiskCacheLoader, ShaderCacheState};
pub use program_store::{ProgramLoadSink, ProgramStore, StoreReport};
pub use shader_cache::{ShaderCache, ShaderCacheStats};
pub use specialization::{
    ComputeStaticState, GraphicsStaticState, QueriedStateFlags, QueriedTextureStateFlags,
    SpecializationState, TransformFeedbackDescriptor,
};
pub use types::{
    CachedShaderProgram, CachedShaderStage, GuestCodeId, HostProgramHandle, HostShaderHandle,
    ProgramSlot, ShaderReflection, ShaderStage,
};
pub use writer::BackgroundDiskCacheWriter;
