//! Collaborators behind the cache: the host graphics context and the guest
//! shader translator

use crate::accessor::GpuAccessor;
use crate::types::{HostProgramHandle, HostShaderHandle, ShaderReflection, ShaderStage};
use oc_core::Result;

/// Version of the host code generator.
///
/// Bumped whenever the translator output changes incompatibly; host binaries
/// stored under a different version are discarded.
pub const CODEGEN_VERSION: u32 = 1;

/// Identifies one host program store: a (graphics API, GPU vendor) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostStoreKey {
    pub api: String,
    pub vendor: String,
}

impl HostStoreKey {
    pub fn new(api: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            vendor: vendor.into(),
        }
    }

    /// File name stem of the store, `{api}_{vendor}` with path-hostile
    /// characters replaced
    pub fn file_stem(&self) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' {
                        c.to_ascii_lowercase()
                    } else {
                        '-'
                    }
                })
                .collect()
        };
        format!("{}_{}", sanitize(&self.api), sanitize(&self.vendor))
    }
}

/// Link state of a host program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Pending,
    Success,
    Failure,
}

/// Host code produced by the translator for one stage
#[derive(Debug, Clone)]
pub struct TranslatedShader {
    pub stage: ShaderStage,
    pub reflection: ShaderReflection,
    pub host_code: Vec<u8>,
}

/// Host graphics context.
///
/// Every call must happen on the thread that owns the context; the loader
/// makes sure only that thread reaches it.
pub trait HostContext {
    /// Store this context's binaries belong to
    fn store_key(&self) -> HostStoreKey;

    /// Upload a previously retrieved program binary.
    ///
    /// Returns `None` if the driver rejects the binary outright; the link
    /// status of a returned handle still has to be checked.
    fn create_program_from_binary(
        &mut self,
        binary: &[u8],
        reflections: &[&ShaderReflection],
    ) -> Option<HostProgramHandle>;

    fn compile_shader(&mut self, shader: &TranslatedShader) -> HostShaderHandle;

    fn create_program(
        &mut self,
        shaders: &[HostShaderHandle],
        reflections: &[&ShaderReflection],
    ) -> HostProgramHandle;

    /// Query link status, waiting for completion when `blocking` is set
    fn check_program_link(&mut self, program: HostProgramHandle, blocking: bool) -> LinkStatus;

    /// Retrieve the binary of a linked program
    fn program_binary(&mut self, program: HostProgramHandle) -> Vec<u8>;
}

/// Guest shader decoder and translator.
///
/// Decoding happens once per stage through a [`GpuAccessor`]; translation
/// consumes decoded stages and may run on worker threads.
pub trait ShaderTranslator: Send + Sync {
    type Decoded: Send;

    fn decode_compute_shader(&self, accessor: &mut dyn GpuAccessor) -> Result<Self::Decoded>;

    fn decode_graphics_shader(&self, accessor: &mut dyn GpuAccessor) -> Result<Self::Decoded>;

    /// Bytes of guest code the decoded shader spans
    fn guest_code_size(&self, decoded: &Self::Decoded) -> usize;

    /// Translate a decoded stage, merging the VertexA half into it if given
    fn translate(
        &self,
        decoded: Self::Decoded,
        vertex_a: Option<Self::Decoded>,
    ) -> Result<TranslatedShader>;
}
