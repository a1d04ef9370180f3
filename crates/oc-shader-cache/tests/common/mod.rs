//! Mock collaborators shared by the integration tests

#![allow(dead_code)]

use oc_core::{Result, ShaderCacheConfig, ShaderCacheError};
use oc_shader_cache::{
    GpuAccessor, GpuChannelPoolState, GpuChannelState, GuestMemory, HostContext, HostProgramHandle,
    HostShaderHandle, HostStoreKey, LinkStatus, ShaderReflection, ShaderStage, ShaderTranslator,
    TextureDescriptor, TextureTarget, TransformFeedbackDescriptor, TranslatedShader,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Texture handle every mock fragment shader samples
pub const SAMPLED_HANDLE: i32 = 1;

/// Encode a mock guest shader: a little-endian length followed by the body
pub fn shader(body: &[u8]) -> Vec<u8> {
    let mut code = (body.len() as u32).to_le_bytes().to_vec();
    code.extend_from_slice(body);
    code
}

pub fn config(path: &Path) -> ShaderCacheConfig {
    ShaderCacheConfig {
        enabled: true,
        path: path.to_path_buf(),
        loader_threads: 4,
        host_binaries: true,
        background_writer: true,
    }
}

/// Guest memory made of disjoint regions
#[derive(Default)]
pub struct TestMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl TestMemory {
    pub fn map(&mut self, gpu_va: u64, bytes: Vec<u8>) {
        self.regions.push((gpu_va, bytes));
    }
}

impl GuestMemory for TestMemory {
    fn is_mapped(&self, gpu_va: u64) -> bool {
        self.regions
            .iter()
            .any(|(base, bytes)| gpu_va >= *base && gpu_va < base + bytes.len() as u64)
    }

    fn get_span(&self, gpu_va: u64, size: usize) -> Option<&[u8]> {
        self.regions.iter().find_map(|(base, bytes)| {
            let start = gpu_va.checked_sub(*base)? as usize;
            bytes.get(start..start.checked_add(size)?)
        })
    }
}

/// Channel whose textures all share one normalization setting
pub struct TestChannel {
    pub coord_normalized: bool,
    pub cb1: Vec<u8>,
}

impl Default for TestChannel {
    fn default() -> Self {
        Self {
            coord_normalized: true,
            cb1: vec![7, 0, 0, 0],
        }
    }
}

impl GpuChannelState for TestChannel {
    fn texture_descriptor(
        &self,
        _stage: ShaderStage,
        _handle: i32,
        _cbuf_slot: i32,
        _pool: &GpuChannelPoolState,
    ) -> Option<TextureDescriptor> {
        Some(TextureDescriptor {
            format: 0x85,
            srgb: false,
            target: TextureTarget::Texture2D,
            coord_normalized: self.coord_normalized,
        })
    }

    fn constant_buffer1(&self, _stage: ShaderStage) -> &[u8] {
        &self.cb1
    }

    fn constant_buffer_use(&self, _stage: ShaderStage) -> u32 {
        0b1
    }

    fn transform_feedback(&self) -> Option<Vec<TransformFeedbackDescriptor>> {
        None
    }
}

/// Decoded mock shader
pub struct MockDecoded {
    stage: ShaderStage,
    body: Vec<u8>,
    cb1_word: u32,
    coord_normalized: bool,
}

/// Translator that "compiles" a shader into its body plus the state it read
#[derive(Default)]
pub struct MockTranslator {
    /// Translations whose body starts with this byte fail
    pub fail_marker: Option<u8>,
    pub translations: AtomicUsize,
}

impl MockTranslator {
    pub fn failing_on(marker: u8) -> Self {
        Self {
            fail_marker: Some(marker),
            ..Default::default()
        }
    }

    pub fn translation_count(&self) -> usize {
        self.translations.load(Ordering::SeqCst)
    }

    fn decode(&self, accessor: &mut dyn GpuAccessor) -> Result<MockDecoded> {
        let stage = accessor.stage();
        let header = accessor
            .code(0, 4)
            .ok_or_else(|| ShaderCacheError::Translation("missing shader header".to_string()))?;
        let mut len = [0u8; 4];
        len.copy_from_slice(header);
        let len = u32::from_le_bytes(len) as usize;

        let body = accessor
            .code(4, len)
            .ok_or_else(|| ShaderCacheError::Translation("truncated shader body".to_string()))?
            .to_vec();
        let cb1_word = accessor.constant_buffer1_read(0);
        accessor.query_constant_buffer_use();

        let coord_normalized = if stage == ShaderStage::Fragment {
            accessor.query_texture_coord_normalized(SAMPLED_HANDLE, -1)
        } else {
            false
        };

        Ok(MockDecoded {
            stage,
            body,
            cb1_word,
            coord_normalized,
        })
    }
}

impl ShaderTranslator for MockTranslator {
    type Decoded = MockDecoded;

    fn decode_compute_shader(&self, accessor: &mut dyn GpuAccessor) -> Result<MockDecoded> {
        self.decode(accessor)
    }

    fn decode_graphics_shader(&self, accessor: &mut dyn GpuAccessor) -> Result<MockDecoded> {
        self.decode(accessor)
    }

    fn guest_code_size(&self, decoded: &MockDecoded) -> usize {
        4 + decoded.body.len()
    }

    fn translate(
        &self,
        decoded: MockDecoded,
        vertex_a: Option<MockDecoded>,
    ) -> Result<TranslatedShader> {
        self.translations.fetch_add(1, Ordering::SeqCst);
        if self.fail_marker.is_some() && decoded.body.first().copied() == self.fail_marker {
            return Err(ShaderCacheError::Translation("mock failure".to_string()));
        }

        let mut host_code = decoded.body.clone();
        host_code.extend_from_slice(&decoded.cb1_word.to_le_bytes());
        host_code.push(decoded.coord_normalized as u8);
        if let Some(vertex_a) = vertex_a {
            host_code.extend_from_slice(&vertex_a.body);
        }

        let mut reflection = ShaderReflection::new(decoded.stage);
        if decoded.stage == ShaderStage::Fragment {
            reflection.fragment_output_map = 0xF;
        }

        Ok(TranslatedShader {
            stage: decoded.stage,
            reflection,
            host_code,
        })
    }
}

struct MockProgram {
    binary: Vec<u8>,
    from_binary: bool,
}

/// Host context that must only be used from the thread that created it
pub struct MockContext {
    owner: ThreadId,
    /// Programs created from stored binaries fail to link
    pub fail_binary_links: bool,
    /// Calls to `create_program_from_binary`
    pub binary_loads: usize,
    pub programs_created: usize,
    /// Calls to `program_binary`
    pub binaries_read: usize,
    /// Raise the flag once this many binaries have been read
    pub cancel_after_binaries: Option<(usize, Arc<AtomicBool>)>,
    next_handle: u64,
    shaders: HashMap<u64, Vec<u8>>,
    programs: HashMap<u64, MockProgram>,
}

impl MockContext {
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            fail_binary_links: false,
            binary_loads: 0,
            programs_created: 0,
            binaries_read: 0,
            cancel_after_binaries: None,
            next_handle: 1,
            shaders: HashMap::new(),
            programs: HashMap::new(),
        }
    }

    pub fn rejecting_binaries() -> Self {
        Self {
            fail_binary_links: true,
            ..Self::new()
        }
    }

    fn assert_owner(&self) {
        assert_eq!(thread::current().id(), self.owner, "host context used off its thread");
    }

    fn allocate(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl HostContext for MockContext {
    fn store_key(&self) -> HostStoreKey {
        HostStoreKey::new("mock", "test")
    }

    fn create_program_from_binary(
        &mut self,
        binary: &[u8],
        _reflections: &[&ShaderReflection],
    ) -> Option<HostProgramHandle> {
        self.assert_owner();
        self.binary_loads += 1;
        let handle = self.allocate();
        self.programs.insert(
            handle,
            MockProgram {
                binary: binary.to_vec(),
                from_binary: true,
            },
        );
        Some(HostProgramHandle(handle))
    }

    fn compile_shader(&mut self, shader: &TranslatedShader) -> HostShaderHandle {
        self.assert_owner();
        let handle = self.allocate();
        self.shaders.insert(handle, shader.host_code.clone());
        HostShaderHandle(handle)
    }

    fn create_program(
        &mut self,
        shaders: &[HostShaderHandle],
        _reflections: &[&ShaderReflection],
    ) -> HostProgramHandle {
        self.assert_owner();
        self.programs_created += 1;
        let binary: Vec<u8> = shaders
            .iter()
            .filter_map(|s| self.shaders.get(&s.0))
            .flatten()
            .copied()
            .collect();
        let handle = self.allocate();
        self.programs.insert(
            handle,
            MockProgram {
                binary,
                from_binary: false,
            },
        );
        HostProgramHandle(handle)
    }

    fn check_program_link(&mut self, program: HostProgramHandle, _blocking: bool) -> LinkStatus {
        self.assert_owner();
        match self.programs.get(&program.0) {
            Some(p) if p.from_binary && self.fail_binary_links => LinkStatus::Failure,
            Some(_) => LinkStatus::Success,
            None => LinkStatus::Failure,
        }
    }

    fn program_binary(&mut self, program: HostProgramHandle) -> Vec<u8> {
        self.assert_owner();
        self.binaries_read += 1;
        if let Some((after, cancel)) = &self.cancel_after_binaries {
            if self.binaries_read >= *after {
                cancel.store(true, Ordering::SeqCst);
            }
        }
        self.programs
            .get(&program.0)
            .map(|p| p.binary.clone())
            .unwrap_or_default()
    }
}
