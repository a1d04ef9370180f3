//! Runtime shader cache
//!
//! Ties the indexes, the disk stores, the loader and the writer together. A
//! lookup that misses the indexes translates the guest code, builds the host
//! program, indexes it and hands it to the writer.

use crate::accessor::RecordingGpuAccessor;
use crate::backend::{HostContext, LinkStatus, ShaderTranslator, TranslatedShader};
use crate::channel::{GpuChannelPoolState, GpuChannelState, GuestMemory};
use crate::index::{ShaderAddresses, ShaderIndexes};
use crate::loader::{create_host_program, LoadSummary, ParallelDiskCacheLoader, ShaderCacheState};
use crate::program_store::ProgramStore;
use crate::specialization::{ComputeStaticState, GraphicsStaticState, SpecializationState};
use crate::types::{
    CachedShaderProgram, CachedShaderStage, ShaderStage, GRAPHICS_STAGE_SLOTS, VERTEX_A_SLOT,
    VERTEX_B_SLOT,
};
use crate::writer::BackgroundDiskCacheWriter;
use oc_core::{Result, ShaderCacheConfig, ShaderCacheError};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Runtime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderCacheStats {
    pub compute_programs: usize,
    pub graphics_programs: usize,
    pub hits: u64,
    pub misses: u64,
    /// Result of the startup load, if one ran
    pub load: Option<LoadSummary>,
}

/// Shader cache owned by the GPU thread
pub struct ShaderCache<T: ShaderTranslator> {
    config: ShaderCacheConfig,
    translator: T,
    indexes: ShaderIndexes,
    store: Option<Arc<ProgramStore>>,
    writer: Option<BackgroundDiskCacheWriter>,
    stats: ShaderCacheStats,
}

impl<T: ShaderTranslator> ShaderCache<T> {
    pub fn new(config: ShaderCacheConfig, translator: T) -> Self {
        Self {
            config,
            translator,
            indexes: ShaderIndexes::default(),
            store: None,
            writer: None,
            stats: ShaderCacheStats::default(),
        }
    }

    /// Load the disk cache and start persisting new programs.
    ///
    /// A cache that cannot be loaded leaves the indexes cold; only failing to
    /// start the writer is an error.
    pub fn initialize(
        &mut self,
        context: &mut dyn HostContext,
        cancel: &AtomicBool,
        progress: &mut dyn FnMut(ShaderCacheState, usize, usize),
    ) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("Shader disk cache disabled");
            return Ok(());
        }

        let store = if self.config.host_binaries {
            ProgramStore::with_host(&self.config.path, context.store_key())
        } else {
            ProgramStore::new(&self.config.path)
        };
        let store = Arc::new(store);

        let loader = ParallelDiskCacheLoader::new(
            &store,
            &self.translator,
            context,
            &mut self.indexes,
            cancel,
        )
        .with_threads(self.config.loader_threads);
        match loader.load(progress) {
            Ok(summary) => self.stats.load = Some(summary),
            Err(e) => tracing::error!("Failed to load shader disk cache, starting cold: {}", e),
        }

        if self.config.background_writer {
            self.writer = Some(BackgroundDiskCacheWriter::new(store.clone())?);
        }
        self.store = Some(store);
        Ok(())
    }

    /// Find or build the program for the compute shader at `code_va`
    pub fn get_compute_shader(
        &mut self,
        context: &mut dyn HostContext,
        memory: &dyn GuestMemory,
        channel: &dyn GpuChannelState,
        pool: &GpuChannelPoolState,
        code_va: u64,
        state: ComputeStaticState,
    ) -> Result<Arc<CachedShaderProgram>> {
        if let Some(program) = self.indexes.compute.find(channel, pool, memory, code_va) {
            self.stats.hits += 1;
            return Ok(program);
        }
        self.stats.misses += 1;

        let mut specialization = SpecializationState::new_compute(state);
        let (decoded, cb1_data) = {
            let mut accessor = RecordingGpuAccessor::new(
                memory,
                channel,
                *pool,
                ShaderStage::Compute,
                code_va,
                &mut specialization,
            );
            let decoded = self.translator.decode_compute_shader(&mut accessor)?;
            (decoded, accessor.cb1_snapshot())
        };
        let code = guest_code(memory, code_va, self.translator.guest_code_size(&decoded))?;
        let translated = self.translator.translate(decoded, None)?;

        let stage = CachedShaderStage {
            reflection: Some(translated.reflection.clone()),
            code,
            cb1_data: Arc::from(cb1_data),
        };
        self.finish_program(context, specialization, vec![Some(stage)], &[translated])
    }

    /// Find or build the graphics program for the stages at `addresses`
    pub fn get_graphics_shader(
        &mut self,
        context: &mut dyn HostContext,
        memory: &dyn GuestMemory,
        channel: &dyn GpuChannelState,
        pool: &GpuChannelPoolState,
        addresses: &ShaderAddresses,
        state: GraphicsStaticState,
    ) -> Result<Arc<CachedShaderProgram>> {
        if let Some(program) = self.indexes.graphics.find(channel, pool, memory, addresses) {
            self.stats.hits += 1;
            return Ok(program);
        }
        self.stats.misses += 1;

        if addresses.0[VERTEX_A_SLOT].is_some() && addresses.0[VERTEX_B_SLOT].is_none() {
            return Err(ShaderCacheError::Translation(
                "VertexA stage without a VertexB stage".to_string(),
            ));
        }

        let mut specialization = SpecializationState::new_graphics(state);
        let mut decoded: Vec<Option<T::Decoded>> = Vec::with_capacity(GRAPHICS_STAGE_SLOTS);
        let mut stages: Vec<Option<CachedShaderStage>> = vec![None; GRAPHICS_STAGE_SLOTS];

        for (slot, address) in addresses.0.iter().enumerate() {
            let Some(va) = *address else {
                decoded.push(None);
                continue;
            };

            let (stage_decoded, cb1_data) = {
                let mut accessor = RecordingGpuAccessor::new(
                    memory,
                    channel,
                    *pool,
                    ShaderStage::for_graphics_slot(slot),
                    va,
                    &mut specialization,
                );
                let stage_decoded = self.translator.decode_graphics_shader(&mut accessor)?;
                (stage_decoded, accessor.cb1_snapshot())
            };

            stages[slot] = Some(CachedShaderStage {
                reflection: None,
                code: guest_code(memory, va, self.translator.guest_code_size(&stage_decoded))?,
                cb1_data: Arc::from(cb1_data),
            });
            decoded.push(Some(stage_decoded));
        }

        let mut vertex_a = decoded[VERTEX_A_SLOT].take();
        let mut translated = Vec::new();
        for slot in VERTEX_B_SLOT..GRAPHICS_STAGE_SLOTS {
            let Some(stage_decoded) = decoded[slot].take() else {
                continue;
            };
            let merge = if slot == VERTEX_B_SLOT { vertex_a.take() } else { None };
            let shader = self.translator.translate(stage_decoded, merge)?;
            if let Some(stage) = stages[slot].as_mut() {
                stage.reflection = Some(shader.reflection.clone());
            }
            translated.push(shader);
        }

        if translated.is_empty() {
            return Err(ShaderCacheError::Translation(
                "graphics program has no stages".to_string(),
            ));
        }

        self.finish_program(context, specialization, stages, &translated)
    }

    fn finish_program(
        &mut self,
        context: &mut dyn HostContext,
        specialization: SpecializationState,
        stages: Vec<Option<CachedShaderStage>>,
        translated: &[TranslatedShader],
    ) -> Result<Arc<CachedShaderProgram>> {
        let host_program = create_host_program(context, translated);
        if context.check_program_link(host_program, true) != LinkStatus::Success {
            return Err(ShaderCacheError::LinkFailed { slot: None });
        }

        let program = Arc::new(CachedShaderProgram {
            host_program,
            specialization,
            stages,
        });
        self.indexes.add(program.clone());

        if let Some(store) = &self.store {
            let host_code = if store.host_key().is_some() {
                context.program_binary(host_program)
            } else {
                Vec::new()
            };
            match &self.writer {
                Some(writer) => writer.add_shader(program.clone(), host_code)?,
                None => {
                    store.add_shader(&program, &host_code)?;
                }
            }
        }

        Ok(program)
    }

    /// Wait for pending disk writes and stop the writer
    pub fn shutdown(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.shutdown(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> ShaderCacheStats {
        ShaderCacheStats {
            compute_programs: self.indexes.compute.program_count(),
            graphics_programs: self.indexes.graphics.program_count(),
            ..self.stats
        }
    }

    pub fn indexes(&self) -> &ShaderIndexes {
        &self.indexes
    }

    pub fn store(&self) -> Option<&Arc<ProgramStore>> {
        self.store.as_ref()
    }
}

fn guest_code(memory: &dyn GuestMemory, gpu_va: u64, size: usize) -> Result<Arc<[u8]>> {
    memory
        .get_span(gpu_va, size)
        .map(Arc::from)
        .ok_or_else(|| {
            ShaderCacheError::Translation(format!("guest code at {:#x} is not mapped", gpu_va))
        })
}
