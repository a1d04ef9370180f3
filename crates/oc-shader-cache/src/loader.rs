//! Parallel disk cache loader
//!
//! Repopulates the in-memory indexes at startup. The owning thread scans the
//! program store in slot order and tries each stored host binary first;
//! programs without a usable binary are retranslated from guest code by a
//! pool of worker threads. Workers never touch the host context: they hand
//! translated code back through a queue that only the owning thread drains,
//! and link status is polled from a second FIFO on that same thread.
//!
//! Per slot: `Discovered -> {HostBinary | GuestFallback} -> Translated ->
//! QueuedForLink -> {Cached | LinkFailed}`. A host binary that fails to link
//! is retried once from guest code; a guest program that fails is final.

use crate::accessor::ReplayGpuAccessor;
use crate::backend::{HostContext, LinkStatus, ShaderTranslator, TranslatedShader};
use crate::index::ShaderIndexes;
use crate::program_store::{ProgramLoadSink, ProgramStore};
use crate::specialization::SpecializationState;
use crate::types::{
    CachedShaderProgram, CachedShaderStage, HostProgramHandle, ProgramSlot, ShaderReflection,
    ShaderStage, GRAPHICS_STAGE_SLOTS, VERTEX_A_SLOT, VERTEX_B_SLOT,
};
use crossbeam::channel::{self, Receiver, Sender};
use oc_core::config::DEFAULT_LOADER_THREADS;
use oc_core::{Result, ShaderCacheError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Progress phase reported while loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderCacheState {
    Start,
    Loading,
    Loaded,
}

/// Outcome counts of one load pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Program slots in the store
    pub total: usize,
    /// Programs restored from host binaries
    pub host_loaded: usize,
    /// Programs retranslated from guest code
    pub guest_recompiled: usize,
    /// Programs that could not be restored
    pub errors: usize,
    /// Whether the host store was rebuilt after the pass
    pub host_cache_rewritten: bool,
    pub cancelled: bool,
}

struct TranslationJob {
    slot: ProgramSlot,
    stages: Vec<Option<CachedShaderStage>>,
    specialization: SpecializationState,
}

enum CompilationOutcome {
    Translated(Vec<TranslatedShader>),
    Failed(ShaderCacheError),
    Cancelled,
}

/// Translation result waiting for the owning thread
struct ProgramCompilation {
    slot: ProgramSlot,
    stages: Vec<Option<CachedShaderStage>>,
    specialization: SpecializationState,
    outcome: CompilationOutcome,
}

/// Host program waiting for its link result
struct PendingValidation {
    slot: ProgramSlot,
    program: CachedShaderProgram,
    from_host_binary: bool,
}

/// Retranslate a cached program from its guest code and recorded state
pub fn translate_cached_program<T: ShaderTranslator>(
    translator: &T,
    stages: &[Option<CachedShaderStage>],
    specialization: &SpecializationState,
) -> Result<Vec<TranslatedShader>> {
    if specialization.is_compute() {
        let stage = stages.first().and_then(|s| s.as_ref()).ok_or_else(|| {
            ShaderCacheError::Translation("compute program has no stage".to_string())
        })?;
        let mut accessor = ReplayGpuAccessor::new(stage, specialization, ShaderStage::Compute);
        let decoded = translator.decode_compute_shader(&mut accessor)?;
        return Ok(vec![translator.translate(decoded, None)?]);
    }

    let mut vertex_a = match stages.get(VERTEX_A_SLOT).and_then(|s| s.as_ref()) {
        Some(stage) => {
            let mut accessor = ReplayGpuAccessor::new(stage, specialization, ShaderStage::Vertex);
            Some(translator.decode_graphics_shader(&mut accessor)?)
        }
        None => None,
    };

    let mut translated = Vec::new();
    for slot in VERTEX_B_SLOT..GRAPHICS_STAGE_SLOTS {
        let Some(stage) = stages.get(slot).and_then(|s| s.as_ref()) else {
            continue;
        };
        let shader_stage = ShaderStage::for_graphics_slot(slot);
        let mut accessor = ReplayGpuAccessor::new(stage, specialization, shader_stage);
        let decoded = translator.decode_graphics_shader(&mut accessor)?;
        let merge = if slot == VERTEX_B_SLOT { vertex_a.take() } else { None };
        translated.push(translator.translate(decoded, merge)?);
    }

    if translated.is_empty() {
        return Err(ShaderCacheError::Translation(
            "graphics program has no stages".to_string(),
        ));
    }
    Ok(translated)
}

/// Compile translated stages and create the host program
pub fn create_host_program(
    context: &mut dyn HostContext,
    shaders: &[TranslatedShader],
) -> HostProgramHandle {
    let handles: Vec<_> = shaders.iter().map(|s| context.compile_shader(s)).collect();
    let reflections: Vec<&ShaderReflection> = shaders.iter().map(|s| &s.reflection).collect();
    context.create_program(&handles, &reflections)
}

fn worker_loop<T: ShaderTranslator>(
    translator: &T,
    cancel: &AtomicBool,
    jobs: Receiver<TranslationJob>,
    done: Sender<ProgramCompilation>,
) {
    while let Ok(job) = jobs.recv() {
        let outcome = if cancel.load(Ordering::Relaxed) {
            CompilationOutcome::Cancelled
        } else {
            match translate_cached_program(translator, &job.stages, &job.specialization) {
                Ok(shaders) => CompilationOutcome::Translated(shaders),
                Err(e) => CompilationOutcome::Failed(e),
            }
        };

        let compilation = ProgramCompilation {
            slot: job.slot,
            stages: job.stages,
            specialization: job.specialization,
            outcome,
        };
        if done.send(compilation).is_err() {
            break;
        }
    }
}

/// Owning-thread side of a load pass
struct LoadDriver<'a> {
    context: &'a mut dyn HostContext,
    indexes: &'a mut ShaderIndexes,
    progress: &'a mut dyn FnMut(ShaderCacheState, usize, usize),
    cancel: &'a AtomicBool,
    jobs: Option<Sender<TranslationJob>>,
    done: Receiver<ProgramCompilation>,
    validation: VecDeque<PendingValidation>,
    pending_translations: usize,
    programs: Vec<Option<Arc<CachedShaderProgram>>>,
    summary: LoadSummary,
    completed: usize,
    guest_fallback: bool,
}

impl LoadDriver<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn slot_finished(&mut self) {
        self.completed += 1;
        (self.progress)(ShaderCacheState::Loading, self.completed, self.summary.total);
    }

    fn enqueue_translation(
        &mut self,
        slot: ProgramSlot,
        stages: Vec<Option<CachedShaderStage>>,
        specialization: SpecializationState,
    ) {
        self.guest_fallback = true;

        if self.cancelled() {
            self.slot_finished();
            return;
        }

        let job = TranslationJob {
            slot,
            stages,
            specialization,
        };
        let sent = self.jobs.as_ref().map(|jobs| jobs.send(job).is_ok()).unwrap_or(false);
        if sent {
            self.pending_translations += 1;
        } else {
            tracing::error!("Shader loader workers are gone, dropping slot {}", slot);
            self.summary.errors += 1;
            self.slot_finished();
        }
    }

    fn process_compilation(&mut self, compilation: ProgramCompilation) {
        self.pending_translations -= 1;

        match compilation.outcome {
            CompilationOutcome::Translated(shaders) => {
                let host_program = create_host_program(&mut *self.context, &shaders);
                self.validation.push_back(PendingValidation {
                    slot: compilation.slot,
                    program: CachedShaderProgram {
                        host_program,
                        specialization: compilation.specialization,
                        stages: compilation.stages,
                    },
                    from_host_binary: false,
                });
            }
            CompilationOutcome::Failed(e) => {
                tracing::error!("Failed to retranslate cached program {}: {}", compilation.slot, e);
                self.summary.errors += 1;
                self.slot_finished();
            }
            CompilationOutcome::Cancelled => self.slot_finished(),
        }
    }

    fn process_validation(&mut self, blocking: bool) {
        while let Some(front) = self.validation.front() {
            let status = self.context.check_program_link(front.program.host_program, blocking);
            // A blocking check that still reports pending counts as a failure
            if status == LinkStatus::Pending && !blocking {
                break;
            }

            let Some(PendingValidation {
                slot,
                program,
                from_host_binary,
            }) = self.validation.pop_front()
            else {
                break;
            };

            match (status, from_host_binary) {
                (LinkStatus::Success, _) => {
                    if from_host_binary {
                        self.summary.host_loaded += 1;
                    } else {
                        self.summary.guest_recompiled += 1;
                    }
                    let program = Arc::new(program);
                    self.indexes.add(program.clone());
                    if slot >= self.programs.len() {
                        self.programs.resize(slot + 1, None);
                    }
                    self.programs[slot] = Some(program);
                    self.slot_finished();
                }
                (_, true) => {
                    tracing::debug!("Host binary of slot {} was rejected, retranslating", slot);
                    self.enqueue_translation(slot, program.stages, program.specialization);
                }
                (_, false) => {
                    tracing::error!("{}", ShaderCacheError::LinkFailed { slot: Some(slot) });
                    self.summary.errors += 1;
                    self.slot_finished();
                }
            }
        }
    }

    /// Drain both queues, waiting for every outstanding job
    fn check_compilation_blocking(&mut self) {
        loop {
            self.process_validation(true);
            if self.pending_translations == 0 {
                break;
            }
            match self.done.recv() {
                Ok(compilation) => self.process_compilation(compilation),
                Err(_) => break,
            }
        }
    }
}

impl ProgramLoadSink for LoadDriver<'_> {
    fn is_cancelled(&self) -> bool {
        self.cancelled()
    }

    fn load_host_binary(
        &mut self,
        binary: &[u8],
        reflections: &[&ShaderReflection],
    ) -> Option<HostProgramHandle> {
        self.context
            .create_program_from_binary(binary, reflections)
            .filter(|h| !h.is_null())
    }

    fn queue_host_program(&mut self, slot: ProgramSlot, program: CachedShaderProgram) {
        self.validation.push_back(PendingValidation {
            slot,
            program,
            from_host_binary: true,
        });
    }

    fn queue_guest_program(
        &mut self,
        slot: ProgramSlot,
        stages: Vec<Option<CachedShaderStage>>,
        specialization: SpecializationState,
    ) {
        self.enqueue_translation(slot, stages, specialization);
    }

    fn check_compilation(&mut self) {
        while let Ok(compilation) = self.done.try_recv() {
            self.process_compilation(compilation);
        }
        self.process_validation(false);
    }
}

/// Loads a [`ProgramStore`] into [`ShaderIndexes`]
pub struct ParallelDiskCacheLoader<'a, T: ShaderTranslator> {
    store: &'a ProgramStore,
    translator: &'a T,
    context: &'a mut dyn HostContext,
    indexes: &'a mut ShaderIndexes,
    cancel: &'a AtomicBool,
    threads: usize,
}

impl<'a, T: ShaderTranslator> ParallelDiskCacheLoader<'a, T> {
    pub fn new(
        store: &'a ProgramStore,
        translator: &'a T,
        context: &'a mut dyn HostContext,
        indexes: &'a mut ShaderIndexes,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            store,
            translator,
            context,
            indexes,
            cancel,
            threads: DEFAULT_LOADER_THREADS,
        }
    }

    /// Number of translation worker threads
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Run the load pass, reporting progress through `progress`
    pub fn load(
        self,
        progress: &mut dyn FnMut(ShaderCacheState, usize, usize),
    ) -> Result<LoadSummary> {
        let Self {
            store,
            translator,
            context,
            indexes,
            cancel,
            threads,
        } = self;

        let total = store.program_count()?;
        progress(ShaderCacheState::Start, 0, total);
        tracing::info!("Loading {} cached shader programs with {} threads", total, threads);

        let (job_tx, job_rx) = channel::unbounded::<TranslationJob>();
        let (done_tx, done_rx) = channel::unbounded::<ProgramCompilation>();

        let scan = thread::scope(|scope| -> Result<_> {
            for i in 0..threads {
                let jobs = job_rx.clone();
                let done = done_tx.clone();
                thread::Builder::new()
                    .name(format!("shader-loader-{}", i))
                    .spawn_scoped(scope, move || worker_loop(translator, cancel, jobs, done))?;
            }
            drop(job_rx);
            drop(done_tx);

            let mut driver = LoadDriver {
                context: &mut *context,
                indexes,
                progress: &mut *progress,
                cancel,
                jobs: Some(job_tx),
                done: done_rx,
                validation: VecDeque::new(),
                pending_translations: 0,
                programs: vec![None; total],
                summary: LoadSummary {
                    total,
                    ..Default::default()
                },
                completed: 0,
                guest_fallback: false,
            };

            let scanned = store.load_shaders(&mut driver);
            driver.check_compilation_blocking();
            driver.jobs = None;
            scanned?;

            Ok((driver.programs, driver.summary, driver.completed, driver.guest_fallback))
        })?;
        let (programs, mut summary, completed, guest_fallback) = scan;

        summary.cancelled = cancel.load(Ordering::Relaxed);

        if guest_fallback && !summary.cancelled && store.host_key().is_some() {
            store.clear_host_cache()?;
            for (slot, program) in programs.iter().enumerate() {
                if cancel.load(Ordering::Relaxed) {
                    summary.cancelled = true;
                    break;
                }
                let Some(program) = program else {
                    continue;
                };
                let binary = context.program_binary(program.host_program);
                if !binary.is_empty() {
                    store.add_host_shader(&binary, Some(slot))?;
                }
            }
            summary.host_cache_rewritten = !summary.cancelled;
        }

        progress(ShaderCacheState::Loaded, completed, total);
        tracing::info!(
            "Shader cache loaded: {} from host binaries, {} retranslated, {} failed{}",
            summary.host_loaded,
            summary.guest_recompiled,
            summary.errors,
            if summary.cancelled { " (cancelled)" } else { "" }
        );

        Ok(summary)
    }
}
