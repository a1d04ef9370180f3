//! Shared program store and host program store
//!
//! `shared.toc` maps each program slot to an offset into `shared.data`, where
//! a compressed record lists the program's stages (as guest code ids plus
//! reflection) and its specialization state. Guest bytes themselves live in
//! the [`GuestCodeStore`].
//!
//! Host binaries are kept per (API, vendor) in `{api}_{vendor}.toc` and
//! `.data`, indexed by the same program slot. The host TOC header carries the
//! codegen version; binaries from another version are never handed out.

use crate::backend::{HostStoreKey, CODEGEN_VERSION};
use crate::codec::{BinaryReader, BinaryWriter, CompressionMethod};
use crate::guest_store::{
    GuestCodeStore, GuestFiles, GuestStoreStats, GUEST_DATA_FILE, GUEST_TOC_FILE,
};
use crate::specialization::SpecializationState;
use crate::toc::{self, TocHeader, HOST_TOC_MAGIC, SHARED_TOC_MAGIC, TOC_HEADER_SIZE};
use crate::types::{
    stage_reflections, CachedShaderProgram, CachedShaderStage, GuestCodeId, HostProgramHandle,
    ProgramSlot, ShaderReflection, GRAPHICS_STAGE_SLOTS,
};
use bytemuck::{Pod, Zeroable};
use oc_core::{FormatError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SHARED_TOC_FILE: &str = "shared.toc";
pub const SHARED_DATA_FILE: &str = "shared.data";

const SHARED_ENTRY_SIZE: usize = std::mem::size_of::<u64>();
const HOST_ENTRY_SIZE: usize = std::mem::size_of::<HostTocEntry>();

const PROGRAM_FLAG_COMPUTE: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ProgramRecordHeader {
    stages_bit_mask: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct StageRecord {
    guest_code_id: GuestCodeId,
    has_reflection: u32,
}

/// Host TOC entry. A zero size marks an empty slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct HostTocEntry {
    pub offset: u64,
    pub size: u32,
    pub reserved: u32,
}

/// Receives programs while the shared store is scanned
pub trait ProgramLoadSink {
    /// Checked between slots; the scan stops once this returns true
    fn is_cancelled(&self) -> bool;

    /// Hand a stored host binary to the graphics backend
    fn load_host_binary(
        &mut self,
        binary: &[u8],
        reflections: &[&ShaderReflection],
    ) -> Option<HostProgramHandle>;

    /// A program whose host binary was accepted and now awaits link validation
    fn queue_host_program(&mut self, slot: ProgramSlot, program: CachedShaderProgram);

    /// A program that has to be retranslated from guest code
    fn queue_guest_program(
        &mut self,
        slot: ProgramSlot,
        stages: Vec<Option<CachedShaderStage>>,
        specialization: SpecializationState,
    );

    /// Called after every slot to let the sink make progress without blocking
    fn check_compilation(&mut self);
}

/// Open host TOC and data files
pub struct HostFiles {
    toc: File,
    data: File,
}

/// Summary of one host store found in a cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStoreSummary {
    pub key: HostStoreKey,
    /// `None` if the header is missing or invalid
    pub codegen_version: Option<u32>,
    pub entry_count: usize,
}

/// Result of [`ProgramStore::verify`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreReport {
    /// Slots in the shared TOC
    pub program_count: usize,
    /// Slots whose record and guest code could be read back
    pub readable: usize,
    /// Readable slots with a host binary under the current codegen version
    pub host_binaries: usize,
    pub guest_entries: usize,
}

/// Persistent program store rooted at a cache directory
pub struct ProgramStore {
    base: PathBuf,
    host: Option<HostStoreKey>,
    codegen_version: u32,
    guest: Mutex<GuestCodeStore>,
}

impl ProgramStore {
    /// Store without host binaries
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            guest: Mutex::new(GuestCodeStore::new(&base)),
            base,
            host: None,
            codegen_version: CODEGEN_VERSION,
        }
    }

    /// Store that also keeps host binaries for `key`
    pub fn with_host<P: AsRef<Path>>(base: P, key: HostStoreKey) -> Self {
        Self {
            host: Some(key),
            ..Self::new(base)
        }
    }

    /// Override the codegen version host binaries are written and read with
    pub fn with_codegen_version(mut self, version: u32) -> Self {
        self.codegen_version = version;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn host_key(&self) -> Option<&HostStoreKey> {
        self.host.as_ref()
    }

    pub fn guest_stats(&self) -> GuestStoreStats {
        self.guest.lock().stats()
    }

    pub fn guest_entry_count(&self) -> Result<usize> {
        self.guest.lock().entry_count()
    }

    fn shared_paths(&self) -> (PathBuf, PathBuf) {
        (self.base.join(SHARED_TOC_FILE), self.base.join(SHARED_DATA_FILE))
    }

    fn host_paths(&self) -> Option<(PathBuf, PathBuf)> {
        self.host.as_ref().map(|key| host_paths(&self.base, key))
    }

    /// Number of program slots in the shared TOC
    pub fn program_count(&self) -> Result<usize> {
        let (toc_path, _) = self.shared_paths();
        if !toc_path.exists() {
            return Ok(0);
        }
        let mut file = File::open(toc_path)?;
        if toc::read_valid_header(&mut file, SHARED_TOC_MAGIC)?.is_none() {
            return Ok(0);
        }
        Ok(toc::entry_count(&file, SHARED_ENTRY_SIZE)?)
    }

    /// Open the shared store for appending. It starts over when its header is
    /// invalid or when `guest_recreated` says its guest code ids are stale.
    fn open_shared_for_write(&self, guest_recreated: bool) -> Result<(File, File)> {
        std::fs::create_dir_all(&self.base)?;
        let (toc_path, data_path) = self.shared_paths();
        let mut toc_file = open_read_write(&toc_path)?;
        let data_file = open_read_write(&data_path)?;

        let valid = toc::read_valid_header(&mut toc_file, SHARED_TOC_MAGIC)?.is_some();
        if !valid || guest_recreated {
            if !valid && toc_file.metadata()?.len() != 0 {
                tracing::warn!("Shared program TOC is invalid, recreating program store");
            } else if valid && toc::entry_count(&toc_file, SHARED_ENTRY_SIZE)? != 0 {
                tracing::warn!("Guest code store was recreated, discarding stored programs");
            }
            toc_file.set_len(0)?;
            data_file.set_len(0)?;
            toc::write_header(&mut toc_file, &TocHeader::new(SHARED_TOC_MAGIC))?;
            // Host slots refer to the old numbering
            self.clear_host_cache()?;
        }

        Ok((toc_file, data_file))
    }

    fn open_shared_read_only(&self) -> Result<Option<(File, File)>> {
        let (toc_path, data_path) = self.shared_paths();
        if !toc_path.exists() || !data_path.exists() {
            return Ok(None);
        }

        let mut toc_file = File::open(toc_path)?;
        if toc::read_valid_header(&mut toc_file, SHARED_TOC_MAGIC)?.is_none() {
            tracing::warn!("Shared program TOC is invalid, ignoring program store");
            return Ok(None);
        }
        Ok(Some((toc_file, File::open(data_path)?)))
    }

    /// Persist a program and, if given, its host binary. Returns the new slot.
    pub fn add_shader(
        &self,
        program: &CachedShaderProgram,
        host_code: &[u8],
    ) -> Result<ProgramSlot> {
        let mut guest_ids = Vec::with_capacity(program.stages.len());
        let guest_recreated = {
            let mut guest = self.guest.lock();
            for stage in program.stages.iter().flatten() {
                guest_ids.push(guest.add_shader(&stage.code, &stage.cb1_data)?);
            }
            guest.take_recreated()
        };

        let (mut toc_file, mut data_file) = self.open_shared_for_write(guest_recreated)?;
        let slot = toc::entry_count(&toc_file, SHARED_ENTRY_SIZE)?;

        let offset = data_file.seek(SeekFrom::End(0))?;
        {
            let mut writer = BinaryWriter::new(BufWriter::new(&mut data_file));
            writer.begin_compression(CompressionMethod::Deflate)?;
            writer.write(&ProgramRecordHeader {
                stages_bit_mask: program.stages_bit_mask(),
                flags: if program.is_compute() { PROGRAM_FLAG_COMPUTE } else { 0 },
            })?;

            for (stage, guest_code_id) in program.stages.iter().flatten().zip(&guest_ids) {
                writer.write(&StageRecord {
                    guest_code_id: *guest_code_id,
                    has_reflection: stage.reflection.is_some() as u32,
                })?;
                if let Some(reflection) = &stage.reflection {
                    reflection.write(&mut writer)?;
                }
            }

            program.specialization.write(&mut writer)?;
            writer.into_inner()?.flush()?;
        }

        toc_file.seek(SeekFrom::Start(toc::entry_position(slot, SHARED_ENTRY_SIZE)))?;
        toc_file.write_all(&offset.to_le_bytes())?;

        if !host_code.is_empty() {
            self.add_host_shader(host_code, Some(slot))?;
        }

        tracing::debug!("Stored program slot {} ({} stages)", slot, guest_ids.len());
        Ok(slot)
    }

    fn open_host_for_write(&self) -> Result<Option<(File, File)>> {
        let Some((toc_path, data_path)) = self.host_paths() else {
            return Ok(None);
        };
        std::fs::create_dir_all(&self.base)?;
        let mut toc_file = open_read_write(&toc_path)?;
        let data_file = open_read_write(&data_path)?;

        let current = toc::read_valid_header(&mut toc_file, HOST_TOC_MAGIC)?
            .filter(|h| h.codegen_version == self.codegen_version);
        if current.is_none() {
            toc_file.set_len(0)?;
            data_file.set_len(0)?;
            let mut header = TocHeader::new(HOST_TOC_MAGIC);
            header.codegen_version = self.codegen_version;
            toc::write_header(&mut toc_file, &header)?;
        }

        Ok(Some((toc_file, data_file)))
    }

    /// Open the host store for reading.
    ///
    /// Returns `None` when there is no host store, or when it was written by
    /// a different codegen version.
    pub fn open_host_read_only(&self) -> Result<Option<HostFiles>> {
        let Some((toc_path, data_path)) = self.host_paths() else {
            return Ok(None);
        };
        if !toc_path.exists() || !data_path.exists() {
            return Ok(None);
        }

        let mut toc_file = File::open(toc_path)?;
        let Some(header) = toc::read_valid_header(&mut toc_file, HOST_TOC_MAGIC)? else {
            return Ok(None);
        };
        if header.codegen_version != self.codegen_version {
            tracing::info!(
                "Host shader cache codegen version {} does not match {}, ignoring host binaries",
                header.codegen_version,
                self.codegen_version
            );
            return Ok(None);
        }

        Ok(Some(HostFiles {
            toc: toc_file,
            data: File::open(data_path)?,
        }))
    }

    /// Store a host binary, either appended as the next slot or written in
    /// place at `slot`. Skipped slots are left empty.
    pub fn add_host_shader(&self, binary: &[u8], slot: Option<ProgramSlot>) -> Result<()> {
        let Some((mut toc_file, mut data_file)) = self.open_host_for_write()? else {
            return Ok(());
        };

        let count = toc::entry_count(&toc_file, HOST_ENTRY_SIZE)?;
        let index = slot.unwrap_or(count);

        let offset = data_file.seek(SeekFrom::End(0))?;
        data_file.write_all(binary)?;

        if index > count {
            toc_file.seek(SeekFrom::Start(toc::entry_position(count, HOST_ENTRY_SIZE)))?;
            let padding = vec![0u8; (index - count) * HOST_ENTRY_SIZE];
            toc_file.write_all(&padding)?;
        }

        let entry = HostTocEntry {
            offset,
            size: binary.len() as u32,
            reserved: 0,
        };
        toc_file.seek(SeekFrom::Start(toc::entry_position(index, HOST_ENTRY_SIZE)))?;
        toc_file.write_all(bytemuck::bytes_of(&entry))?;
        Ok(())
    }

    /// Read the host binary of `slot`, if one is stored
    pub fn read_host_code(
        &self,
        files: &mut HostFiles,
        slot: ProgramSlot,
    ) -> Result<Option<Vec<u8>>> {
        if slot >= toc::entry_count(&files.toc, HOST_ENTRY_SIZE)? {
            return Ok(None);
        }

        let mut entry = HostTocEntry::zeroed();
        files.toc.seek(SeekFrom::Start(toc::entry_position(slot, HOST_ENTRY_SIZE)))?;
        files.toc.read_exact(bytemuck::bytes_of_mut(&mut entry))?;
        if entry.size == 0 {
            return Ok(None);
        }

        let data_len = files.data.metadata()?.len();
        let end = entry.offset.checked_add(entry.size as u64);
        if end.map_or(true, |end| end > data_len) {
            tracing::warn!("Host binary of slot {} extends past the end of the data file", slot);
            return Ok(None);
        }

        let mut binary = vec![0u8; entry.size as usize];
        files.data.seek(SeekFrom::Start(entry.offset))?;
        files.data.read_exact(&mut binary)?;
        Ok(Some(binary))
    }

    /// Truncate the host TOC and data files
    pub fn clear_host_cache(&self) -> Result<()> {
        let Some((toc_path, data_path)) = self.host_paths() else {
            return Ok(());
        };
        for path in [toc_path, data_path] {
            if path.exists() {
                OpenOptions::new().write(true).open(&path)?.set_len(0)?;
            }
        }
        tracing::info!("Cleared host shader cache in {}", self.base.display());
        Ok(())
    }

    fn read_program_record(
        guest: &mut GuestCodeStore,
        guest_files: &mut GuestFiles,
        data: &mut File,
        offset: u64,
    ) -> Result<(Vec<Option<CachedShaderStage>>, SpecializationState)> {
        data.seek(SeekFrom::Start(offset))?;
        let mut reader = BinaryReader::new(BufReader::new(&mut *data));
        reader.begin_compression()?;

        let header: ProgramRecordHeader = reader.read("program record header")?;
        let stage_count = if header.flags & PROGRAM_FLAG_COMPUTE != 0 {
            1
        } else {
            GRAPHICS_STAGE_SLOTS
        };
        if header.stages_bit_mask >> stage_count != 0 {
            return Err(FormatError::CorruptRecord(format!(
                "stage mask {:#x} has bits past {} stages",
                header.stages_bit_mask, stage_count
            ))
            .into());
        }

        let mut stages = vec![None; stage_count];
        for (index, slot) in stages.iter_mut().enumerate() {
            if header.stages_bit_mask & (1 << index) == 0 {
                continue;
            }

            let record: StageRecord = reader.read("stage record")?;
            let reflection = if record.has_reflection != 0 {
                Some(ShaderReflection::read(&mut reader)?)
            } else {
                None
            };
            let code = guest.load_shader_from(guest_files, record.guest_code_id)?;
            *slot = Some(CachedShaderStage {
                reflection,
                code: code.code,
                cb1_data: code.cb1_data,
            });
        }

        let specialization = SpecializationState::read(&mut reader)?;
        reader.end_compression()?;
        Ok((stages, specialization))
    }

    /// Scan every stored program in slot order and hand it to `sink`.
    ///
    /// Programs with a host binary under the current codegen version are
    /// offered to the backend first; everything else is queued for guest
    /// retranslation. The scan stops at the first unreadable record or when
    /// the sink is cancelled. The guest and shared stores are only read.
    pub fn load_shaders(&self, sink: &mut dyn ProgramLoadSink) -> Result<()> {
        let Some((mut toc_file, mut data_file)) = self.open_shared_read_only()? else {
            return Ok(());
        };

        let mut guest = self.guest.lock();
        let Some(mut guest_files) = guest.open_read_only()? else {
            tracing::warn!("Program store has no usable guest code store");
            return Ok(());
        };
        let mut host_files = self.open_host_read_only()?;

        let count = toc::entry_count(&toc_file, SHARED_ENTRY_SIZE)?;
        let mut offsets = vec![0u8; count * SHARED_ENTRY_SIZE];
        toc_file.seek(SeekFrom::Start(TOC_HEADER_SIZE))?;
        toc_file.read_exact(&mut offsets)?;

        for (slot, raw) in offsets.chunks_exact(SHARED_ENTRY_SIZE).enumerate() {
            if sink.is_cancelled() {
                tracing::info!("Shader cache load cancelled at slot {}", slot);
                break;
            }

            let mut offset = [0u8; SHARED_ENTRY_SIZE];
            offset.copy_from_slice(raw);
            let record = Self::read_program_record(
                &mut guest,
                &mut guest_files,
                &mut data_file,
                u64::from_le_bytes(offset),
            );
            let (stages, specialization) = match record {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Stopping shader cache load at slot {}: {}", slot, e);
                    break;
                }
            };

            let binary = match host_files.as_mut() {
                Some(files) => self.read_host_code(files, slot)?,
                None => None,
            };

            let handle = binary
                .and_then(|binary| sink.load_host_binary(&binary, &stage_reflections(&stages)));

            match handle {
                Some(host_program) => sink.queue_host_program(
                    slot,
                    CachedShaderProgram {
                        host_program,
                        specialization,
                        stages,
                    },
                ),
                None => sink.queue_guest_program(slot, stages, specialization),
            }

            sink.check_compilation();
        }

        guest.clear_memory_cache();
        Ok(())
    }

    /// Read back every stored program without touching the backend
    pub fn verify(&self) -> Result<StoreReport> {
        struct CountingSink {
            readable: usize,
            host_binaries: usize,
        }

        impl ProgramLoadSink for CountingSink {
            fn is_cancelled(&self) -> bool {
                false
            }

            fn load_host_binary(
                &mut self,
                _binary: &[u8],
                _reflections: &[&ShaderReflection],
            ) -> Option<HostProgramHandle> {
                self.host_binaries += 1;
                None
            }

            fn queue_host_program(&mut self, _slot: ProgramSlot, _program: CachedShaderProgram) {}

            fn queue_guest_program(
                &mut self,
                _slot: ProgramSlot,
                _stages: Vec<Option<CachedShaderStage>>,
                _specialization: SpecializationState,
            ) {
                self.readable += 1;
            }

            fn check_compilation(&mut self) {}
        }

        let mut sink = CountingSink {
            readable: 0,
            host_binaries: 0,
        };
        self.load_shaders(&mut sink)?;

        Ok(StoreReport {
            program_count: self.program_count()?,
            readable: sink.readable,
            host_binaries: sink.host_binaries,
            guest_entries: self.guest_entry_count()?,
        })
    }
}

fn open_read_write(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

fn host_paths(base: &Path, key: &HostStoreKey) -> (PathBuf, PathBuf) {
    let stem = key.file_stem();
    (
        base.join(format!("{}.toc", stem)),
        base.join(format!("{}.data", stem)),
    )
}

/// Host stores present in `base`
pub fn list_host_stores(base: &Path) -> Result<Vec<HostStoreSummary>> {
    let mut stores = Vec::new();
    if !base.exists() {
        return Ok(stores);
    }

    for entry in std::fs::read_dir(base)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == GUEST_TOC_FILE || name == SHARED_TOC_FILE {
            continue;
        }
        let stem = name.strip_suffix(".toc");
        let Some((api, vendor)) = stem.and_then(|stem| stem.split_once('_')) else {
            continue;
        };

        let mut file = File::open(&path)?;
        let header = toc::read_valid_header(&mut file, HOST_TOC_MAGIC)?;
        stores.push(HostStoreSummary {
            key: HostStoreKey::new(api, vendor),
            codegen_version: header.map(|h| h.codegen_version),
            entry_count: toc::entry_count(&file, HOST_ENTRY_SIZE)?,
        });
    }

    stores.sort_by(|a, b| a.key.file_stem().cmp(&b.key.file_stem()));
    Ok(stores)
}

/// Delete every host store in `base`, leaving guest and shared data intact.
/// Returns the number of stores removed.
pub fn clear_all_host_stores(base: &Path) -> Result<usize> {
    let stores = list_host_stores(base)?;
    for store in &stores {
        let (toc_path, data_path) = host_paths(base, &store.key);
        for path in [toc_path, data_path] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        tracing::info!("Removed host shader cache {}", store.key.file_stem());
    }
    Ok(stores.len())
}

/// Whether `base` holds a guest store
pub fn has_guest_store(base: &Path) -> bool {
    base.join(GUEST_TOC_FILE).exists() && base.join(GUEST_DATA_FILE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specialization::{ComputeStaticState, GraphicsStaticState};
    use crate::types::{ShaderStage, VERTEX_A_SLOT};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Sink {
        accept_binaries: bool,
        binaries_offered: Vec<Vec<u8>>,
        host: Vec<(ProgramSlot, CachedShaderProgram)>,
        guest: Vec<(ProgramSlot, Vec<Option<CachedShaderStage>>, SpecializationState)>,
    }

    impl ProgramLoadSink for Sink {
        fn is_cancelled(&self) -> bool {
            false
        }

        fn load_host_binary(
            &mut self,
            binary: &[u8],
            _reflections: &[&ShaderReflection],
        ) -> Option<HostProgramHandle> {
            self.binaries_offered.push(binary.to_vec());
            let handle = HostProgramHandle(100 + self.binaries_offered.len() as u64);
            self.accept_binaries.then_some(handle)
        }

        fn queue_host_program(&mut self, slot: ProgramSlot, program: CachedShaderProgram) {
            self.host.push((slot, program));
        }

        fn queue_guest_program(
            &mut self,
            slot: ProgramSlot,
            stages: Vec<Option<CachedShaderStage>>,
            specialization: SpecializationState,
        ) {
            self.guest.push((slot, stages, specialization));
        }

        fn check_compilation(&mut self) {}
    }

    fn stage(code: &[u8], stage: Option<ShaderStage>) -> Option<CachedShaderStage> {
        Some(CachedShaderStage {
            reflection: stage.map(ShaderReflection::new),
            code: Arc::from(code),
            cb1_data: Arc::from(&[4u8, 0, 0, 0][..]),
        })
    }

    fn graphics_program(fragment: &[u8]) -> CachedShaderProgram {
        let mut stages = vec![None; GRAPHICS_STAGE_SLOTS];
        stages[VERTEX_A_SLOT] = stage(b"vertex a", None);
        stages[1] = stage(b"vertex b", Some(ShaderStage::Vertex));
        stages[5] = stage(fragment, Some(ShaderStage::Fragment));

        let mut gfx = GraphicsStaticState::default();
        gfx.topology = 3;
        CachedShaderProgram {
            host_program: HostProgramHandle::NULL,
            specialization: SpecializationState::new_graphics(gfx),
            stages,
        }
    }

    fn key() -> HostStoreKey {
        HostStoreKey::new("opengl", "test")
    }

    #[test]
    fn test_add_and_load_programs() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::with_host(dir.path(), key());

        let graphics = graphics_program(b"fragment");
        let compute = CachedShaderProgram {
            host_program: HostProgramHandle::NULL,
            specialization: SpecializationState::new_compute(ComputeStaticState {
                local_size_x: 32,
                ..Default::default()
            }),
            stages: vec![stage(b"compute", Some(ShaderStage::Compute))],
        };

        assert_eq!(store.add_shader(&graphics, b"host binary").unwrap(), 0);
        assert_eq!(store.add_shader(&compute, &[]).unwrap(), 1);
        assert_eq!(store.program_count().unwrap(), 2);
        assert_eq!(store.guest_entry_count().unwrap(), 4);

        let reopened = ProgramStore::with_host(dir.path(), key());
        let mut sink = Sink {
            accept_binaries: true,
            ..Default::default()
        };
        reopened.load_shaders(&mut sink).unwrap();

        assert_eq!(sink.binaries_offered, vec![b"host binary".to_vec()]);
        assert_eq!(sink.host.len(), 1);
        let (slot, program) = &sink.host[0];
        assert_eq!(*slot, 0);
        assert_eq!(program.host_program, HostProgramHandle(101));
        assert_eq!(program.stages, graphics.stages);
        assert_eq!(program.specialization, graphics.specialization);

        assert_eq!(sink.guest.len(), 1);
        let (slot, stages, spec) = &sink.guest[0];
        assert_eq!(*slot, 1);
        assert_eq!(stages, &compute.stages);
        assert_eq!(spec.compute_state().local_size_x, 32);
    }

    #[test]
    fn test_host_slots_written_in_place() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::with_host(dir.path(), key());

        store.add_host_shader(b"slot two", Some(2)).unwrap();
        store.add_host_shader(b"slot three", None).unwrap();
        store.add_host_shader(b"slot zero", Some(0)).unwrap();

        let mut files = store.open_host_read_only().unwrap().unwrap();
        assert_eq!(store.read_host_code(&mut files, 0).unwrap().unwrap(), b"slot zero");
        assert_eq!(store.read_host_code(&mut files, 1).unwrap(), None);
        assert_eq!(store.read_host_code(&mut files, 2).unwrap().unwrap(), b"slot two");
        assert_eq!(store.read_host_code(&mut files, 3).unwrap().unwrap(), b"slot three");
        assert_eq!(store.read_host_code(&mut files, 4).unwrap(), None);
    }

    #[test]
    fn test_codegen_mismatch_hides_host_binaries() {
        let dir = TempDir::new().unwrap();
        let old = ProgramStore::with_host(dir.path(), key()).with_codegen_version(1);
        old.add_shader(&graphics_program(b"fragment"), b"old binary").unwrap();

        let new = ProgramStore::with_host(dir.path(), key()).with_codegen_version(2);
        assert!(new.open_host_read_only().unwrap().is_none());

        let mut sink = Sink {
            accept_binaries: true,
            ..Default::default()
        };
        new.load_shaders(&mut sink).unwrap();
        assert!(sink.binaries_offered.is_empty());
        assert_eq!(sink.guest.len(), 1);

        // Writing under the new version starts the host store over
        new.add_host_shader(b"new binary", Some(0)).unwrap();
        let mut files = new.open_host_read_only().unwrap().unwrap();
        assert_eq!(new.read_host_code(&mut files, 0).unwrap().unwrap(), b"new binary");
    }

    #[test]
    fn test_clear_host_cache_keeps_programs() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::with_host(dir.path(), key());
        store.add_shader(&graphics_program(b"fragment"), b"binary").unwrap();

        store.clear_host_cache().unwrap();
        assert!(store.open_host_read_only().unwrap().is_none());

        let report = store.verify().unwrap();
        assert_eq!(report.program_count, 1);
        assert_eq!(report.readable, 1);
        assert_eq!(report.host_binaries, 0);
        assert_eq!(report.guest_entries, 3);
    }

    #[test]
    fn test_list_and_clear_host_stores() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::with_host(dir.path(), key());
        store.add_shader(&graphics_program(b"fragment"), b"binary").unwrap();

        let stores = list_host_stores(dir.path()).unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].key, key());
        assert_eq!(stores[0].codegen_version, Some(CODEGEN_VERSION));
        assert_eq!(stores[0].entry_count, 1);

        assert_eq!(clear_all_host_stores(dir.path()).unwrap(), 1);
        assert!(list_host_stores(dir.path()).unwrap().is_empty());
        assert!(has_guest_store(dir.path()));
        assert_eq!(store.program_count().unwrap(), 1);
    }

    #[test]
    fn test_host_entry_past_end_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::with_host(dir.path(), key());
        store.add_host_shader(b"first", Some(0)).unwrap();
        store.add_host_shader(b"second", Some(1)).unwrap();

        let (toc_path, _) = host_paths(dir.path(), &key());
        let mut bytes = std::fs::read(&toc_path).unwrap();
        let entry = TOC_HEADER_SIZE as usize;
        bytes[entry..entry + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&toc_path, &bytes).unwrap();

        let mut files = store.open_host_read_only().unwrap().unwrap();
        assert_eq!(store.read_host_code(&mut files, 0).unwrap(), None);
        assert_eq!(store.read_host_code(&mut files, 1).unwrap().unwrap(), b"second");
    }

    #[test]
    fn test_recreated_guest_store_discards_programs() {
        let dir = TempDir::new().unwrap();
        let store = ProgramStore::with_host(dir.path(), key());
        store.add_shader(&graphics_program(b"old fragment"), b"old binary").unwrap();

        std::fs::write(dir.path().join(GUEST_TOC_FILE), b"garbage!").unwrap();

        let store = ProgramStore::with_host(dir.path(), key());
        let new = graphics_program(b"new fragment");
        assert_eq!(store.add_shader(&new, b"new binary").unwrap(), 0);
        assert_eq!(store.program_count().unwrap(), 1);

        let mut sink = Sink {
            accept_binaries: true,
            ..Default::default()
        };
        store.load_shaders(&mut sink).unwrap();
        assert_eq!(sink.binaries_offered, vec![b"new binary".to_vec()]);
        assert_eq!(sink.host.len(), 1);
        assert_eq!(sink.host[0].0, 0);
        assert_eq!(sink.host[0].1.stages, new.stages);
        assert!(sink.guest.is_empty());
    }
}
