//! Guest code store
//!
//! Append-only store of raw guest shader code plus the constant buffer 1
//! bytes each translation read. Entries are deduplicated by hash, sizes and
//! full byte comparison, and addressed by their sequential index.
//!
//! `guest.toc` holds a [`TocHeader`] followed by fixed [`GuestTocEntry`]
//! records; `guest.data` holds, per entry, the raw constant buffer bytes
//! followed by a deflate section with the code.

use crate::codec::{BinaryReader, BinaryWriter, CompressionMethod};
use crate::hash::guest_code_hash;
use crate::toc::{self, TocHeader, GUEST_TOC_MAGIC, TOC_HEADER_SIZE};
use crate::types::GuestCodeId;
use bytemuck::{Pod, Zeroable};
use oc_core::{FormatError, Result, ShaderCacheError};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const GUEST_TOC_FILE: &str = "guest.toc";
pub const GUEST_DATA_FILE: &str = "guest.data";

/// Fixed-size TOC record describing one guest code entry
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GuestTocEntry {
    pub offset: u32,
    pub code_size: u32,
    pub cb1_size: u32,
    pub hash: u32,
}

const ENTRY_SIZE: usize = std::mem::size_of::<GuestTocEntry>();

/// Decompressed guest code entry
#[derive(Debug, Clone, PartialEq)]
pub struct GuestCode {
    pub code: Arc<[u8]>,
    pub cb1_data: Arc<[u8]>,
}

/// Counters for observing store behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestStoreStats {
    /// Full TOC rescans caused by a modification count mismatch
    pub toc_scans: u64,
    /// Entries read and decompressed from the data file
    pub data_reads: u64,
}

/// Open TOC and data files of the guest store
pub struct GuestFiles {
    toc: File,
    data: File,
}

impl GuestFiles {
    pub fn entry_count(&self) -> Result<usize> {
        Ok(toc::entry_count(&self.toc, ENTRY_SIZE)?)
    }
}

/// Guest code store rooted at a cache directory
pub struct GuestCodeStore {
    base: PathBuf,
    /// Entries as of `last_modification_count`
    entries: Vec<GuestTocEntry>,
    /// Hash -> entry ids
    toc_index: HashMap<u32, Vec<GuestCodeId>>,
    /// Modification count the in-memory index was built from
    last_modification_count: Option<u32>,
    /// Per-session memo of decompressed entries, released by `clear_memory_cache`
    memo: Vec<Option<GuestCode>>,
    /// Set when the files were started over since the last `take_recreated`
    recreated: bool,
    stats: GuestStoreStats,
}

impl GuestCodeStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            entries: Vec::new(),
            toc_index: HashMap::new(),
            last_modification_count: None,
            memo: Vec::new(),
            recreated: false,
            stats: GuestStoreStats::default(),
        }
    }

    pub fn stats(&self) -> GuestStoreStats {
        self.stats
    }

    /// Whether the store was recreated since the last call.
    ///
    /// Ids handed out before a recreation no longer name the same code.
    pub fn take_recreated(&mut self) -> bool {
        std::mem::take(&mut self.recreated)
    }

    fn toc_path(&self) -> PathBuf {
        self.base.join(GUEST_TOC_FILE)
    }

    fn data_path(&self) -> PathBuf {
        self.base.join(GUEST_DATA_FILE)
    }

    /// Open both files for appending, recreating them if the TOC header is
    /// missing or invalid
    fn open_for_write(&mut self) -> Result<(GuestFiles, TocHeader)> {
        std::fs::create_dir_all(&self.base)?;

        let open = |path: PathBuf| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
        };
        let mut files = GuestFiles {
            toc: open(self.toc_path())?,
            data: open(self.data_path())?,
        };

        let header = match toc::read_valid_header(&mut files.toc, GUEST_TOC_MAGIC)? {
            Some(header) => header,
            None => {
                if files.toc.metadata()?.len() != 0 {
                    tracing::warn!("Guest code TOC is invalid, recreating guest store");
                }
                files.toc.set_len(0)?;
                files.data.set_len(0)?;
                let header = TocHeader::new(GUEST_TOC_MAGIC);
                toc::write_header(&mut files.toc, &header)?;
                self.reset_index();
                self.recreated = true;
                header
            }
        };

        Ok((files, header))
    }

    /// Open both files read-only.
    ///
    /// Returns `None` if the store does not exist or its header is invalid.
    pub fn open_read_only(&self) -> Result<Option<GuestFiles>> {
        let (toc_path, data_path) = (self.toc_path(), self.data_path());
        if !toc_path.exists() || !data_path.exists() {
            return Ok(None);
        }

        let mut toc = File::open(toc_path)?;
        if toc::read_valid_header(&mut toc, GUEST_TOC_MAGIC)?.is_none() {
            tracing::warn!("Guest code TOC is invalid, ignoring guest store");
            return Ok(None);
        }

        Ok(Some(GuestFiles {
            toc,
            data: File::open(data_path)?,
        }))
    }

    fn reset_index(&mut self) {
        self.entries.clear();
        self.toc_index.clear();
        self.memo.clear();
        self.last_modification_count = None;
    }

    /// Rebuild the in-memory index from the TOC file
    fn rebuild_index(&mut self, toc: &mut File, modification_count: u32) -> Result<()> {
        self.entries.clear();
        self.toc_index.clear();

        toc.seek(SeekFrom::Start(TOC_HEADER_SIZE))?;
        let mut reader = BinaryReader::new(BufReader::new(&mut *toc));
        while let Some(entry) = reader.try_read::<GuestTocEntry>()? {
            let id = self.entries.len() as GuestCodeId;
            self.toc_index.entry(entry.hash).or_default().push(id);
            self.entries.push(entry);
        }

        self.last_modification_count = Some(modification_count);
        self.stats.toc_scans += 1;
        Ok(())
    }

    fn read_entry(&mut self, data: &mut File, entry: &GuestTocEntry) -> Result<GuestCode> {
        let data_len = data.metadata()?.len();
        if entry.offset as u64 + entry.cb1_size as u64 > data_len {
            return Err(FormatError::CorruptRecord(format!(
                "guest entry at {:#x} with {} cb1 bytes overruns {} byte data file",
                entry.offset, entry.cb1_size, data_len
            ))
            .into());
        }

        data.seek(SeekFrom::Start(entry.offset as u64))?;
        let mut reader = BinaryReader::new(BufReader::new(&mut *data));

        let cb1_data = reader.read_bytes(entry.cb1_size as usize, "guest cb1 data")?;
        reader.begin_compression()?;
        let code = reader.read_bytes(entry.code_size as usize, "guest code")?;
        reader.end_compression()?;

        self.stats.data_reads += 1;
        Ok(GuestCode {
            code: Arc::from(code),
            cb1_data: Arc::from(cb1_data),
        })
    }

    /// Add guest code, returning the id of an identical existing entry if
    /// there is one
    pub fn add_shader(&mut self, code: &[u8], cb1_data: &[u8]) -> Result<GuestCodeId> {
        let (mut files, mut header) = self.open_for_write()?;

        if self.last_modification_count != Some(header.modification_count) {
            self.rebuild_index(&mut files.toc, header.modification_count)?;
        }

        let hash = guest_code_hash(code, cb1_data);

        let candidates: Vec<GuestCodeId> = self
            .toc_index
            .get(&hash)
            .map(|ids| ids.to_vec())
            .unwrap_or_default();
        for id in candidates {
            let entry = self.entries[id as usize];
            if entry.code_size as usize != code.len() || entry.cb1_size as usize != cb1_data.len() {
                continue;
            }

            let existing = match self.memo.get(id as usize).cloned().flatten() {
                Some(existing) => existing,
                None => self.read_entry(&mut files.data, &entry)?,
            };
            if *existing.code == *code && *existing.cb1_data == *cb1_data {
                return Ok(id);
            }
        }

        let offset = files.data.seek(SeekFrom::End(0))?;
        {
            let mut writer = BinaryWriter::new(BufWriter::new(&mut files.data));
            writer.write_bytes(cb1_data)?;
            writer.begin_compression(CompressionMethod::Deflate)?;
            writer.write_bytes(code)?;
            writer.end_compression()?;
            writer.into_inner()?.flush()?;
        }

        let entry = GuestTocEntry {
            offset: offset as u32,
            code_size: code.len() as u32,
            cb1_size: cb1_data.len() as u32,
            hash,
        };
        let id = self.entries.len() as GuestCodeId;
        files.toc.seek(SeekFrom::Start(toc::entry_position(id as usize, ENTRY_SIZE)))?;
        files.toc.write_all(bytemuck::bytes_of(&entry))?;

        header.modification_count = header.modification_count.wrapping_add(1);
        toc::write_header(&mut files.toc, &header)?;

        self.entries.push(entry);
        self.toc_index.entry(hash).or_default().push(id);
        self.last_modification_count = Some(header.modification_count);

        tracing::debug!("Added guest code entry {} ({} bytes)", id, code.len());
        Ok(id)
    }

    /// Load an entry, opening the store for just this call
    pub fn load_shader(&mut self, id: GuestCodeId) -> Result<GuestCode> {
        let mut files = self
            .open_read_only()?
            .ok_or(ShaderCacheError::InvalidGuestCodeId(id))?;
        self.load_shader_from(&mut files, id)
    }

    /// Load an entry through files held open by the caller
    pub fn load_shader_from(
        &mut self,
        files: &mut GuestFiles,
        id: GuestCodeId,
    ) -> Result<GuestCode> {
        let index = id as usize;
        if let Some(Some(cached)) = self.memo.get(index) {
            return Ok(cached.clone());
        }

        let count = files.entry_count()?;
        if index >= count {
            return Err(ShaderCacheError::InvalidGuestCodeId(id));
        }

        if self.memo.len() < count {
            self.memo.resize(count, None);
        }

        let mut entry = GuestTocEntry::zeroed();
        files.toc.seek(SeekFrom::Start(toc::entry_position(index, ENTRY_SIZE)))?;
        files.toc.read_exact(bytemuck::bytes_of_mut(&mut entry))?;

        let loaded = self.read_entry(&mut files.data, &entry)?;
        self.memo[index] = Some(loaded.clone());
        Ok(loaded)
    }

    /// Release the memo of decompressed entries
    pub fn clear_memory_cache(&mut self) {
        self.memo = Vec::new();
    }

    /// Number of entries currently in the TOC file
    pub fn entry_count(&self) -> Result<usize> {
        match self.open_read_only()? {
            Some(files) => files.entry_count(),
            None => Ok(0),
        }
    }
}
