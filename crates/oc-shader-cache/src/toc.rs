//! Table-of-contents file helpers shared by every store

use crate::codec::make_magic;
use bytemuck::{Pod, Zeroable};
use oc_core::FormatError;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Guest code TOC magic
pub const GUEST_TOC_MAGIC: u32 = make_magic(b"TOCG");
/// Shared program TOC magic
pub const SHARED_TOC_MAGIC: u32 = make_magic(b"TOCS");
/// Host program TOC magic
pub const HOST_TOC_MAGIC: u32 = make_magic(b"TOCH");

/// Current on-disk format version (major.minor packed as `major << 16 | minor`)
pub const FORMAT_VERSION: u32 = pack_version(1, 0);

pub const fn pack_version(major: u16, minor: u16) -> u32 {
    (major as u32) << 16 | minor as u32
}

/// Header at the start of every TOC file.
///
/// `codegen_version` is only meaningful for host stores and
/// `modification_count` only for the guest store; both are zero elsewhere.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TocHeader {
    pub magic: u32,
    pub format_version: u32,
    pub codegen_version: u32,
    pub modification_count: u32,
    pub reserved: u64,
}

/// Size of [`TocHeader`] on disk
pub const TOC_HEADER_SIZE: u64 = std::mem::size_of::<TocHeader>() as u64;

impl TocHeader {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            format_version: FORMAT_VERSION,
            codegen_version: 0,
            modification_count: 0,
            reserved: 0,
        }
    }

    /// Check magic and format version
    pub fn validate(&self, magic: u32) -> Result<(), FormatError> {
        if self.magic != magic {
            return Err(FormatError::BadMagic {
                expected: magic,
                actual: self.magic,
            });
        }
        if self.format_version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion {
                found: self.format_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(())
    }
}

/// Read the header at the start of `file`.
///
/// Returns `Ok(None)` when the file is too short to hold one.
pub fn read_header(file: &mut File) -> io::Result<Option<TocHeader>> {
    if file.metadata()?.len() < TOC_HEADER_SIZE {
        return Ok(None);
    }

    let mut header = TocHeader::zeroed();
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(bytemuck::bytes_of_mut(&mut header))?;
    Ok(Some(header))
}

/// Read and validate the header of `file`, folding every failure into `None`
pub fn read_valid_header(file: &mut File, magic: u32) -> io::Result<Option<TocHeader>> {
    Ok(read_header(file)?.filter(|h| h.validate(magic).is_ok()))
}

/// Overwrite the header at the start of `file`
pub fn write_header(file: &mut File, header: &TocHeader) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytemuck::bytes_of(header))
}

/// Number of whole `entry_size` entries following the header
pub fn entry_count(file: &File, entry_size: usize) -> io::Result<usize> {
    let len = file.metadata()?.len();
    Ok((len.saturating_sub(TOC_HEADER_SIZE) / entry_size as u64) as usize)
}

/// Byte position of entry `index`
pub fn entry_position(index: usize, entry_size: usize) -> u64 {
    TOC_HEADER_SIZE + (index as u64) * entry_size as u64
}
