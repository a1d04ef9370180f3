//! Error types for the oxidized-cell shader cache

use thiserror::Error;

/// Main error type for shader cache operations
#[derive(Error, Debug)]
pub enum ShaderCacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Shader translation failed: {0}")]
    Translation(String),

    #[error("Program link failed{}", .slot.map(|s| format!(" for slot {}", s)).unwrap_or_default())]
    LinkFailed { slot: Option<usize> },

    #[error("Invalid guest code id: {0}")]
    InvalidGuestCodeId(u32),

    #[error("Background writer has stopped")]
    WriterStopped,
}

/// On-disk format errors
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Bad magic: expected 0x{expected:08x}, found 0x{actual:08x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("Unsupported format version {found:#x} (expected {expected:#x})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Truncated {what}")]
    Truncated { what: &'static str },

    #[error("Record magic mismatch: expected 0x{expected:08x}, found 0x{actual:08x}")]
    RecordMagicMismatch { expected: u32, actual: u32 },

    #[error("Unknown compression method: {0}")]
    UnknownCompression(u8),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

/// Result type alias for shader cache operations
pub type Result<T> = std::result::Result<T, ShaderCacheError>;
