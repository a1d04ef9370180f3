//! Framed binary codec
//!
//! Fixed-layout records are plain `#[repr(C)]` structs written as their raw
//! bytes (host byte order; every supported host is little-endian). Variable
//! records are framed with a `(magic, declared_size)` header so later format
//! revisions can append fields. Sections of a stream can be deflate
//! compressed; a one-byte method tag precedes every compressed section.

use bytemuck::{Pod, Zeroable};
use flate2::bufread::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use oc_core::{FormatError, Result};
use std::io::{self, BufRead, Read, Write};

/// Largest step `read_bytes` grows its buffer by
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Pack a four character tag into a little-endian magic number
pub const fn make_magic(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

/// Compression method tag written at the start of a compressed section
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    None = 0,
    Deflate = 1,
}

impl TryFrom<u8> for CompressionMethod {
    type Error = FormatError;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Deflate),
            other => Err(FormatError::UnknownCompression(other)),
        }
    }
}

/// Header preceding every framed record
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RecordHeader {
    magic: u32,
    size: u32,
}

enum Sink<W: Write> {
    Plain(W),
    Deflate(DeflateEncoder<W>),
    Poisoned,
}

/// Record writer over any byte sink
pub struct BinaryWriter<W: Write> {
    sink: Sink<W>,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            sink: Sink::Plain(inner),
        }
    }

    /// Write a fixed-layout record
    pub fn write<T: Pod>(&mut self, value: &T) -> io::Result<()> {
        self.write_bytes(bytemuck::bytes_of(value))
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.sink {
            Sink::Plain(w) => w.write_all(bytes),
            Sink::Deflate(w) => w.write_all(bytes),
            Sink::Poisoned => Err(poisoned()),
        }
    }

    /// Write a record prefixed with its magic and size
    pub fn write_with_header<T: Pod>(&mut self, value: &T, magic: u32) -> io::Result<()> {
        let header = RecordHeader {
            magic,
            size: std::mem::size_of::<T>() as u32,
        };
        self.write(&header)?;
        self.write(value)
    }

    /// Start a compressed section. Everything written until
    /// [`end_compression`](Self::end_compression) goes through the compressor.
    pub fn begin_compression(&mut self, method: CompressionMethod) -> io::Result<()> {
        self.write_bytes(&[method as u8])?;

        if method == CompressionMethod::Deflate {
            match std::mem::replace(&mut self.sink, Sink::Poisoned) {
                Sink::Plain(w) => {
                    self.sink = Sink::Deflate(DeflateEncoder::new(w, Compression::default()));
                }
                other => {
                    self.sink = other;
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "compression sections cannot nest",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Finish the current compressed section, if any
    pub fn end_compression(&mut self) -> io::Result<()> {
        if let Sink::Deflate(_) = self.sink {
            if let Sink::Deflate(encoder) = std::mem::replace(&mut self.sink, Sink::Poisoned) {
                self.sink = Sink::Plain(encoder.finish()?);
            }
        }
        Ok(())
    }

    /// Finish any open section and hand back the underlying sink
    pub fn into_inner(mut self) -> io::Result<W> {
        self.end_compression()?;
        match std::mem::replace(&mut self.sink, Sink::Poisoned) {
            Sink::Plain(w) => Ok(w),
            _ => Err(poisoned()),
        }
    }
}

enum Source<R: BufRead> {
    Plain(R),
    Deflate(DeflateDecoder<R>),
    Poisoned,
}

/// Record reader over any buffered byte source
pub struct BinaryReader<R: BufRead> {
    source: Source<R>,
}

impl<R: BufRead> BinaryReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            source: Source::Plain(inner),
        }
    }

    /// Read as many bytes as are available up to `buf.len()`
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let result = match &mut self.source {
                Source::Plain(r) => r.read(&mut buf[filled..]),
                Source::Deflate(r) => r.read(&mut buf[filled..]),
                Source::Poisoned => return Err(poisoned()),
            };
            match result {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    /// Read a fixed-layout record.
    ///
    /// Returns `None` when the stream ends before a whole record is available,
    /// which callers use as the end-of-entries marker.
    pub fn try_read<T: Pod>(&mut self) -> Result<Option<T>> {
        let mut value = T::zeroed();
        let wanted = std::mem::size_of::<T>();
        let got = self.fill(bytemuck::bytes_of_mut(&mut value))?;
        Ok((got == wanted).then_some(value))
    }

    /// Read a fixed-layout record that must be present
    pub fn read<T: Pod>(&mut self, what: &'static str) -> Result<T> {
        self.try_read()?
            .ok_or_else(|| FormatError::Truncated { what }.into())
    }

    /// Read exactly `len` raw bytes.
    ///
    /// The buffer grows with the bytes actually read, so a corrupt length
    /// fails as truncated instead of allocating `len` up front.
    pub fn read_bytes(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len.min(READ_CHUNK_SIZE));
        while buf.len() < len {
            let start = buf.len();
            let chunk = (len - start).min(READ_CHUNK_SIZE);
            buf.resize(start + chunk, 0);
            if self.fill(&mut buf[start..])? != chunk {
                return Err(FormatError::Truncated { what }.into());
            }
        }
        Ok(buf)
    }

    /// Read a record written by [`BinaryWriter::write_with_header`].
    ///
    /// Records declared shorter than `T` leave the missing tail zeroed; bytes
    /// declared beyond `T` are skipped.
    pub fn read_with_header<T: Pod>(&mut self, magic: u32) -> Result<T> {
        let header: RecordHeader = self.read("record header")?;
        if header.magic != magic {
            return Err(FormatError::RecordMagicMismatch {
                expected: magic,
                actual: header.magic,
            }
            .into());
        }

        let declared = header.size as usize;
        let known = std::mem::size_of::<T>();
        let take = declared.min(known);

        let mut value = T::zeroed();
        if self.fill(&mut bytemuck::bytes_of_mut(&mut value)[..take])? != take {
            return Err(FormatError::Truncated { what: "framed record" }.into());
        }

        self.skip(declared - take)?;
        Ok(value)
    }

    fn skip(&mut self, mut count: usize) -> Result<()> {
        let mut scratch = [0u8; 256];
        while count > 0 {
            let chunk = count.min(scratch.len());
            if self.fill(&mut scratch[..chunk])? != chunk {
                return Err(FormatError::Truncated { what: "framed record tail" }.into());
            }
            count -= chunk;
        }
        Ok(())
    }

    /// Enter a compressed section, detecting the method from its tag byte
    pub fn begin_compression(&mut self) -> Result<()> {
        let mut tag = [0u8; 1];
        if self.fill(&mut tag)? != 1 {
            return Err(FormatError::Truncated { what: "compression tag" }.into());
        }

        if CompressionMethod::try_from(tag[0])? == CompressionMethod::Deflate {
            match std::mem::replace(&mut self.source, Source::Poisoned) {
                Source::Plain(r) => self.source = Source::Deflate(DeflateDecoder::new(r)),
                other => {
                    self.source = other;
                    return Err(FormatError::CorruptRecord(
                        "nested compression section".to_string(),
                    )
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Leave the current compressed section, consuming whatever is left of it
    pub fn end_compression(&mut self) -> Result<()> {
        if let Source::Deflate(_) = self.source {
            if let Source::Deflate(mut decoder) =
                std::mem::replace(&mut self.source, Source::Poisoned)
            {
                io::copy(&mut decoder, &mut io::sink())?;
                self.source = Source::Plain(decoder.into_inner());
            }
        }
        Ok(())
    }

    /// Hand back the underlying source
    pub fn into_inner(self) -> Option<R> {
        match self.source {
            Source::Plain(r) => Some(r),
            Source::Deflate(d) => Some(d.into_inner()),
            Source::Poisoned => None,
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "binary stream left in an invalid state")
}
