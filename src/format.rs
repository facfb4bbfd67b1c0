//! Boundary to the external file-format collaborator (Intel HEX, raw
//! binary, ELF, …). The core only needs to ask "does this path exist and
//! can I read/write it", "load this file into a memory image", and "dump
//! this memory image to a file" — the actual codecs live outside this
//! crate.

use std::path::Path;

use crate::error::CoreResult;
use crate::registry::Memory;

/// The format a file is expected to be in. `Auto` defers to whatever
/// sniffing the external collaborator performs (typically file extension
/// or content inspection); the core never interprets this itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Auto,
    IntelHex,
    SRecord,
    Raw,
    Elf,
    Decimal,
    Hex,
    Octal,
    Binary,
}

/// Reads a memory image from a file path. Implemented outside this crate;
/// the access engine and orchestrator only depend on this trait.
pub trait ImageReader {
    fn exists(&self, path: &Path) -> bool;
    fn readable(&self, path: &Path) -> bool;

    /// Load `path` into `mem.buf`, tagging every cell the file supplies as
    /// `ALLOCATED`. Fails if the format can't be parsed or doesn't fit.
    fn read_into(&self, path: &Path, format: ImageFormat, mem: &mut Memory) -> CoreResult<()>;
}

/// Writes a memory image out to a file path.
pub trait ImageWriter {
    fn writable(&self, path: &Path) -> bool;

    /// Dump `mem.buf[0..size]` to `path` in `format`.
    fn write_from(&self, path: &Path, format: ImageFormat, mem: &Memory, size: usize) -> CoreResult<()>;
}
