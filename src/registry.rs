//! Memory descriptor registry: the in-memory catalog of parts, their memory
//! regions, and the ordered canonical memory-name list.
//!
//! Parts and their memory descriptors are loaded once from the (out of
//! scope) configuration collaborator and treated as immutable for the
//! session; the buffers inside each `Memory` are the only thing the access
//! engine mutates.

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::opcode::OpcodeTemplate;

bitflags! {
    /// Which programming interfaces a part supports. Several bits may be
    /// set; the access engine only branches on `TPI` today, the rest are
    /// carried for completeness of the data model and for driver selection
    /// upstream of this crate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProgModes: u32 {
        const ISP          = 1 << 0;
        const TPI          = 1 << 1;
        const PDI          = 1 << 2;
        const UPDI         = 1 << 3;
        const HVSP         = 1 << 4;
        const HVPP         = 1 << 5;
        const DEBUG_WIRE   = 1 << 6;
        const JTAG         = 1 << 7;
        const XMEGA_JTAG   = 1 << 8;
        const AVR32_JTAG   = 1 << 9;
        const AWIRE        = 1 << 10;
        const BOOTLOADER   = 1 << 11;
    }
}

bitflags! {
    /// Per-cell tag bits for a memory's buffer. Only `ALLOCATED` is used by
    /// this crate today; the bitset leaves room for upstream tools (e.g. a
    /// "cell came from overlay N" tag) without a layout change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Tag: u8 {
        const ALLOCATED = 1 << 0;
    }
}

bitflags! {
    /// Incidental part-level quirks that change access-engine behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
    pub struct PartFlags: u8 {
        /// Disables the read-before-write optimization in
        /// `write_byte_default`; see §4.5 for the AT90S1200 erratum.
        const IS_AT90S1200 = 1 << 0;
    }
}

/// The named operations a memory descriptor may carry an opcode template
/// for. Not every memory defines every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Read,
    ReadLo,
    ReadHi,
    Write,
    WriteLo,
    WriteHi,
    LoadPageLo,
    LoadPageHi,
    WritePage,
    LoadExtAddr,
    ChipErase,
    PageErase,
}

/// One named, contiguous memory region on a part: flash, eeprom, a fuse
/// byte, signature, userrow, and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub name: String,
    pub size: usize,
    /// 0 or 1 means unpaged.
    pub page_size: usize,
    pub max_write_delay_us: u64,
    /// Byte values that cannot be distinguished from the pre-programmed
    /// state by read-back polling; see §4.5's readback-sentinel handling.
    pub readback: [u8; 2],
    pub ops: HashMap<Op, OpcodeTemplate>,
    /// Nonzero only for TPI parts; base address added to the cell offset
    /// before it is sent as a TPI pointer-register value.
    pub offset: u32,
    /// Device is powered off and re-initialized if readback disagrees with
    /// what was written to this memory; see §4.5's completion policy.
    pub power_off_after_write: bool,
    #[serde(skip)]
    pub buf: Vec<u8>,
    #[serde(skip)]
    pub tags: Vec<Tag>,
}

impl Memory {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        Memory {
            name,
            size,
            page_size: 0,
            max_write_delay_us: 10_000,
            readback: [0xFF, 0xFF],
            ops: HashMap::new(),
            offset: 0,
            power_off_after_write: false,
            buf: vec![0xFF; size],
            tags: vec![Tag::empty(); size],
        }
    }

    pub fn with_op(mut self, op: Op, template: OpcodeTemplate) -> Self {
        self.ops.insert(op, template);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_max_write_delay_us(mut self, delay: u64) -> Self {
        self.max_write_delay_us = delay;
        self
    }

    pub fn with_readback(mut self, a: u8, b: u8) -> Self {
        self.readback = [a, b];
        self
    }

    pub fn paged(&self) -> bool {
        self.page_size > 1
    }

    pub fn op(&self, op: Op) -> Option<&OpcodeTemplate> {
        self.ops.get(&op)
    }

    /// Fill the buffer with 0xFF and clear every tag. Called at the start of
    /// `read_whole`.
    pub fn reset_buffer(&mut self) {
        self.buf.fill(0xFF);
        self.tags.fill(Tag::empty());
    }

    /// Mark every cell in `0..len` as carrying file-supplied data, as an
    /// image loader would after reading a file into `self.buf`.
    pub fn allocate(&mut self, range: std::ops::Range<usize>) {
        for t in &mut self.tags[range] {
            *t |= Tag::ALLOCATED;
        }
    }
}

/// A microcontroller model: identity, supported programming modes, and its
/// ordered collection of memory descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub desc: String,
    pub signature: [u8; 3],
    pub family_id: String,
    pub prog_modes: ProgModes,
    pub flags: PartFlags,
    pub memories: Vec<Memory>,
}

impl Part {
    pub fn new(id: impl Into<String>, desc: impl Into<String>) -> Self {
        Part {
            id: id.into(),
            desc: desc.into(),
            signature: [0, 0, 0],
            family_id: String::new(),
            prog_modes: ProgModes::ISP,
            flags: PartFlags::empty(),
            memories: Vec::new(),
        }
    }

    pub fn is_tpi(&self) -> bool {
        self.prog_modes.contains(ProgModes::TPI)
    }

    pub fn is_updi(&self) -> bool {
        self.prog_modes.contains(ProgModes::UPDI)
    }

    pub fn mem(&self, name: &str) -> Option<&Memory> {
        self.memories.iter().find(|m| m.name == name)
    }

    pub fn mem_mut(&mut self, name: &str) -> Option<&mut Memory> {
        self.memories.iter_mut().find(|m| m.name == name)
    }
}

/// `locate_mem` as a free function, for callers holding only a `&Part`.
pub fn locate_mem<'a>(part: &'a Part, name: &str) -> CoreResult<&'a Memory> {
    part.mem(name).ok_or_else(|| CoreError::UnknownMemory {
        part: part.id.clone(),
        memory: name.to_string(),
    })
}

pub fn locate_mem_mut<'a>(part: &'a mut Part, name: &str) -> CoreResult<&'a mut Memory> {
    let part_id = part.id.clone();
    part.mem_mut(name).ok_or(CoreError::UnknownMemory {
        part: part_id,
        memory: name.to_string(),
    })
}

/// A memory is "flash-like" if bulk-erased writes of 0xFF are a no-op and
/// the trailing-0xff high-water-mark optimization applies to it.
pub fn is_flash_like(mem: &Memory) -> bool {
    matches!(mem.name.as_str(), "flash" | "application" | "apptable" | "boot")
}

pub fn is_eeprom(mem: &Memory) -> bool {
    mem.name == "eeprom"
}

/// The conventional ordering real part databases list memories in; new
/// names are appended here only through `MemoryNameRegistry::register`, as
/// a configuration file is loaded.
const SEED_MEMORY_ORDER: &[&str] = &[
    "eeprom", "flash", "application", "apptable", "boot", "lfuse", "hfuse", "efuse", "fuse",
    "fuse0", "wdtcfg", "fuse1", "bodcfg", "fuse2", "osccfg", "fuse3", "fuse4", "tcd0cfg", "fuse5",
    "syscfg0", "fuse6", "syscfg1", "fuse7", "append", "codesize", "fuse8", "fuse9", "bootend",
    "bootsize", "fuses", "lock", "lockbits", "tempsense", "signature", "prodsig", "sernum",
    "calibration", "osccal16", "osccal20", "osc16err", "osc20err", "usersig", "userrow", "data",
];

/// Hard cap mirroring the fixed-size array the reference registry uses;
/// registration beyond this fails loudly rather than growing silently.
const MAX_MEMORY_NAMES: usize = 100;

/// Append-only, ordered list of canonical memory names. Populated once
/// during configuration load and read afterward as a stable snapshot (§3's
/// append-only invariant).
#[derive(Debug, Clone)]
pub struct MemoryNameRegistry {
    names: Vec<String>,
}

impl Default for MemoryNameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNameRegistry {
    pub fn new() -> Self {
        MemoryNameRegistry {
            names: SEED_MEMORY_ORDER.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Register a new canonical name if not already present. Fails hard
    /// once the registry is full, mirroring the reference implementation's
    /// fixed-size `avr_mem_order` array running out of slots.
    pub fn register(&mut self, name: &str) -> CoreResult<()> {
        if self.names.iter().any(|n| n == name) {
            return Ok(());
        }
        if self.names.len() >= MAX_MEMORY_NAMES {
            return Err(CoreError::RegistryFull(name.to_string()));
        }
        self.names.push(name.to_string());
        Ok(())
    }

    /// Case-sensitive exact match against the canonical list.
    pub fn is_known(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Prefix match, offered separately for diagnostics ("did you mean
    /// ...") rather than folded into `is_known`.
    pub fn might_be_known(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.names.iter().any(|n| n.starts_with(prefix))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// The full catalog of parts loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct PartRegistry {
    parts: Vec<Part>,
}

impl PartRegistry {
    pub fn new(parts: Vec<Part>) -> Self {
        PartRegistry { parts }
    }

    pub fn locate_part(&self, part_id: &str) -> CoreResult<&Part> {
        self.parts
            .iter()
            .find(|p| p.id == part_id)
            .ok_or_else(|| CoreError::UnknownPart(part_id.to_string()))
    }

    pub fn locate_part_by_signature(&self, sig: &[u8]) -> Option<&Part> {
        self.parts.iter().find(|p| sig.len() == 3 && p.signature == sig)
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }
}
