//! Verification engine: compares a device-read image against a reference
//! image, with fuse-specific bit masking so unused bits never cause a
//! false mismatch.

use crate::opcode::OpcodeTemplate;
use crate::registry::{Memory, Op, Tag};

/// A single-byte fuse-type memory with both read and write opcodes
/// defined gets a bitmask of only the bits actually exercised by those two
/// opcodes. Anything else compares with an all-ones mask (plain byte
/// comparison).
pub fn fuse_bitmask(mem: &Memory) -> u8 {
    if mem.size > 1 {
        return 0xFF;
    }
    let (write, read) = match (mem.op(Op::Write), mem.op(Op::Read)) {
        (Some(w), Some(r)) => (w, r),
        _ => return 0xFF,
    };
    input_bits(write) & output_bits(read)
}

fn input_bits(template: &OpcodeTemplate) -> u8 {
    template.input_mask()
}

fn output_bits(template: &OpcodeTemplate) -> u8 {
    template.output_mask()
}

/// `true` when the two bytes differ after masking off bits the part's
/// opcodes never actually exercise.
pub fn compare_masked(mem: &Memory, a: u8, b: u8) -> bool {
    let mask = fuse_bitmask(mem);
    (a & mask) != (b & mask)
}

/// The outcome of comparing one memory against a reference image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Every allocated cell matched (masked, for fuse-type memories).
    Match { verified: usize },
    /// `reported` bytes came back masked-equal but raw-different; included
    /// only for diagnostics, the verification still succeeds.
    MatchWithUnusedBitWarnings {
        verified: usize,
        warnings: Vec<UnusedBitMismatch>,
    },
    /// The first masked mismatch, reported with both byte values.
    Mismatch { addr: usize, expected: u8, actual: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnusedBitMismatch {
    pub addr: usize,
    pub expected: u8,
    pub actual: u8,
    /// `true` when the device read-back holds a 0 at the unused bit(s)
    /// that differ from the reference image; `false` means it holds a 1
    /// there, which is on the user to fix by setting unused bits to 1
    /// when writing.
    pub programmer_returns_zero: bool,
}

/// Verify `actual` against `expected` over `0..size`, restricted to cells
/// `expected` tags as `ALLOCATED`. `size` is clamped to the smaller of the
/// two memories' declared sizes, mirroring the reference behavior of
/// verifying only as much as both regions actually contain.
pub fn verify_memory(expected: &Memory, actual: &Memory, size: usize) -> VerifyOutcome {
    let size = size.min(expected.size).min(actual.size);
    let mask = fuse_bitmask(expected);
    let mut warnings = Vec::new();

    for i in 0..size {
        if !expected.tags[i].contains(Tag::ALLOCATED) {
            continue;
        }
        let want = expected.buf[i];
        let got = actual.buf[i];
        if want == got {
            continue;
        }
        if (want & mask) != (got & mask) {
            return VerifyOutcome::Mismatch { addr: i, expected: want, actual: got };
        }
        // Masked-equal means every differing bit lies outside mask; a 1 in
        // the read-back at one of those bits means the device is returning
        // it as 1, not 0.
        let unused_diff = want ^ got;
        let programmer_returns_zero = got & unused_diff == 0;
        warnings.push(UnusedBitMismatch { addr: i, expected: want, actual: got, programmer_returns_zero });
    }

    if warnings.is_empty() {
        VerifyOutcome::Match { verified: size }
    } else {
        VerifyOutcome::MatchWithUnusedBitWarnings { verified: size, warnings }
    }
}
