//! Opcode bit engine.
//!
//! A command word sent to a part is a 4-byte buffer whose bits are assembled
//! positionally from a template: each of the 32 bit positions is either a
//! fixed 0/1, copied from one bit of the address, copied from one bit of the
//! input byte, or captures one bit of the output byte out of the 4-byte
//! response. Templates come from the configuration collaborator and are
//! trusted; `encode`/`decode` are pure and infallible.

use serde::{Deserialize, Serialize};

/// What a single one of the 32 bit positions in a command word contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitKind {
    /// Always cleared in the outgoing command.
    Zero,
    /// Always set in the outgoing command.
    One,
    /// Copy bit `n` of the input data byte into this position.
    Input(u8),
    /// Copy bit `n` of the address into this position.
    Address(u8),
    /// On decode, bit `n` of the output byte is read from this position.
    Output(u8),
    /// Not meaningful; left as-is (zero) on encode, ignored on decode.
    Ignore,
}

/// A fixed-length, 32-position instruction template for one (memory,
/// operation) pair, e.g. the "read low byte" opcode for `flash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpcodeTemplate {
    bits: [BitKind; 32],
}

impl OpcodeTemplate {
    pub fn new(bits: [BitKind; 32]) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> &[BitKind; 32] {
        &self.bits
    }

    /// Set the command-word bits dictated by `Zero`/`One` entries. Called
    /// before `set_address`/`set_input` so address/input bits can stack on
    /// top of an all-zero base for the `Ignore` positions.
    fn set_constants(&self, cmd: &mut [u8; 4]) {
        for (pos, bit) in self.bits.iter().enumerate() {
            match bit {
                BitKind::One => set_bit(cmd, pos, true),
                BitKind::Zero | BitKind::Ignore | BitKind::Input(_) | BitKind::Address(_) | BitKind::Output(_) => {
                    set_bit(cmd, pos, false)
                }
            }
        }
    }

    fn set_address(&self, cmd: &mut [u8; 4], addr: u32) {
        for (pos, bit) in self.bits.iter().enumerate() {
            if let BitKind::Address(k) = bit {
                set_bit(cmd, pos, (addr >> k) & 1 != 0);
            }
        }
    }

    fn set_input(&self, cmd: &mut [u8; 4], input: u8) {
        for (pos, bit) in self.bits.iter().enumerate() {
            if let BitKind::Input(k) = bit {
                set_bit(cmd, pos, (input >> k) & 1 != 0);
            }
        }
    }

    /// Which bits the opcode actually sends as input, as a mask. Used by the
    /// verification engine to compute the fuse bitmask.
    pub fn input_mask(&self) -> u8 {
        let mut mask = 0u8;
        for bit in &self.bits {
            if let BitKind::Input(k) = bit {
                mask |= 1 << k;
            }
        }
        mask
    }

    /// Which bits of the output byte this opcode actually produces, as a
    /// mask.
    pub fn output_mask(&self) -> u8 {
        let mut mask = 0u8;
        for bit in &self.bits {
            if let BitKind::Output(k) = bit {
                mask |= 1 << k;
            }
        }
        mask
    }
}

fn set_bit(cmd: &mut [u8; 4], pos: usize, value: bool) {
    let byte = pos / 8;
    let bit = 7 - (pos % 8);
    if value {
        cmd[byte] |= 1 << bit;
    } else {
        cmd[byte] &= !(1 << bit);
    }
}

fn get_bit(buf: &[u8; 4], pos: usize) -> bool {
    let byte = pos / 8;
    let bit = 7 - (pos % 8);
    (buf[byte] >> bit) & 1 != 0
}

/// Assemble a 4-byte command word for `template`, addressing `addr` and
/// carrying `input` as the data byte (ignored by templates with no `Input`
/// positions).
pub fn encode(template: &OpcodeTemplate, addr: u32, input: u8) -> [u8; 4] {
    let mut cmd = [0u8; 4];
    template.set_constants(&mut cmd);
    template.set_address(&mut cmd, addr);
    template.set_input(&mut cmd, input);
    cmd
}

/// Extract the one output byte a response carries, per `template`'s
/// `Output` positions.
pub fn decode(template: &OpcodeTemplate, response: &[u8; 4]) -> u8 {
    let mut output = 0u8;
    for (pos, bit) in template.bits().iter().enumerate() {
        if let BitKind::Output(k) = bit {
            if get_bit(response, pos) {
                output |= 1 << k;
            }
        }
    }
    output
}
