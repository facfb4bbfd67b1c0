//! Error taxonomy for the device-programming core.
//!
//! Every fallible public function in this crate returns `Result<T, CoreError>`.
//! Variants carry structured data (address, memory name, expected/actual byte)
//! rather than a pre-formatted message, so a caller can decide whether to
//! recover or surface without re-parsing a string.

use thiserror::Error;

/// The taxonomy described in the core's error handling design, from most to
/// least local.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The operation has no opcode for this memory, or the driver lacks the
    /// capability. Callers may skip and continue.
    #[error("operation not supported for memory \"{memory}\"")]
    NotSupported {
        /// Name of the memory region the caller asked to operate on.
        memory: String,
    },

    /// The transport returned an error on one cell or page, but the session
    /// can continue.
    #[error("transport error on memory \"{memory}\" at address {addr:#06x}: {detail}")]
    SoftFail {
        memory: String,
        addr: u32,
        detail: String,
    },

    /// Readback did not match the written value after exhausting the retry
    /// budget.
    #[error("write error on memory \"{memory}\" at address {addr:#06x}: wrote {written:#04x}, read back {read_back:#04x}")]
    WriteError {
        memory: String,
        addr: u32,
        written: u8,
        read_back: u8,
    },

    /// First differing address found during verification, masked per §4.7.
    #[error("verification error for \"{memory}\", first mismatch at address {addr:#06x}: {expected:#04x} != {actual:#04x}")]
    VerifyMismatch {
        memory: String,
        addr: u32,
        expected: u8,
        actual: u8,
    },

    /// The device's signature bytes did not match the expected part, or read
    /// back as all-0x00 / all-0xFF after the retry budget was exhausted.
    #[error("signature mismatch for part \"{part}\": expected {expected:02x?}, got {actual:02x?}")]
    SignatureMismatch {
        part: String,
        expected: [u8; 3],
        actual: Vec<u8>,
    },

    /// A UPDI system information block's family id did not match the part.
    #[error("family id mismatch for part \"{part}\": expected \"{expected}\", got \"{actual}\"")]
    FamilyIdMismatch {
        part: String,
        expected: String,
        actual: String,
    },

    /// A named memory region does not exist on this part.
    #[error("no \"{memory}\" memory for part \"{part}\"")]
    UnknownMemory { part: String, memory: String },

    /// A named part does not exist in the registry.
    #[error("unknown part \"{0}\"")]
    UnknownPart(String),

    /// The canonical memory-name list has no room left for a new name.
    #[error("memory name registry is full, cannot register \"{0}\"")]
    RegistryFull(String),

    /// TPI protocol precondition violated before any frame was sent.
    #[error("TPI protocol error: {0}")]
    TpiProtocol(String),

    /// Unable to open the transport, initialize the device, or recover
    /// power state. The session is torn down after this is returned.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// True for errors the orchestrator should log and continue past rather
    /// than abort the remaining requests for.
    pub fn is_soft(&self) -> bool {
        matches!(self, CoreError::SoftFail { .. } | CoreError::NotSupported { .. })
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
