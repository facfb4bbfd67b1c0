//! Update orchestrator: consumes an ordered list of update requests, drives
//! the access engine, and reports per-operation outcomes. Also owns the
//! signature-establishment retry dance run once per session before any
//! update request executes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::access;
use crate::capability::ProgrammerDriver;
use crate::clock::Clock;
use crate::context::AccessContext;
use crate::error::{CoreError, CoreResult};
use crate::format::{ImageFormat, ImageReader, ImageWriter};
use crate::registry::{Part, ProgModes};
use crate::verify::{self, VerifyOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Read,
    Write,
    Verify,
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// `None` defers to `default_memory_name`.
    pub memory: Option<String>,
    pub op: UpdateOp,
    pub file: PathBuf,
    pub format: ImageFormat,
}

/// The run-level knobs the (out of scope) CLI/config collaborator
/// resolves and hands to the core as plain data. No argv parsing happens
/// here or anywhere in this crate.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub port: Option<String>,
    pub programmer_id: Option<String>,
    pub part_id: String,
    pub updates: Vec<UpdateRequest>,
    pub chip_erase: bool,
    pub auto_erase_disable: bool,
    pub verify_disable: bool,
    pub no_write: bool,
    pub override_signature_check: bool,
}

#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub memory: String,
    pub op: UpdateOp,
    pub bytes: Option<usize>,
    pub error: Option<CoreError>,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub operations: Vec<OperationOutcome>,
    /// Set when the session was torn down early by a hard failure; the
    /// remaining requests were not attempted.
    pub aborted_by: Option<CoreError>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.aborted_by.is_none() && self.operations.iter().all(|op| op.error.is_none())
    }
}

/// "application" for PDI parts, "flash" otherwise.
pub fn default_memory_name(part: &Part) -> &'static str {
    if part.prog_modes.contains(ProgModes::PDI) {
        "application"
    } else {
        "flash"
    }
}

/// Check every request's memory exists on `part` and its file is
/// readable/writable, before any device access happens. Returns the first
/// violation found.
pub fn dry_run(
    part: &Part,
    requests: &[UpdateRequest],
    reader: &dyn ImageReader,
    writer: &dyn ImageWriter,
) -> CoreResult<()> {
    for req in requests {
        let memory = req.memory.as_deref().unwrap_or_else(|| default_memory_name(part));
        part.mem(memory).ok_or_else(|| CoreError::UnknownMemory {
            part: part.id.clone(),
            memory: memory.to_string(),
        })?;

        match req.op {
            UpdateOp::Write => {
                if !reader.exists(&req.file) || !reader.readable(&req.file) {
                    return Err(CoreError::Fatal(format!(
                        "can't open input file \"{}\" for memory \"{memory}\"",
                        req.file.display()
                    )));
                }
            }
            UpdateOp::Read => {
                if !writer.writable(&req.file) {
                    return Err(CoreError::Fatal(format!(
                        "can't open output file \"{}\" for memory \"{memory}\"",
                        req.file.display()
                    )));
                }
            }
            UpdateOp::Verify => {
                if !reader.exists(&req.file) || !reader.readable(&req.file) {
                    return Err(CoreError::Fatal(format!(
                        "can't open verification file \"{}\" for memory \"{memory}\"",
                        req.file.display()
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Runs once per session, before any update request executes. Mirrors the
/// reference implementation's post-initialize signature check: three
/// attempts with waits of 10ms/50ms/250ms against an all-0xff or all-0x00
/// readback, and — on UPDI parts — one extra recovery attempt via a
/// system-information-block read and, if a chip erase was requested, an
/// unlock-and-retry.
pub fn establish_signature(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    ctx: &mut AccessContext,
    part: &mut Part,
    override_check: bool,
    chip_erase_requested: &mut bool,
) -> CoreResult<()> {
    if part.prog_modes.contains(ProgModes::AWIRE) {
        return Ok(());
    }

    let Some(mut sig_mem) = part.mem("signature").cloned() else {
        return Ok(());
    };

    let mut attempt = 0u32;
    let mut waittime = Duration::from_micros(10_000);

    loop {
        clock.sleep(waittime);

        match access::read_whole_memory(driver, clock, ctx, part, &mut sig_mem, None) {
            Ok(_) => {}
            Err(e) if e.is_soft() && part.is_updi() && attempt < 1 => {
                attempt += 1;
                if let Some(result) = driver.read_sib(part) {
                    let sib = result?;
                    if !sib.starts_with(&part.family_id) && !override_check {
                        return Err(CoreError::FamilyIdMismatch {
                            part: part.id.clone(),
                            expected: part.family_id.clone(),
                            actual: sib,
                        });
                    }
                }
                if *chip_erase_requested {
                    *chip_erase_requested = false;
                    if let Some(result) = driver.unlock(part) {
                        result?;
                    }
                }
                continue;
            }
            Err(e) => return Err(e),
        }

        let all_ff = sig_mem.buf.iter().all(|&b| b == 0xFF);
        let all_zero = sig_mem.buf.iter().all(|&b| b == 0x00);

        if all_ff || all_zero {
            attempt += 1;
            if attempt < 3 {
                waittime *= 5;
                continue;
            }
            if !override_check {
                return Err(CoreError::SignatureMismatch {
                    part: part.id.clone(),
                    expected: part.signature,
                    actual: sig_mem.buf.clone(),
                });
            }
        } else {
            let matches = sig_mem.size == 3 && sig_mem.buf[..3] == part.signature;
            if !matches && !override_check {
                return Err(CoreError::SignatureMismatch {
                    part: part.id.clone(),
                    expected: part.signature,
                    actual: sig_mem.buf.clone(),
                });
            }
        }

        break;
    }

    if let Some(m) = part.mem_mut("signature") {
        *m = sig_mem;
    }
    Ok(())
}

/// Execute the update requests in order. A soft failure on any request is
/// logged and execution continues with the next request; a hard failure
/// aborts the remaining requests.
#[allow(clippy::too_many_arguments)]
pub fn run_updates(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    ctx: &mut AccessContext,
    part: &mut Part,
    requests: &[UpdateRequest],
    auto_erase: bool,
    verify_after_write: bool,
    reader: &dyn ImageReader,
    writer: &dyn ImageWriter,
) -> SessionOutcome {
    let mut operations = Vec::with_capacity(requests.len());

    for req in requests {
        let memory_name = req.memory.clone().unwrap_or_else(|| default_memory_name(part).to_string());
        let result = run_one(driver, clock, ctx, part, req, &memory_name, auto_erase, verify_after_write, reader, writer);

        let hard_failure = result.as_ref().err().filter(|e| !e.is_soft()).cloned();
        operations.push(OperationOutcome {
            memory: memory_name,
            op: req.op,
            bytes: result.as_ref().ok().copied(),
            error: result.err(),
        });

        if let Some(e) = hard_failure {
            return SessionOutcome { operations, aborted_by: Some(e) };
        }
    }

    SessionOutcome { operations, aborted_by: None }
}

#[allow(clippy::too_many_arguments)]
fn run_one(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    ctx: &mut AccessContext,
    part: &mut Part,
    req: &UpdateRequest,
    memory_name: &str,
    auto_erase: bool,
    verify_after_write: bool,
    reader: &dyn ImageReader,
    writer: &dyn ImageWriter,
) -> CoreResult<usize> {
    match req.op {
        UpdateOp::Read => {
            let mut mem = part
                .mem(memory_name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownMemory { part: part.id.clone(), memory: memory_name.to_string() })?;
            let n = access::read_whole_memory(driver, clock, ctx, part, &mut mem, None)?;
            writer.write_from(&req.file, req.format, &mem, n)?;
            if let Some(m) = part.mem_mut(memory_name) {
                *m = mem;
            }
            Ok(n)
        }
        UpdateOp::Write => {
            let mut mem = part
                .mem(memory_name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownMemory { part: part.id.clone(), memory: memory_name.to_string() })?;
            mem.reset_buffer();
            reader.read_into(&req.file, req.format, &mut mem)?;
            let size = mem.size;
            let n = access::write_whole_memory(driver, clock, ctx, part, &mut mem, size, auto_erase)?;

            if verify_after_write {
                let expected = mem.clone();
                let mut readback = mem.clone();
                access::read_whole_memory(driver, clock, ctx, part, &mut readback, Some(&expected))?;
                match verify::verify_memory(&expected, &readback, n) {
                    VerifyOutcome::Match { .. } => {}
                    VerifyOutcome::MatchWithUnusedBitWarnings { warnings, .. } => {
                        for w in &warnings {
                            log::warn!(
                                "ignoring mismatch in unused bits of \"{memory_name}\" at {:#06x} (programmer returns unused bits as {})",
                                w.addr,
                                if w.programmer_returns_zero { 0 } else { 1 }
                            );
                        }
                    }
                    VerifyOutcome::Mismatch { addr, expected, actual } => {
                        return Err(CoreError::VerifyMismatch { memory: memory_name.to_string(), addr: addr as u32, expected, actual });
                    }
                }
            }

            if let Some(m) = part.mem_mut(memory_name) {
                *m = mem;
            }
            Ok(n)
        }
        UpdateOp::Verify => {
            let mut expected = part
                .mem(memory_name)
                .cloned()
                .ok_or_else(|| CoreError::UnknownMemory { part: part.id.clone(), memory: memory_name.to_string() })?;
            expected.reset_buffer();
            reader.read_into(&req.file, req.format, &mut expected)?;

            let mut actual = expected.clone();
            let n = access::read_whole_memory(driver, clock, ctx, part, &mut actual, Some(&expected))?;

            match verify::verify_memory(&expected, &actual, n) {
                VerifyOutcome::Match { verified } | VerifyOutcome::MatchWithUnusedBitWarnings { verified, .. } => Ok(verified),
                VerifyOutcome::Mismatch { addr, expected, actual } => {
                    Err(CoreError::VerifyMismatch { memory: memory_name.to_string(), addr: addr as u32, expected, actual })
                }
            }
        }
    }
}
