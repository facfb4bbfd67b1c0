//! Memory access engine: the heart of the core.
//!
//! Turns a logical byte/range request against a named memory region into
//! the right sequence of driver calls, honoring paged vs byte access,
//! word-addressed high/low opcode pairs, extended-address prefixes,
//! write-completion polling, the trailing-0xff high-water mark, and
//! allocation-tag-gated selective read/verify.

use std::time::Duration;

use crate::capability::ProgrammerDriver;
use crate::clock::Clock;
use crate::context::AccessContext;
use crate::error::{CoreError, CoreResult};
use crate::registry::{is_flash_like, Memory, Op, Part, PartFlags, Tag};
use crate::tpi;

/// Read one cell. TPI parts defer to the TPI byte-read; everything else
/// chooses a read/read-low/read-high opcode, optionally prefixed by a
/// load-extended-address command.
pub fn read_byte_default(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    part: &Part,
    mem: &Memory,
    addr: u32,
) -> CoreResult<u8> {
    if part.is_tpi() {
        return tpi::read_byte(driver, clock, mem, addr);
    }

    let (op, use_addr) = select_rw_pair(mem, addr, Op::ReadLo, Op::ReadHi, Op::Read)
        .ok_or_else(|| CoreError::NotSupported { memory: mem.name.clone() })?;

    if let Some(ext) = mem.op(Op::LoadExtAddr) {
        let cmd = crate::opcode::encode(ext, use_addr, 0);
        driver.cmd(&cmd)?;
    }

    let template = mem.op(op).expect("select_rw_pair only returns ops that exist");
    let cmd = crate::opcode::encode(template, use_addr, 0);
    let resp = driver.cmd(&cmd)?;
    Ok(crate::opcode::decode(template, &resp))
}

/// Pick between a word-addressed low/high pair (halving the address) and a
/// plain byte opcode, returning `None` when neither is present.
fn select_rw_pair(mem: &Memory, addr: u32, lo: Op, hi: Op, plain: Op) -> Option<(Op, u32)> {
    if mem.op(lo).is_some() && mem.op(hi).is_some() {
        let op = if addr & 1 == 0 { lo } else { hi };
        Some((op, addr >> 1))
    } else if mem.op(plain).is_some() {
        Some((plain, addr))
    } else {
        None
    }
}

/// One past the highest non-0xff byte in a flash-like memory, rounded up
/// to an even count. Any other memory, or the session-wide trim
/// kill-switch being off, returns the full size.
pub fn hiaddr(mem: &Memory, ctx: &AccessContext) -> usize {
    if !ctx.trim_trailing_ff() || !is_flash_like(mem) {
        return mem.size;
    }
    let mut top = 0usize;
    for (i, &b) in mem.buf.iter().enumerate() {
        if b != 0xFF {
            top = i + 1;
        }
    }
    if top % 2 != 0 {
        top += 1;
    }
    top
}

fn page_bounds(mem: &Memory, page_idx: usize, limit: usize) -> std::ops::Range<usize> {
    let start = page_idx * mem.page_size;
    let end = (start + mem.page_size).min(limit);
    start..end
}

/// Read an entire memory region, filling cells of interest from the
/// device and leaving the rest at 0xFF. `verify_against`, when present,
/// restricts reads to cells tagged `ALLOCATED` in the corresponding region
/// of that image (selective read).
pub fn read_whole_memory(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    ctx: &mut AccessContext,
    part: &Part,
    mem: &mut Memory,
    verify_against: Option<&Memory>,
) -> CoreResult<usize> {
    mem.reset_buffer();
    let size = mem.size;
    let want = |verify_against: Option<&Memory>, i: usize| {
        verify_against.map_or(true, |v| v.tags[i].contains(Tag::ALLOCATED))
    };

    let mut done = vec![false; size];

    if part.is_tpi() && mem.paged() && mem.page_size > 0 && size % mem.page_size == 0 {
        match tpi::paged_load(driver, clock, mem, |i| want(verify_against, i), |i, total| {
            ctx.report(i as i64, total as i64, Some("Reading"))
        }) {
            Ok(()) => {
                for i in 0..size {
                    if want(verify_against, i) {
                        done[i] = true;
                    }
                }
                return Ok(hiaddr(mem, ctx));
            }
            Err(e) if e.is_soft() => log::warn!("TPI paged read of \"{}\" failed, falling back: {e}", mem.name),
            Err(e) => return Err(e),
        }
    } else if mem.paged() && mem.page_size > 0 && size % mem.page_size == 0 {
        let pages = size / mem.page_size;
        'pages: for p in 0..pages {
            let range = page_bounds(mem, p, size);
            if !range.clone().any(|i| want(verify_against, i)) {
                continue;
            }
            let addr = range.start as u32;
            let mut page_buf = vec![0u8; range.len()];
            match driver.paged_load(part, mem, addr, &mut page_buf) {
                Some(Ok(())) => {
                    mem.buf[range.clone()].copy_from_slice(&page_buf);
                    for i in range.clone() {
                        done[i] = true;
                    }
                    ctx.report(range.end as i64, size as i64, if p == 0 { Some("Reading") } else { None });
                }
                Some(Err(e)) => {
                    log::warn!("paged read of \"{}\" page {p} failed, falling back: {e}", mem.name);
                    break 'pages;
                }
                None => break 'pages,
            }
        }
    } else if mem.name == "signature" {
        if let Some(result) = driver.read_sig_bytes(part, mem) {
            let bytes = result?;
            let n = bytes.len().min(size);
            mem.buf[..n].copy_from_slice(&bytes[..n]);
            for done_flag in done.iter_mut().take(n) {
                *done_flag = true;
            }
        }
    }

    for i in 0..size {
        if done[i] || !want(verify_against, i) {
            continue;
        }
        mem.buf[i] = read_byte_default(driver, clock, part, mem, i as u32)?;
        ctx.report((i + 1) as i64, size as i64, None);
    }

    Ok(hiaddr(mem, ctx))
}

/// Write up to `size` bytes of an already-loaded memory image to the
/// device, committing only cells tagged `ALLOCATED`. Returns the number of
/// bytes attempted (not necessarily all written successfully; per-cell
/// soft failures are logged and do not abort the pass).
pub fn write_whole_memory(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    ctx: &mut AccessContext,
    part: &Part,
    mem: &mut Memory,
    size: usize,
    auto_erase: bool,
) -> CoreResult<usize> {
    let wsize = if size > mem.size {
        log::warn!(
            "{size} bytes requested for \"{}\" which is only {} bytes, truncating",
            mem.name,
            mem.size
        );
        mem.size
    } else {
        size
    };

    if part.is_tpi() {
        if mem.size <= 1 {
            write_byte_default(driver, clock, part, mem, 0, mem.buf[0])?;
            return Ok(1);
        }
        return tpi::paged_write(driver, clock, mem, wsize, |i, total| {
            ctx.report(i as i64, total as i64, Some("Writing"))
        });
    }

    let mut done = vec![false; wsize];

    if mem.paged() && mem.page_size > 0 {
        let pages = (wsize + mem.page_size - 1) / mem.page_size;
        'pages: for p in 0..pages {
            let range = page_bounds(mem, p, wsize);
            let tainted = range.clone().any(|i| mem.tags[i].contains(Tag::ALLOCATED));
            if !tainted {
                continue;
            }

            if auto_erase {
                if let Some(Err(e)) = driver.page_erase(part, mem, range.start as u32) {
                    log::warn!("page erase of \"{}\" page {p} failed: {e}", mem.name);
                }
            }
            match driver.paged_write(part, mem, range.start as u32, &mem.buf[range.clone()]) {
                Some(Ok(())) => {
                    for i in range.clone() {
                        done[i] = true;
                    }
                    ctx.report(range.end as i64, wsize as i64, if p == 0 { Some("Writing") } else { None });
                }
                Some(Err(e)) => {
                    log::warn!("paged write of \"{}\" page {p} failed, falling back: {e}", mem.name);
                    break 'pages;
                }
                None => break 'pages,
            }
        }
    }

    let page_size = if mem.paged() && mem.page_size > 0 { mem.page_size } else { 1 };
    let mut page_tainted = false;
    for i in 0..wsize {
        if !done[i] && mem.tags[i].contains(Tag::ALLOCATED) {
            match write_byte_default(driver, clock, part, mem, i as u32, mem.buf[i]) {
                Ok(()) => {
                    if mem.paged() {
                        page_tainted = true;
                    }
                }
                Err(e) => log::warn!("write error on \"{}\" at offset {i:#06x}: {e}", mem.name),
            }
        }
        let last_of_page = (i + 1) % page_size == 0 || i + 1 == wsize;
        if mem.paged() && last_of_page && page_tainted {
            driver.write_page(part, mem, i as u32)?;
            page_tainted = false;
        }
        ctx.report((i + 1) as i64, wsize as i64, None);
    }

    Ok(wsize)
}

/// Write one cell, honoring the read-before-write optimization and the
/// readback-poll completion policy.
pub fn write_byte_default(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    part: &Part,
    mem: &Memory,
    addr: u32,
    data: u8,
) -> CoreResult<()> {
    if part.is_tpi() {
        return tpi::write_byte(driver, clock, part, mem, addr, data);
    }

    let pre_read_eligible = !mem.paged() && !part.flags.contains(PartFlags::IS_AT90S1200);
    if pre_read_eligible {
        if let Ok(current) = read_byte_default(driver, clock, part, mem, addr) {
            if current == data {
                return Ok(());
            }
        }
    }

    let (op, use_addr) = select_rw_pair(mem, addr, Op::WriteLo, Op::WriteHi, Op::Write)
        .or_else(|| {
            if mem.paged() {
                select_rw_pair(mem, addr, Op::LoadPageLo, Op::LoadPageHi, Op::Write)
            } else {
                None
            }
        })
        .ok_or_else(|| CoreError::NotSupported { memory: mem.name.clone() })?;

    let template = mem.op(op).expect("select_rw_pair only returns ops that exist");
    let cmd = crate::opcode::encode(template, use_addr, data);
    driver.cmd(&cmd)?;

    if mem.paged() {
        return Ok(());
    }

    match poll_for_completion(driver, clock, part, mem, addr, data) {
        Ok(()) => Ok(()),
        Err(CoreError::WriteError { memory, addr, written, read_back }) if mem.power_off_after_write => {
            recover_from_power_off(driver, clock, part, mem, addr, written, read_back)
        }
        Err(e) => Err(e),
    }
}

/// Confirm a just-written byte, by polling readback up to six rounds. A
/// readback sentinel value cannot be distinguished from the
/// pre-programmed state by polling, so it gets one fixed wait instead of a
/// loop.
fn poll_for_completion(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    part: &Part,
    mem: &Memory,
    addr: u32,
    written: u8,
) -> CoreResult<()> {
    let max_wait = Duration::from_micros(mem.max_write_delay_us);
    let is_sentinel = written == mem.readback[0] || written == mem.readback[1];

    let sample = |driver: &mut _, clock: &mut _| read_byte_default(driver, clock, part, mem, addr);

    // No read opcode at all: the caller can't verify completion, so just
    // wait out the worst case.
    match sample(driver, clock) {
        Err(CoreError::NotSupported { .. }) => {
            clock.sleep(max_wait);
            return Ok(());
        }
        Ok(got) if got == written => return Ok(()),
        Ok(_) | Err(_) => {}
    }

    let mut last = 0u8;
    for _round in 0..6 {
        let got = if is_sentinel {
            clock.sleep(max_wait);
            sample(driver, clock)?
        } else {
            let deadline = clock.now() + max_wait;
            let poll_interval = (max_wait / 10).max(Duration::from_micros(1));
            loop {
                let got = sample(driver, clock)?;
                if got == written || clock.now() >= deadline {
                    break got;
                }
                clock.sleep(poll_interval);
            }
        };
        last = got;
        if got == written {
            return Ok(());
        }
    }

    Err(CoreError::WriteError {
        memory: mem.name.clone(),
        addr,
        written,
        read_back: last,
    })
}

fn recover_from_power_off(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    part: &Part,
    mem: &Memory,
    addr: u32,
    written: u8,
    read_back: u8,
) -> CoreResult<()> {
    match driver.powerdown() {
        Some(Ok(())) => {
            clock.sleep(Duration::from_millis(250));
            driver.initialize(part)?;
            poll_for_completion(driver, clock, part, mem, addr, written)
        }
        Some(Err(e)) => Err(e),
        None => Err(CoreError::Fatal(format!(
            "write error on \"{}\" at {addr:#06x} (wrote {written:#04x}, read back {read_back:#04x}) and the programmer has no software power control to recover",
            mem.name
        ))),
    }
}
