//! TPI (Tiny Programming Interface) protocol engine.
//!
//! A bit-exact state machine for the two-wire programming protocol used by
//! the smallest AVR-family parts. Every mutating sequence is bracketed by
//! busy-polls to quiescence; invalid calls (byte-write to flash, odd-address
//! write) are rejected before any frame is sent, matching §9's "reject
//! before emitting a frame" design note.

use std::time::Duration;

use crate::capability::ProgrammerDriver;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::registry::{Memory, Part};

// Command opcodes (AVR8 TPI instruction set).
pub const CMD_SLD: u8 = 0x20;
pub const CMD_SLD_PI: u8 = 0x24;
pub const CMD_SST: u8 = 0x60;
pub const CMD_SST_PI: u8 = 0x64;
pub const CMD_SSTPR: u8 = 0x68;
pub const CMD_SIN: u8 = 0x10;
pub const CMD_SOUT: u8 = 0x90;
pub const CMD_SLDCS: u8 = 0x80;
pub const CMD_SSTCS: u8 = 0xC0;
pub const CMD_SKEY: u8 = 0xE0;

// I/O register addresses (6-bit space addressed by SIN/SOUT).
pub const IOREG_NVMCSR: u8 = 0x32;
pub const IOREG_NVMCMD: u8 = 0x33;

// Control/status register addresses (4-bit space addressed by SLDCS/SSTCS).
pub const REG_TPISR: u8 = 0x00;
pub const REG_TPIPCR: u8 = 0x02;
pub const REG_TPIIR: u8 = 0x0F;

pub const TPISR_NVMEN: u8 = 0x02;
pub const NVMCSR_NVMBSY: u8 = 0x80;

pub const IDENT_CODE: u8 = 0x80;

pub const NVMCMD_NO_OPERATION: u8 = 0x00;
pub const NVMCMD_CHIP_ERASE: u8 = 0x10;
pub const NVMCMD_SECTION_ERASE: u8 = 0x14;
pub const NVMCMD_WORD_WRITE: u8 = 0x1D;

/// The fixed 8-byte NVM program-enable key.
pub const SKEY: [u8; 8] = [0xFF, 0x88, 0xD8, 0xCD, 0x45, 0xAB, 0x89, 0x12];

fn sio_addr(cmd: u8, ioreg: u8) -> u8 {
    cmd | ((ioreg & 0x0F) << 1) | ((ioreg & 0x10) >> 4)
}

fn cs_addr(cmd: u8, reg: u8) -> u8 {
    cmd | (reg & 0x0F)
}

fn send(driver: &mut impl ProgrammerDriver, out: &[u8]) -> CoreResult<()> {
    driver.cmd_tpi(out, &mut [])?;
    Ok(())
}

fn send_recv1(driver: &mut impl ProgrammerDriver, out: &[u8]) -> CoreResult<u8> {
    let mut resp = [0u8; 1];
    driver.cmd_tpi(out, &mut resp)?;
    Ok(resp[0])
}

/// One-shot NVM-busy query: `true` means the NVM controller is still
/// executing an erase or write.
pub fn poll_nvmbsy(driver: &mut impl ProgrammerDriver) -> CoreResult<bool> {
    let status = send_recv1(driver, &[sio_addr(CMD_SIN, IOREG_NVMCSR)])?;
    Ok(status & NVMCSR_NVMBSY != 0)
}

/// Block until the NVM controller reports idle or `max_wait` elapses.
/// Bounded by a monotonic deadline (§5) rather than spinning forever.
pub fn wait_nvmbsy_idle(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    max_wait: Duration,
) -> CoreResult<()> {
    let deadline = clock.now() + max_wait;
    let poll_interval = (max_wait / 10).max(Duration::from_micros(1));
    loop {
        if !poll_nvmbsy(driver)? {
            return Ok(());
        }
        if clock.now() >= deadline {
            return Err(CoreError::TpiProtocol(
                "NVM controller did not go idle before the worst-case write delay elapsed".into(),
            ));
        }
        clock.sleep(poll_interval);
    }
}

/// Program-enable handshake, performed once per session before any other
/// TPI traffic.
pub fn program_enable(driver: &mut impl ProgrammerDriver, guard_time: u8) -> CoreResult<()> {
    send(driver, &[cs_addr(CMD_SSTCS, REG_TPIPCR), guard_time])?;

    let ident = send_recv1(driver, &[cs_addr(CMD_SLDCS, REG_TPIIR)])?;
    if ident != IDENT_CODE {
        return Err(CoreError::TpiProtocol("TPIIR not correct".into()));
    }

    let mut key_frame = Vec::with_capacity(1 + SKEY.len());
    key_frame.push(CMD_SKEY);
    key_frame.extend_from_slice(&SKEY);
    send(driver, &key_frame)?;

    for _ in 0..10 {
        let status = send_recv1(driver, &[cs_addr(CMD_SLDCS, REG_TPISR)])?;
        if status & TPISR_NVMEN != 0 {
            return Ok(());
        }
    }

    Err(CoreError::TpiProtocol(
        "target does not reply: error enabling TPI external programming mode".into(),
    ))
}

/// Set NVMCMD, then the 16-bit pointer register low half then high half, to
/// `mem.offset + addr`.
fn setup_rw(driver: &mut impl ProgrammerDriver, mem: &Memory, addr: u32, nvmcmd: u8) -> CoreResult<()> {
    send(driver, &[sio_addr(CMD_SOUT, IOREG_NVMCMD), nvmcmd])?;
    let ptr = mem.offset.wrapping_add(addr);
    send(driver, &[CMD_SSTPR | 0, (ptr & 0xFF) as u8])?;
    send(driver, &[CMD_SSTPR | 1, ((ptr >> 8) & 0xFF) as u8])?;
    Ok(())
}

/// Erase the whole device. Requires a `flash` memory to size the pointer
/// register from.
pub fn chip_erase(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    part: &Part,
) -> CoreResult<()> {
    let mem = part.mem("flash").ok_or_else(|| {
        CoreError::Fatal(format!("no flash memory to erase for part {}", part.desc))
    })?;

    wait_nvmbsy_idle(driver, clock, Duration::from_micros(mem.max_write_delay_us))?;

    send(driver, &[CMD_SSTPR | 0, ((mem.offset & 0xFF) | 1) as u8])?;
    send(driver, &[CMD_SSTPR | 1, ((mem.offset >> 8) & 0xFF) as u8])?;
    send(driver, &[sio_addr(CMD_SOUT, IOREG_NVMCMD), NVMCMD_CHIP_ERASE])?;
    send(driver, &[CMD_SST, 0xFF])?;

    wait_nvmbsy_idle(driver, clock, Duration::from_micros(mem.max_write_delay_us))
}

/// Read one byte through the TPI pointer register.
pub fn read_byte(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    mem: &Memory,
    addr: u32,
) -> CoreResult<u8> {
    wait_nvmbsy_idle(driver, clock, Duration::from_micros(mem.max_write_delay_us))?;
    setup_rw(driver, mem, addr, NVMCMD_NO_OPERATION)?;
    send_recv1(driver, &[CMD_SLD])
}

/// Write one byte through the TPI pointer register. Rejects flash writes
/// and odd-address writes before sending anything, and performs a
/// section-erase before a fuse write.
pub fn write_byte(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    part: &Part,
    mem: &Memory,
    addr: u32,
    data: u8,
) -> CoreResult<()> {
    if mem.name == "flash" {
        return Err(CoreError::TpiProtocol(format!(
            "writing a byte to flash is not supported for {}",
            part.desc
        )));
    }
    if (mem.offset + addr) & 1 != 0 {
        return Err(CoreError::TpiProtocol(format!(
            "writing a byte to an odd location is not supported for {}",
            part.desc
        )));
    }

    let max_wait = Duration::from_micros(mem.max_write_delay_us);
    wait_nvmbsy_idle(driver, clock, max_wait)?;

    if mem.name == "fuse" {
        setup_rw(driver, mem, addr | 1, NVMCMD_SECTION_ERASE)?;
        send(driver, &[CMD_SST, 0xFF])?;
        wait_nvmbsy_idle(driver, clock, max_wait)?;
    }

    setup_rw(driver, mem, addr, NVMCMD_WORD_WRITE)?;
    send(driver, &[CMD_SST_PI, data])?;
    send(driver, &[CMD_SST_PI, data])?;
    wait_nvmbsy_idle(driver, clock, max_wait)
}

/// Stream the whole memory via `SLD_PI`, re-seating the pointer whenever
/// the read cursor has skipped an unallocated cell. `want` returns whether
/// cell `i` must actually be read from the device.
pub fn paged_load(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    mem: &mut Memory,
    mut want: impl FnMut(usize) -> bool,
    mut on_progress: impl FnMut(usize, usize),
) -> CoreResult<()> {
    wait_nvmbsy_idle(driver, clock, Duration::from_micros(mem.max_write_delay_us))?;
    setup_rw(driver, mem, 0, NVMCMD_NO_OPERATION)?;

    let mut lastaddr = 0usize;
    for i in 0..mem.size {
        if want(i) {
            if lastaddr != i {
                setup_rw(driver, mem, i as u32, NVMCMD_NO_OPERATION)?;
                lastaddr = i;
            }
            let byte = send_recv1(driver, &[CMD_SLD_PI]).map_err(|_| CoreError::SoftFail {
                memory: mem.name.clone(),
                addr: i as u32,
                detail: "TPI post-increment load failed".into(),
            })?;
            mem.buf[i] = byte;
            lastaddr += 1;
        }
        on_progress(i, mem.size);
    }
    Ok(())
}

/// Stream allocated word pairs via `SST_PI`, re-seating the pointer only
/// when the cursor has moved since the previous streamed address.
pub fn paged_write(
    driver: &mut impl ProgrammerDriver,
    clock: &mut impl Clock,
    mem: &Memory,
    wsize: usize,
    mut on_progress: impl FnMut(usize, usize),
) -> CoreResult<usize> {
    wait_nvmbsy_idle(driver, clock, Duration::from_micros(mem.max_write_delay_us))?;
    setup_rw(driver, mem, 0, NVMCMD_WORD_WRITE)?;

    let wsize = if wsize & 1 != 0 { wsize + 1 } else { wsize };
    let mut lastaddr = 0usize;
    let mut i = 0usize;
    while i < wsize {
        let hi = (i + 1).min(mem.size - 1);
        let allocated = mem.tags[i].bits() != 0 || mem.tags.get(hi).map_or(false, |t| t.bits() != 0);
        if allocated {
            if lastaddr != i {
                setup_rw(driver, mem, i as u32, NVMCMD_WORD_WRITE)?;
                lastaddr = i;
            }
            send(driver, &[CMD_SST_PI, mem.buf[i]])?;
            send(driver, &[CMD_SST_PI, mem.buf[hi]])?;
            lastaddr += 2;
            wait_nvmbsy_idle(driver, clock, Duration::from_micros(mem.max_write_delay_us))?;
        }
        on_progress(i, wsize);
        i += 2;
    }
    Ok(wsize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ConnectionKind, Indicator};
    use crate::clock::testutil::MockClock;
    use crate::registry::{Memory, Part};

    /// A fake TPI-only driver that records every `cmd_tpi` frame it sees
    /// and simulates the NVM controller going idle after one busy-poll.
    struct FakeTpiDriver {
        frames: Vec<Vec<u8>>,
        busy_polls_remaining: u32,
        flash: Vec<u8>,
        pointer: u32,
    }

    impl FakeTpiDriver {
        fn new() -> Self {
            FakeTpiDriver {
                frames: Vec::new(),
                busy_polls_remaining: 0,
                flash: vec![0xFF; 64],
                pointer: 0,
            }
        }
    }

    impl ProgrammerDriver for FakeTpiDriver {
        fn connection_kind(&self) -> ConnectionKind {
            ConnectionKind::Serial
        }
        fn open(&mut self, _port: &str) -> CoreResult<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn enable(&mut self) {}
        fn disable(&mut self) {}
        fn initialize(&mut self, _part: &Part) -> CoreResult<()> {
            Ok(())
        }
        fn chip_erase(&mut self, _part: &Part) -> CoreResult<()> {
            Ok(())
        }
        fn cmd(&mut self, _cmd: &[u8; 4]) -> CoreResult<[u8; 4]> {
            Ok([0; 4])
        }
        fn cmd_tpi(&mut self, out: &[u8], resp: &mut [u8]) -> CoreResult<usize> {
            self.frames.push(out.to_vec());
            match out.first().copied() {
                Some(op) if op == sio_addr(CMD_SIN, IOREG_NVMCSR) => {
                    let busy = self.busy_polls_remaining > 0;
                    if self.busy_polls_remaining > 0 {
                        self.busy_polls_remaining -= 1;
                    }
                    resp[0] = if busy { NVMCSR_NVMBSY } else { 0 };
                }
                Some(op) if op == cs_addr(CMD_SLDCS, REG_TPIIR) => {
                    resp[0] = IDENT_CODE;
                }
                Some(op) if op == cs_addr(CMD_SLDCS, REG_TPISR) => {
                    resp[0] = TPISR_NVMEN;
                }
                Some(op) if op == (CMD_SSTPR | 0) => self.pointer = (self.pointer & !0xFF) | out[1] as u32,
                Some(op) if op == (CMD_SSTPR | 1) => {
                    self.pointer = (self.pointer & 0xFF) | ((out[1] as u32) << 8)
                }
                Some(op) if op == CMD_SLD => resp[0] = self.flash[self.pointer as usize % self.flash.len()],
                _ => {}
            }
            Ok(resp.len())
        }
        fn read_byte(&mut self, _part: &Part, _mem: &Memory, _addr: u32) -> CoreResult<u8> {
            unimplemented!()
        }
        fn write_byte(&mut self, _part: &Part, _mem: &Memory, _addr: u32, _data: u8) -> CoreResult<()> {
            unimplemented!()
        }
        fn write_page(&mut self, _part: &Part, _mem: &Memory, _addr: u32) -> CoreResult<()> {
            Ok(())
        }
        fn set_indicator(&mut self, _indicator: Indicator, _on: bool) {}
    }

    #[test]
    fn program_enable_fails_when_ident_mismatches() {
        struct BadIdent;
        impl ProgrammerDriver for BadIdent {
            fn connection_kind(&self) -> ConnectionKind {
                ConnectionKind::Serial
            }
            fn open(&mut self, _: &str) -> CoreResult<()> {
                Ok(())
            }
            fn close(&mut self) {}
            fn enable(&mut self) {}
            fn disable(&mut self) {}
            fn initialize(&mut self, _: &Part) -> CoreResult<()> {
                Ok(())
            }
            fn chip_erase(&mut self, _: &Part) -> CoreResult<()> {
                Ok(())
            }
            fn cmd(&mut self, _: &[u8; 4]) -> CoreResult<[u8; 4]> {
                Ok([0; 4])
            }
            fn cmd_tpi(&mut self, _out: &[u8], resp: &mut [u8]) -> CoreResult<usize> {
                if !resp.is_empty() {
                    resp[0] = 0x00; // wrong ident
                }
                Ok(resp.len())
            }
            fn read_byte(&mut self, _: &Part, _: &Memory, _: u32) -> CoreResult<u8> {
                unimplemented!()
            }
            fn write_byte(&mut self, _: &Part, _: &Memory, _: u32, _: u8) -> CoreResult<()> {
                unimplemented!()
            }
            fn write_page(&mut self, _: &Part, _: &Memory, _: u32) -> CoreResult<()> {
                Ok(())
            }
        }
        let mut d = BadIdent;
        let err = program_enable(&mut d, 128).unwrap_err();
        assert!(matches!(err, CoreError::TpiProtocol(_)));
    }

    #[test]
    fn fuse_write_emits_scenario_1_frame_sequence() {
        let mut driver = FakeTpiDriver::new();
        driver.busy_polls_remaining = 0;
        let mut clock = MockClock::default();

        let mut part = Part::new("attiny4", "ATtiny4");
        part.prog_modes = crate::registry::ProgModes::TPI;
        let fuse = Memory::new("fuse", 1)
            .with_offset(0x3F40)
            .with_max_write_delay_us(10_000);
        part.memories.push(fuse);
        let mem = part.mem("fuse").unwrap().clone();

        write_byte(&mut driver, &mut clock, &part, &mem, 0, 0xE7).unwrap();

        // First frame is the busy poll; then SECTION_ERASE setup, SST
        // trigger, a busy poll, WORD_WRITE setup, two SST_PI writes, and a
        // final busy poll.
        let ops: Vec<u8> = driver.frames.iter().map(|f| f[0]).collect();
        assert_eq!(
            ops,
            vec![
                sio_addr(CMD_SIN, IOREG_NVMCSR), // busy-poll until idle
                sio_addr(CMD_SOUT, IOREG_NVMCMD), // NVMCMD := SECTION_ERASE
                CMD_SSTPR | 0,
                CMD_SSTPR | 1,
                CMD_SST, // SST 0xFF triggers the erase
                sio_addr(CMD_SIN, IOREG_NVMCSR), // busy-poll
                sio_addr(CMD_SOUT, IOREG_NVMCMD), // NVMCMD := WORD_WRITE
                CMD_SSTPR | 0,
                CMD_SSTPR | 1,
                CMD_SST_PI,
                CMD_SST_PI,
                sio_addr(CMD_SIN, IOREG_NVMCSR), // final busy-poll
            ]
        );

        // SECTION_ERASE pointer: low byte carries addr|1, high byte unchanged.
        assert_eq!(driver.frames[2][1], 0x41);
        assert_eq!(driver.frames[3][1], 0x3F);
        // WORD_WRITE pointer targets the even fuse address itself.
        assert_eq!(driver.frames[7][1], 0x40);
        assert_eq!(driver.frames[8][1], 0x3F);
        assert_eq!(driver.frames[9][1], 0xE7);
        assert_eq!(driver.frames[10][1], 0xE7);
    }

    #[test]
    fn write_byte_rejects_flash_before_sending_any_frame() {
        let mut driver = FakeTpiDriver::new();
        let mut clock = MockClock::default();
        let mut part = Part::new("attiny4", "ATtiny4");
        part.prog_modes = crate::registry::ProgModes::TPI;
        part.memories.push(Memory::new("flash", 1024).with_page_size(64));
        let mem = part.mem("flash").unwrap().clone();

        let err = write_byte(&mut driver, &mut clock, &part, &mem, 0, 0x11).unwrap_err();
        assert!(matches!(err, CoreError::TpiProtocol(_)));
        assert!(driver.frames.is_empty());
    }

    #[test]
    fn write_byte_rejects_odd_address() {
        let mut driver = FakeTpiDriver::new();
        let mut clock = MockClock::default();
        let mut part = Part::new("attiny4", "ATtiny4");
        part.prog_modes = crate::registry::ProgModes::TPI;
        part.memories.push(Memory::new("eeprom", 64).with_offset(0));
        let mem = part.mem("eeprom").unwrap().clone();

        let err = write_byte(&mut driver, &mut clock, &part, &mem, 1, 0x11).unwrap_err();
        assert!(matches!(err, CoreError::TpiProtocol(_)));
        assert!(driver.frames.is_empty());
    }

    #[test]
    fn wait_nvmbsy_idle_times_out_on_a_stuck_device() {
        let mut driver = FakeTpiDriver::new();
        driver.busy_polls_remaining = u32::MAX;
        let mut clock = MockClock::default();
        let err = wait_nvmbsy_idle(&mut driver, &mut clock, Duration::from_micros(100)).unwrap_err();
        assert!(matches!(err, CoreError::TpiProtocol(_)));
    }
}
