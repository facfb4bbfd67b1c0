//! Shared `ProgrammerDriver` test double, reused across the integration
//! tests in this directory.
//!
//! `cmd` (the generic ISP-style opcode dispatch the access engine uses for
//! both the plain byte path and the byte-at-a-time paged-write fallback)
//! has no memory parameter, so this double remembers the name of the last
//! memory any other capability call touched and addresses that memory's
//! buffer via `cmd`'s address lane (byte 1) and data lane (byte 3). Call
//! `with_active_memory` up front for a session that only ever touches one
//! memory through the plain byte path.

use std::cell::RefCell;
use std::collections::HashMap;

use mcuprog_core::error::{CoreError, CoreResult};
use mcuprog_core::{ConnectionKind, Indicator, Memory, Part, ProgrammerDriver};

#[derive(Default)]
pub struct MockProgrammer {
    pub cells: HashMap<String, Vec<u8>>,
    /// Page index (0-based) at which `paged_write` should report failure,
    /// per memory name — exercises the paged-write-fallback path (scenario
    /// 3 of the spec).
    pub fail_paged_write_at_page: HashMap<String, usize>,
    pub paged_write_calls: RefCell<Vec<(String, u32)>>,
    pub byte_write_calls: RefCell<Vec<(String, u32, u8)>>,
    pub chip_erase_called: RefCell<bool>,
    active: RefCell<Option<String>>,
}

impl MockProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(mut self, mem: &str, data: Vec<u8>) -> Self {
        self.cells.insert(mem.to_string(), data);
        self
    }

    pub fn fail_paged_write_on(mut self, mem: &str, page: usize) -> Self {
        self.fail_paged_write_at_page.insert(mem.to_string(), page);
        self
    }

    pub fn with_active_memory(self, mem: &str) -> Self {
        *self.active.borrow_mut() = Some(mem.to_string());
        self
    }

    fn buf_for<'a>(cells: &'a mut HashMap<String, Vec<u8>>, mem: &Memory) -> &'a mut Vec<u8> {
        cells.entry(mem.name.clone()).or_insert_with(|| vec![0xFF; mem.size])
    }

    pub fn snapshot(&self, mem: &str) -> Vec<u8> {
        self.cells.get(mem).cloned().unwrap_or_default()
    }
}

impl ProgrammerDriver for MockProgrammer {
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
        *self.chip_erase_called.borrow_mut() = true;
        for buf in self.cells.values_mut() {
            buf.fill(0xFF);
        }
        Ok(())
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> CoreResult<[u8; 4]> {
        let active = self.active.borrow().clone();
        let Some(name) = active else {
            return Ok([0, 0, 0, 0xFF]);
        };
        let buf = self.cells.entry(name).or_insert_with(Vec::new);
        let addr = cmd[1] as usize;
        let data = cmd[3];
        if buf.len() <= addr {
            buf.resize(addr + 1, 0xFF);
        }
        if data != 0 {
            buf[addr] = data;
            Ok([0; 4])
        } else {
            Ok([0, 0, 0, buf[addr]])
        }
    }

    fn cmd_tpi(&mut self, _out: &[u8], resp: &mut [u8]) -> CoreResult<usize> {
        Ok(resp.len())
    }

    fn read_byte(&mut self, _part: &Part, mem: &Memory, addr: u32) -> CoreResult<u8> {
        *self.active.borrow_mut() = Some(mem.name.clone());
        let buf = Self::buf_for(&mut self.cells, mem);
        Ok(buf.get(addr as usize).copied().unwrap_or(0xFF))
    }

    fn write_byte(&mut self, _part: &Part, mem: &Memory, addr: u32, data: u8) -> CoreResult<()> {
        *self.active.borrow_mut() = Some(mem.name.clone());
        self.byte_write_calls.borrow_mut().push((mem.name.clone(), addr, data));
        let buf = Self::buf_for(&mut self.cells, mem);
        if let Some(cell) = buf.get_mut(addr as usize) {
            *cell = data;
        }
        Ok(())
    }

    fn write_page(&mut self, _part: &Part, _mem: &Memory, _addr: u32) -> CoreResult<()> {
        Ok(())
    }

    fn paged_write(&mut self, _part: &Part, mem: &Memory, page_addr: u32, page: &[u8]) -> Option<CoreResult<()>> {
        *self.active.borrow_mut() = Some(mem.name.clone());
        let page_idx = page_addr as usize / mem.page_size.max(1);
        self.paged_write_calls.borrow_mut().push((mem.name.clone(), page_addr));

        if self.fail_paged_write_at_page.get(&mem.name) == Some(&page_idx) {
            return Some(Err(CoreError::SoftFail {
                memory: mem.name.clone(),
                addr: page_addr,
                detail: "simulated paged-write failure".into(),
            }));
        }

        let buf = Self::buf_for(&mut self.cells, mem);
        let end = (page_addr as usize + page.len()).min(buf.len());
        buf[page_addr as usize..end].copy_from_slice(&page[..end - page_addr as usize]);
        Some(Ok(()))
    }

    fn set_indicator(&mut self, _indicator: Indicator, _on: bool) {}
}
