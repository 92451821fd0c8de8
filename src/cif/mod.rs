//! CIF (Open Firmware) emulation, grounded on
//! `original_source/rom.c` for the calling convention and the
//! `cif_handler_t` dispatch table — mirrored here by a plain `match` on
//! the service name (one name, one handler, looked up by string).

pub mod claim;
pub mod ihandle;
pub mod services;

use std::rc::Rc;
use std::cell::RefCell;
use std::time::Instant;

use fdt::Fdt;
use log::{trace, warn};

use crate::disk::DiskCache;
use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::net::TcpEndpoint;
use crate::ranges::RangeSet;
use crate::types::{AccessSize, Gea};
use crate::vmm::Vmm;

use claim::ClaimArena;
use ihandle::{IhandleKind, IhandleTable, WrappedKind};

/// Package (device-tree node) handle. Formed by OR-ing [`PHANDLE_MASK`]
/// onto an index into [`Cif`]'s flattened node-path table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phandle(pub u32);

pub const PHANDLE_MASK: u32 = 0x4000_0000;

impl Phandle {
    #[must_use]
    fn index(self) -> usize {
        (self.0 & !PHANDLE_MASK) as usize
    }
}

/// Fixed low guest-real address the CIF trampoline instruction is
/// written to at init.
pub const TRAMPOLINE_GRA: u32 = 0x100;
/// `sc` — the only instruction the trampoline ever holds.
const TRAMPOLINE_INSN: u32 = 0x4402_0002;

pub struct Cif {
    dt: Fdt<'static>,
    paths: Vec<String>,
    ihandles: IhandleTable,
    claim_arena: ClaimArena,
    disks: DiskCache,
    reg: RangeSet,
    available: RangeSet,
    memory_phandle: Phandle,
    mmu_phandle: Phandle,
    pub con_ihandle: u32,
    console: Rc<RefCell<TcpEndpoint>>,
    start: Instant,
}

impl Cif {
    /// Leaks `dtb` to obtain the `'static` backing buffer `Fdt` needs;
    /// the blob lives for the process lifetime, same as the source's
    /// single static device-tree pointer.
    pub fn init(dtb: Vec<u8>, ram_size: u32, console: Rc<RefCell<TcpEndpoint>>) -> Result<Self> {
        let bytes: &'static [u8] = Box::leak(dtb.into_boxed_slice());
        let dt = Fdt::new(bytes).map_err(|_| Error::Invalid)?;

        let mut paths = Vec::new();
        walk(dt.find_node("/").ok_or(Error::NotFound)?, "/".to_string(), &mut paths);

        let memory_phandle = find_phandle(&paths, "/mem").ok_or(Error::NotFound)?;
        let mmu_phandle = find_phandle(&paths, "/mmu").ok_or(Error::NotFound)?;
        find_phandle(&paths, "/con").ok_or(Error::NotFound)?;

        let mut reg = RangeSet::new();
        reg.add(0, ram_size - 1);
        let mut available = RangeSet::new();
        available.add(0, ram_size - 1);

        let mut ihandles = IhandleTable::new();
        let con_ihandle = ihandles.insert(IhandleKind::Wrapped(WrappedKind::Console(Rc::clone(&console))));

        Ok(Self {
            dt,
            paths,
            ihandles,
            claim_arena: ClaimArena::new(ram_size),
            disks: DiskCache::new(),
            reg,
            available,
            memory_phandle,
            mmu_phandle,
            con_ihandle,
            console,
            start: Instant::now(),
        })
    }

    fn path_of(&self, phandle: Phandle) -> Result<&str> {
        self.paths.get(phandle.index()).map(String::as_str).ok_or(Error::NotFound)
    }

    fn phandle_of(&self, path: &str) -> Option<Phandle> {
        find_phandle(&self.paths, path)
    }

    /// Install the CIF trampoline instruction at [`TRAMPOLINE_GRA`].
    pub fn install_trampoline(&self, guest: &mut Guest, vmm: &mut Vmm) -> Result<()> {
        guest.guest_to(vmm, Gea(TRAMPOLINE_GRA), &TRAMPOLINE_INSN.to_be_bytes(), AccessSize::Word, true)?;
        Ok(())
    }

    /// `milliseconds` service backing: wall-clock since [`Cif::init`].
    fn milliseconds(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    pub fn console_poll_accept(&mut self) -> Result<()> {
        self.console.borrow_mut().poll_accept()
    }

    /// `entry_lr` is the guest's LR at the moment of the trap — PC is
    /// set to it on return, matching the IEEE-1275 CIF ABI.
    pub fn dispatch(&mut self, guest: &mut Guest, vmm: &mut Vmm, fault_pc: u32) -> Result<()> {
        if fault_pc != TRAMPOLINE_GRA + 4 {
            return Err(Error::NotRomCall);
        }

        let regs = vmm.regs(guest.active_vm());
        let cia_gea = regs.gpr[3];
        let entry_lr = regs.lr;

        // Cell 0: service-name GEA. Cells 1/2: input/output counts.
        let mut cell0 = [0u8; 4];
        guest.guest_from(vmm, Gea(cia_gea), &mut cell0, AccessSize::Word, false, true)?;
        let name_gea = u32::from_be_bytes(cell0);

        let mut header = [0u8; 8];
        guest.guest_from(vmm, Gea(cia_gea + 4), &mut header, AccessSize::Word, false, true)?;
        let n_in = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let n_out = u32::from_be_bytes(header[4..8].try_into().unwrap());

        let mut name_buf = [0u8; 64];
        let name_len = guest.guest_from(vmm, Gea(name_gea), &mut name_buf, AccessSize::Byte, true, true)? as usize;
        let name = std::str::from_utf8(&name_buf[..name_len]).map_err(|_| Error::Invalid)?;

        let mut inputs = vec![0u32; n_in as usize];
        for (i, slot) in inputs.iter_mut().enumerate() {
            let cell_gea = cia_gea + (3 + i as u32) * 4;
            let mut cell = [0u8; 4];
            guest.guest_from(vmm, Gea(cell_gea), &mut cell, AccessSize::Word, false, true)?;
            *slot = u32::from_be_bytes(cell);
        }

        trace!(target: "pvp::cif", "dispatch {name}({inputs:?})");

        let result = services::dispatch(self, guest, vmm, name, &inputs);

        match result {
            Ok(outputs) => {
                for (i, v) in outputs.iter().take(n_out as usize).enumerate() {
                    let cell_gea = cia_gea + (3 + n_in + i as u32) * 4;
                    guest.guest_to(vmm, Gea(cell_gea), &v.to_be_bytes(), AccessSize::Word, true)?;
                }
                vmm.regs_mut(guest.active_vm()).gpr[3] = 0;
            }
            Err(Error::Shutdown) => return Err(Error::Shutdown),
            Err(e) => {
                warn!(target: "pvp::cif", "service '{name}' failed: {e}");
                vmm.regs_mut(guest.active_vm()).gpr[3] = u32::MAX;
            }
        }

        vmm.regs_mut(guest.active_vm()).pc = entry_lr;
        Ok(())
    }
}

fn walk(node: fdt::node::FdtNode<'_, '_>, path: String, out: &mut Vec<String>) {
    out.push(path.clone());
    for child in node.children() {
        let child_path = if path == "/" {
            format!("/{}", child.name())
        } else {
            format!("{path}/{}", child.name())
        };
        walk(child, child_path, out);
    }
}

fn find_phandle(paths: &[String], path: &str) -> Option<Phandle> {
    paths.iter().position(|p| p == path).map(|i| Phandle(i as u32 | PHANDLE_MASK))
}
