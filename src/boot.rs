//! Firmware payload loading, grounded on `original_source/mon.c`'s image-load-and-jump
//! sequence.

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use log::info;

use crate::cif::{self, Cif};
use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::net::TcpEndpoint;
use crate::types::{AccessSize, Gea};
use crate::vmm::Vmm;

/// Big-endian firmware payload and its fixed load address / entry point.
const IQUIK_PATH: &str = "iquik.b";
const IQUIK_GRA: u32 = 0x3E_0000;

/// Little-endian firmware payload: the COFF header lands at a fixed
/// window and PC/image-base are derived from the entry point.
const VENEER_PATH: &str = "veneer.exe";
const VENEER_COFF_BASE: u32 = 0x4FE00;
const VENEER_ENTRY: u32 = 0x50000;

/// `R5` on entry points at the CIF trampoline.
const ENTRY_R5: u32 = cif::TRAMPOLINE_GRA;

/// Loads the firmware payload matching `little_endian`, installs the CIF
/// trampoline, loads the device-tree blob, and seeds entry register state.
/// Returns the initialized [`Cif`]. `console` is the already-bound console
/// socket.
pub fn load(
    guest: &mut Guest,
    vmm: &mut Vmm,
    little_endian: bool,
    dtb_path: &Path,
    console: Rc<RefCell<TcpEndpoint>>,
) -> Result<Cif> {
    let entry_pc = if little_endian {
        load_veneer(guest, vmm)?
    } else {
        load_iquik(guest, vmm)?
    };

    let dtb = fs::read(dtb_path)?;
    let ram_size = guest.pmem.size();
    let cif = Cif::init(dtb, ram_size, console)?;
    cif.install_trampoline(guest, vmm)?;

    let regs = vmm.regs_mut(guest.active_vm());
    regs.pc = entry_pc;
    regs.gpr[5] = ENTRY_R5;

    info!(target: "pvp::boot", "entry pc=0x{entry_pc:08x}, r5=0x{ENTRY_R5:08x}");
    Ok(cif)
}

fn load_iquik(guest: &mut Guest, vmm: &mut Vmm) -> Result<u32> {
    let image = fs::read(IQUIK_PATH)?;
    write_image(guest, vmm, IQUIK_GRA, &image)?;
    Ok(IQUIK_GRA)
}

/// `veneer.exe`'s COFF header occupies `0x4FE00..0x50000`; the image base
/// is `entry - 0x200`.
fn load_veneer(guest: &mut Guest, vmm: &mut Vmm) -> Result<u32> {
    let image = fs::read(VENEER_PATH)?;
    let image_base = VENEER_ENTRY - 0x200;
    write_image(guest, vmm, image_base, &image)?;
    if image.len() as u32 + image_base < VENEER_COFF_BASE + 0x200 {
        return Err(Error::Invalid);
    }
    Ok(VENEER_ENTRY)
}

fn write_image(guest: &mut Guest, vmm: &mut Vmm, gra_base: u32, image: &[u8]) -> Result<()> {
    for (chunk, off) in image.chunks(4096).zip((0u32..).step_by(4096)) {
        guest.guest_to(vmm, Gea(gra_base + off), chunk, AccessSize::Byte, true)?;
    }
    Ok(())
}
