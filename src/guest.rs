//! Guest Core: per-guest CPU state, endian policy, MSR shadow, the two
//! double-buffered VMM contexts, translation, and byte-granular transfers.
//!
//! Grounded on `original_source/guest.c` for the init sequence and register
//! seeding. The mutable per-guest record lives here as one owning struct
//! instead of a file-scope singleton.

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::mmu_ranges::MmuRangeMap;
use crate::pmem::Pmem;
use crate::types::{AccessSize, Gea, Gra};
use crate::vmm::regs::{self, msr, HID0_601_RESET, HID0_LE_BIT, PVR_601, SDR1_MAGIC_ROM_MODE};
use crate::vmm::{ExitReason, Prot, Vmm, VmHandle};

/// Which double-buffered hypervisor context is currently active, selected
/// by the effective `MSR_IR|MSR_DR` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveContext {
    MmuOff,
    MmuOn,
}

/// The process-wide guest: CPU/MMU state, endian policy, and the two
/// hypervisor contexts; constructed once by the bootstrap and threaded
/// through the rest of the monitor by reference.
pub struct Guest {
    pub little_endian: bool,
    pub pmem: Pmem,
    pub mmu_ranges: MmuRangeMap,

    pvr: u32,
    shadow_msr: u32,
    mon_msr: u32,
    sdr1: u32,
    srr0: u32,
    srr1: u32,
    sr: [u32; 16],
    ubat: [(u32, u32); 4],
    sprg: [u32; 4],
    hid0: u32,

    mmu_off_vm: VmHandle,
    mmu_on_vm: VmHandle,
    active: ActiveContext,

    single_step: bool,
}

impl Guest {
    pub fn init(vmm: &mut Vmm, little_endian: bool, ram_bytes: u32) -> Result<Self> {
        vmm.init()?;
        let mmu_off_vm = vmm.init_vm()?;
        let mmu_on_vm = vmm.init_vm()?;
        let pmem = Pmem::init(ram_bytes, little_endian)?;

        let mut sr = [0u32; 16];
        for (i, slot) in sr.iter_mut().enumerate() {
            *slot = (i as u32) << regs::SR_VSID_SHIFT;
        }

        let hid0 = HID0_601_RESET | if little_endian { HID0_LE_BIT } else { 0 };

        let mon_msr = if little_endian { msr::LE } else { 0 };

        let mut guest = Self {
            little_endian,
            pmem,
            mmu_ranges: MmuRangeMap::new(),
            pvr: PVR_601,
            shadow_msr: 0,
            mon_msr,
            sdr1: SDR1_MAGIC_ROM_MODE,
            srr0: 0,
            srr1: 0,
            sr,
            ubat: [(0, 0); 4],
            sprg: [0; 4],
            hid0,
            mmu_off_vm,
            mmu_on_vm,
            active: ActiveContext::MmuOff,
            single_step: false,
        };

        let mut initial_msr = msr::ME | msr::EP | msr::IR | msr::DR;
        if little_endian {
            initial_msr |= msr::LE;
        }
        guest.set_msr(vmm, initial_msr)?;
        debug!(target: "pvp::guest", "guest core initialized: {} MiB RAM, {}", ram_bytes / (1024 * 1024), if little_endian { "LE" } else { "BE" });
        Ok(guest)
    }

    #[must_use]
    pub fn pvr(&self) -> u32 {
        self.pvr
    }

    #[must_use]
    pub fn srr0(&self) -> u32 {
        self.srr0
    }

    #[must_use]
    pub fn srr1(&self) -> u32 {
        self.srr1
    }

    pub fn set_srr0(&mut self, v: u32) {
        self.srr0 = v;
    }

    pub fn set_srr1(&mut self, v: u32) {
        self.srr1 = v;
    }

    #[must_use]
    pub fn sr(&self, i: usize) -> u32 {
        self.sr[i]
    }

    pub fn set_sr(&mut self, i: usize, v: u32) {
        self.sr[i] = v;
    }

    #[must_use]
    pub fn ubat(&self, i: usize) -> (u32, u32) {
        self.ubat[i]
    }

    pub fn set_ubat(&mut self, i: usize, upper: u32, lower: u32) {
        self.ubat[i] = (upper, lower);
    }

    #[must_use]
    pub fn sprg(&self, i: usize) -> u32 {
        self.sprg[i]
    }

    pub fn set_sprg(&mut self, i: usize, v: u32) {
        self.sprg[i] = v;
    }

    #[must_use]
    pub fn sdr1(&self) -> u32 {
        self.sdr1
    }

    #[must_use]
    pub fn shadow_msr(&self) -> u32 {
        self.shadow_msr
    }

    #[must_use]
    pub fn active_vm(&self) -> VmHandle {
        match self.active {
            ActiveContext::MmuOff => self.mmu_off_vm,
            ActiveContext::MmuOn => self.mmu_on_vm,
        }
    }

    /// `MTSPR SDR1`. Out-of-ROM-mode transitions unmap prior firmware
    /// mappings since they were never validated against a real HTAB.
    pub fn set_sdr1(&mut self, vmm: &mut Vmm, new: u32) -> Result<()> {
        if self.sdr1 == SDR1_MAGIC_ROM_MODE && new != SDR1_MAGIC_ROM_MODE {
            warn!(target: "pvp::guest", "SDR1 leaving ROM-mode sentinel (0x{new:08x}); unmapping firmware mappings");
            vmm.unmap_all(self.mmu_off_vm)?;
            vmm.unmap_all(self.mmu_on_vm)?;
        }
        self.sdr1 = new;
        Ok(())
    }

    /// Re-derives the effective MSR from the shadow value plus the
    /// monitor-forced bits, and flips the active hypervisor context if
    /// `MSR_IR`/`MSR_DR` changed.
    pub fn set_msr(&mut self, vmm: &mut Vmm, new: u32) -> Result<()> {
        let ir = new & msr::IR != 0;
        let dr = new & msr::DR != 0;
        assert!(ir == dr, "MSR_IR and MSR_DR must agree (new=0x{new:08x})");

        let wants = if ir { ActiveContext::MmuOn } else { ActiveContext::MmuOff };
        if wants != self.active {
            let (from, to) = match wants {
                ActiveContext::MmuOn => (self.mmu_off_vm, self.mmu_on_vm),
                ActiveContext::MmuOff => (self.mmu_on_vm, self.mmu_off_vm),
            };
            vmm.copy_process_state(from, to);
            self.active = wants;
        }

        self.shadow_msr = new;
        let effective = new | self.mon_msr;
        vmm.regs_mut(self.active_vm()).msr = effective;
        debug_assert_eq!(effective & self.mon_msr, self.mon_msr);
        trace!(target: "pvp::guest", "set_msr: shadow=0x{new:08x} mon=0x{:08x} effective=0x{effective:08x}", self.mon_msr);
        Ok(())
    }

    /// Flip `mon_msr.SE` and re-program the effective MSR.
    pub fn set_single_step(&mut self, vmm: &mut Vmm, enabled: bool) -> Result<()> {
        self.single_step = enabled;
        if enabled {
            self.mon_msr |= msr::SE;
        } else {
            self.mon_msr &= !msr::SE;
        }
        let shadow = self.shadow_msr;
        self.set_msr(vmm, shadow)
    }

    #[must_use]
    pub fn single_stepping(&self) -> bool {
        self.single_step
    }

    /// `fast_path` is disabled during fault entry, where the hypervisor's
    /// own shadow mapping is exactly what's missing.
    pub fn backmap(&self, vmm: &mut Vmm, ea: Gea, fast_path: bool) -> Result<Gra> {
        let mmu_on = self.shadow_msr & msr::IR != 0;

        if !mmu_on {
            return if self.pmem.gra_valid(ea.0) {
                Ok(Gra(ea.0))
            } else {
                Err(Error::BadAccess(ea.0))
            };
        }

        if fast_path {
            if let Some(ha) = vmm.get_mapping(self.active_vm(), ea.0) {
                if let Ok(gra) = self.pmem.gra(crate::types::HostAddr(ha)) {
                    return Ok(Gra(gra));
                }
            }
        }

        if self.sdr1 == SDR1_MAGIC_ROM_MODE {
            if let Some(entry) = self.mmu_ranges.find(ea.0) {
                return Ok(entry.translate(ea.0));
            }
        }

        // 601 BAT translation: only when the covering SR has T=0.
        let seg = (ea.0 >> 28) as usize & 0xf;
        if self.sr[seg] & 0x8000_0000 == 0 {
            for (upper, lower) in &self.ubat {
                if let Some(gra) = bat_translate(*upper, *lower, ea.0) {
                    return Ok(Gra(gra));
                }
            }
        }

        Err(Error::Unsupported("HTAB/SR/SDR1 decoding not implemented"))
    }

    /// `guest_to`. Returns the short-read byte
    /// count; callers that need strict semantics check it against the
    /// requested length themselves. `force_be` overrides the guest's
    /// endian policy for this call.
    pub fn guest_to(
        &mut self,
        vmm: &mut Vmm,
        gea: Gea,
        bytes: &[u8],
        access_size: AccessSize,
        force_be: bool,
    ) -> Result<u32> {
        let mut total = 0u32;
        let mut ea = gea;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let gra = self.backmap(vmm, ea, true)?;
            let page_off = gra.0 & (crate::pmem::PAGE_SIZE - 1);
            let chunk_cap = (crate::pmem::PAGE_SIZE - page_off).min(remaining.len() as u32);
            let chunk = &remaining[..chunk_cap as usize];
            let n = self.pmem.to(gra.0, chunk, access_size, force_be)?;
            total += n;
            if n < chunk_cap {
                break;
            }
            remaining = &remaining[n as usize..];
            ea = ea.wrapping_add(n);
        }
        Ok(total)
    }

    /// Like [`Guest::guest_to`], but a `BadAccess` mid-transfer is not
    /// propagated: the loop stops and the byte count transferred before
    /// the fault is returned as `Ok`. Mirrors `rom_write`'s `partial:`
    /// label, which folds `ERR_BAD_ACCESS` into `ERR_NONE` and reports
    /// however much of the buffer made it across. Used by CIF's bulk
    /// `read`/`write` services, where a guest handing over a buffer that
    /// is partially unmapped is a guest bug reported back to the guest,
    /// not a reason to fail the call outright.
    pub fn guest_to_lossy(
        &mut self,
        vmm: &mut Vmm,
        gea: Gea,
        bytes: &[u8],
        access_size: AccessSize,
        force_be: bool,
    ) -> Result<u32> {
        let mut total = 0u32;
        let mut ea = gea;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let gra = match self.backmap(vmm, ea, true) {
                Ok(gra) => gra,
                Err(Error::BadAccess(_)) => break,
                Err(e) => return Err(e),
            };
            let page_off = gra.0 & (crate::pmem::PAGE_SIZE - 1);
            let chunk_cap = (crate::pmem::PAGE_SIZE - page_off).min(remaining.len() as u32);
            let chunk = &remaining[..chunk_cap as usize];
            let n = match self.pmem.to(gra.0, chunk, access_size, force_be) {
                Ok(n) => n,
                Err(Error::BadAccess(_)) => break,
                Err(e) => return Err(e),
            };
            total += n;
            if n < chunk_cap {
                break;
            }
            remaining = &remaining[n as usize..];
            ea = ea.wrapping_add(n);
        }
        Ok(total)
    }

    /// `guest_from`.
    pub fn guest_from(
        &self,
        vmm: &mut Vmm,
        gea: Gea,
        dest: &mut [u8],
        access_size: AccessSize,
        nul_terminate: bool,
        force_be: bool,
    ) -> Result<u32> {
        let mut total = 0u32;
        let mut ea = gea;
        let mut remaining_len = dest.len() as u32;
        let mut off = 0usize;
        while remaining_len > 0 {
            let gra = self.backmap(vmm, ea, true)?;
            let page_off = gra.0 & (crate::pmem::PAGE_SIZE - 1);
            let chunk_cap = (crate::pmem::PAGE_SIZE - page_off).min(remaining_len);
            let n = self.pmem.from(
                &mut dest[off..off + chunk_cap as usize],
                gra.0,
                chunk_cap,
                access_size,
                nul_terminate,
                force_be,
            )?;
            total += n;
            if n < chunk_cap {
                break;
            }
            off += n as usize;
            remaining_len -= n;
            ea = ea.wrapping_add(n);
        }
        Ok(total)
    }

    /// Like [`Guest::guest_from`], but a `BadAccess` mid-transfer stops the
    /// loop and returns the count already copied as `Ok`, mirroring
    /// `rom_read`'s `partial:` label. Used by CIF's bulk `read`/`write`.
    pub fn guest_from_lossy(
        &self,
        vmm: &mut Vmm,
        gea: Gea,
        dest: &mut [u8],
        access_size: AccessSize,
        force_be: bool,
    ) -> Result<u32> {
        let mut total = 0u32;
        let mut ea = gea;
        let mut remaining_len = dest.len() as u32;
        let mut off = 0usize;
        while remaining_len > 0 {
            let gra = match self.backmap(vmm, ea, true) {
                Ok(gra) => gra,
                Err(Error::BadAccess(_)) => break,
                Err(e) => return Err(e),
            };
            let page_off = gra.0 & (crate::pmem::PAGE_SIZE - 1);
            let chunk_cap = (crate::pmem::PAGE_SIZE - page_off).min(remaining_len);
            let n = match self.pmem.from(
                &mut dest[off..off + chunk_cap as usize],
                gra.0,
                chunk_cap,
                access_size,
                false,
                force_be,
            ) {
                Ok(n) => n,
                Err(Error::BadAccess(_)) => break,
                Err(e) => return Err(e),
            };
            total += n;
            if n < chunk_cap {
                break;
            }
            off += n as usize;
            remaining_len -= n;
            ea = ea.wrapping_add(n);
        }
        Ok(total)
    }

    /// Handles a page fault by backmapping the faulting address and
    /// installing a shadow mapping for it.
    pub fn guest_fault(&self, vmm: &mut Vmm, exit: ExitReason) -> Result<()> {
        let ExitReason::PageFault { fault_ea, dsisr } = exit else {
            return Err(Error::Invalid);
        };
        const DSISR_NOT_PRESENT: u32 = 1 << 30;
        if dsisr & DSISR_NOT_PRESENT == 0 {
            return Err(Error::Unsupported("page fault not caused by missing translation"));
        }
        let gra = self.backmap(vmm, Gea(fault_ea), false)?;
        let ha = self.pmem.ha(gra.0);
        vmm.map(self.active_vm(), ha.0, fault_ea, Prot::rwx())?;
        trace!(target: "pvp::guest", "guest_fault: mapped ea=0x{fault_ea:08x} -> gra=0x{:08x}", gra.0);
        Ok(())
    }
}

/// 601 block-address translation. `upper` holds BEPI/BL/Vs/Vp, `lower`
/// holds BRPN/WIMG/PP. Returns the real address if `ea` falls in the
/// block and the block is valid for the current privilege level.
fn bat_translate(upper: u32, lower: u32, ea: u32) -> Option<u32> {
    let valid = upper & 0x3 != 0;
    if !valid {
        return None;
    }
    let bepi = upper & 0xFFFE_0000;
    let bl = (upper >> 2) & 0x7FF;
    let block_size = (bl + 1) << 17;
    let mask = !(block_size - 1);
    if ea & mask != bepi & mask {
        return None;
    }
    let brpn = lower & 0xFFFE_0000;
    Some(brpn | (ea & (block_size - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::sim::SimVmm;

    fn test_guest(little_endian: bool) -> (Vmm, Guest) {
        let mut vmm = Vmm::new(Box::new(SimVmm::new()));
        let guest = Guest::init(&mut vmm, little_endian, 0x10000).unwrap();
        (vmm, guest)
    }

    #[test]
    fn set_msr_keeps_mon_bits_forced() {
        let (mut vmm, mut guest) = test_guest(false);
        guest.mon_msr = msr::SE;
        guest.set_msr(&mut vmm, msr::ME | msr::IR | msr::DR).unwrap();
        let effective = vmm.regs(guest.active_vm()).msr;
        assert_eq!(effective & msr::SE, msr::SE);
    }

    #[test]
    #[should_panic]
    fn set_msr_rejects_ir_dr_mismatch() {
        let (mut vmm, mut guest) = test_guest(false);
        guest.set_msr(&mut vmm, msr::IR).unwrap();
    }

    #[test]
    fn backmap_identity_maps_when_mmu_off() {
        let (mut vmm, mut guest) = test_guest(false);
        guest.set_msr(&mut vmm, msr::ME).unwrap();
        let gra = guest.backmap(&mut vmm, Gea(0x100), true).unwrap();
        assert_eq!(gra, Gra(0x100));
    }

    #[test]
    fn backmap_uses_mmu_range_map_in_rom_mode() {
        let (mut vmm, mut guest) = test_guest(false);
        guest.set_msr(&mut vmm, msr::ME | msr::IR | msr::DR).unwrap();
        guest.mmu_ranges.add(0xC000_0000, 0xC000_0fff, 0x1000, 0);
        let gra = guest.backmap(&mut vmm, Gea(0xC000_0010), true).unwrap();
        assert_eq!(gra, Gra(0x1010));
    }

    #[test]
    fn guest_to_from_roundtrip_crosses_page_boundary() {
        let (mut vmm, mut guest) = test_guest(false);
        guest.set_msr(&mut vmm, msr::ME).unwrap();
        let data: Vec<u8> = (0..16u8).collect();
        let base = crate::pmem::PAGE_SIZE - 8;
        guest
            .guest_to(&mut vmm, Gea(base), &data, AccessSize::Byte, false)
            .unwrap();
        let mut out = vec![0u8; 16];
        guest
            .guest_from(&mut vmm, Gea(base), &mut out, AccessSize::Byte, false, false)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn little_endian_guest_boots_with_msr_le_set() {
        let (vmm, guest) = test_guest(true);
        assert_eq!(vmm.regs(guest.active_vm()).msr & msr::LE, msr::LE);
    }

    #[test]
    fn big_endian_guest_boots_without_msr_le() {
        let (vmm, guest) = test_guest(false);
        assert_eq!(vmm.regs(guest.active_vm()).msr & msr::LE, 0);
    }

    #[test]
    fn guest_to_fails_hard_on_transfer_past_ram_end() {
        let (mut vmm, mut guest) = test_guest(false);
        guest.set_msr(&mut vmm, msr::ME).unwrap();
        let data = vec![0xABu8; 5000];
        let base = 0x10000 - 2000;
        let err = guest.guest_to(&mut vmm, Gea(base), &data, AccessSize::Byte, false).unwrap_err();
        assert!(matches!(err, Error::BadAccess(_)));
    }

    #[test]
    fn guest_to_lossy_reports_partial_count_past_ram_end() {
        let (mut vmm, mut guest) = test_guest(false);
        guest.set_msr(&mut vmm, msr::ME).unwrap();
        let data = vec![0xABu8; 5000];
        let base = 0x10000 - 2000;
        let n = guest.guest_to_lossy(&mut vmm, Gea(base), &data, AccessSize::Byte, false).unwrap();
        assert_eq!(n, 2000);
    }

    #[test]
    fn guest_from_lossy_reports_partial_count_past_ram_end() {
        let (mut vmm, mut guest) = test_guest(false);
        guest.set_msr(&mut vmm, msr::ME).unwrap();
        let mut out = vec![0u8; 5000];
        let base = 0x10000 - 2000;
        let n = guest.guest_from_lossy(&mut vmm, Gea(base), &mut out, AccessSize::Byte, false).unwrap();
        assert_eq!(n, 2000);
    }
}
