//! Instruction Emulator: the trap-emulated subset.
//!
//! Entered when the VM exits with a program-exception reason and the
//! trapping PC does not match the CIF trampoline. Decodes via explicit
//! shift/mask against the documented big-endian field positions, in the
//! same opcode/field-extraction-then-match style as other decoders in
//! this crate.

pub mod locked_sequences;

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::types::{AccessSize, Gea};
use crate::vmm::Vmm;

const SPR_SRR0: u32 = 26;
const SPR_SRR1: u32 = 27;
const SPR_SDR1: u32 = 25;
const SPR_PVR: u32 = 287;
const SPR_SPRG0: u32 = 272;
const SPR_IBAT0U: u32 = 528;
const SPR_DBAT0U: u32 = 536;

fn spr_of(insn: u32) -> u32 {
    ((insn >> 16) & 0x1f) | (((insn >> 11) & 0x1f) << 5)
}

fn rt_of(insn: u32) -> u32 {
    (insn >> 21) & 0x1f
}

fn ra_of(insn: u32) -> u32 {
    (insn >> 16) & 0x1f
}

fn rb_of(insn: u32) -> u32 {
    (insn >> 11) & 0x1f
}

fn opcode(insn: u32) -> u32 {
    insn >> 26
}

fn xo(insn: u32) -> u32 {
    (insn >> 1) & 0x3ff
}

#[derive(Debug, Clone, Copy)]
enum Instr {
    Mfspr { rt: u32, spr: u32 },
    Mtspr { rs: u32, spr: u32 },
    Mfmsr { rt: u32 },
    Mtmsr { rs: u32 },
    Mfsr { rt: u32, sr: u32 },
    Mtsr { rs: u32, sr: u32 },
    Rfi,
    Tlbie { rb: u32 },
    Sync,
}

fn decode(insn: u32) -> Option<Instr> {
    match opcode(insn) {
        19 if xo(insn) == 50 => Some(Instr::Rfi),
        31 => match xo(insn) {
            339 => Some(Instr::Mfspr { rt: rt_of(insn), spr: spr_of(insn) }),
            467 => Some(Instr::Mtspr { rt: rt_of(insn), spr: spr_of(insn) }),
            83 => Some(Instr::Mfmsr { rt: rt_of(insn) }),
            146 => Some(Instr::Mtmsr { rs: rt_of(insn) }),
            595 => Some(Instr::Mfsr { rt: rt_of(insn), sr: ra_of(insn) & 0xf }),
            210 => Some(Instr::Mtsr { rs: rt_of(insn), sr: ra_of(insn) & 0xf }),
            306 => Some(Instr::Tlbie { rb: rb_of(insn) }),
            598 => Some(Instr::Sync),
            _ => None,
        },
        _ => None,
    }
}

/// Decode and execute one trapped instruction. Returns whether `pc` was
/// already updated by the handler (RFI) so the caller skips the default
/// +4 advance.
pub fn step(guest: &mut Guest, vmm: &mut Vmm, pc: u32) -> Result<()> {
    let mut word = [0u8; 4];
    guest.guest_from(vmm, Gea(pc), &mut word, AccessSize::Word, true, true)?;
    let insn = u32::from_be_bytes(word);

    if let Some(handled) = try_locked_sequence(guest, vmm, pc, insn)? {
        vmm.regs_mut(guest.active_vm()).pc = handled;
        return Ok(());
    }

    let decoded = decode(insn).ok_or(Error::Unsupported("undecodable program-exception instruction"))?;
    trace!(target: "pvp::emu", "step @0x{pc:08x}: {decoded:?}");

    let mut advance = true;
    match decoded {
        Instr::Mfspr { rt, spr } => {
            let v = read_spr(guest, spr)?;
            vmm.regs_mut(guest.active_vm()).gpr[rt as usize] = v;
        }
        Instr::Mtspr { rt, spr } => {
            let v = vmm.regs(guest.active_vm()).gpr[rt as usize];
            write_spr(guest, vmm, spr, v)?;
        }
        Instr::Mfmsr { rt } => {
            let msr = guest.shadow_msr();
            vmm.regs_mut(guest.active_vm()).gpr[rt as usize] = msr;
        }
        Instr::Mtmsr { rs } => {
            let v = vmm.regs(guest.active_vm()).gpr[rs as usize];
            guest.set_msr(vmm, v)?;
        }
        Instr::Mfsr { rt, sr } => {
            let v = guest.sr(sr as usize);
            vmm.regs_mut(guest.active_vm()).gpr[rt as usize] = v;
        }
        Instr::Mtsr { rs, sr } => {
            let v = vmm.regs(guest.active_vm()).gpr[rs as usize];
            guest.set_sr(sr as usize, v);
        }
        Instr::Rfi => {
            let srr1 = guest.srr1();
            guest.set_msr(vmm, srr1)?;
            vmm.regs_mut(guest.active_vm()).pc = guest.srr0();
            advance = false;
        }
        Instr::Tlbie { rb } => {
            let ea = vmm.regs(guest.active_vm()).gpr[rb as usize];
            let next = fetch_word(guest, vmm, pc + 4)?;
            if decode(next).map(|d| matches!(d, Instr::Sync)).unwrap_or(false) {
                vmm.unmap_all(guest.active_vm())?;
            } else {
                vmm.unmap(guest.active_vm(), ea)?;
            }
        }
        Instr::Sync => {}
    }

    if advance {
        let cur = vmm.regs(guest.active_vm()).pc;
        vmm.regs_mut(guest.active_vm()).pc = cur + 4;
    }
    Ok(())
}

fn fetch_word(guest: &Guest, vmm: &mut Vmm, pc: u32) -> Result<u32> {
    let mut word = [0u8; 4];
    guest.guest_from(vmm, Gea(pc), &mut word, AccessSize::Word, false, true)?;
    Ok(u32::from_be_bytes(word))
}

fn read_spr(guest: &Guest, spr: u32) -> Result<u32> {
    Ok(match spr {
        SPR_PVR => guest.pvr(),
        SPR_SRR0 => guest.srr0(),
        SPR_SRR1 => guest.srr1(),
        SPR_SDR1 => guest.sdr1(),
        s if (SPR_SPRG0..SPR_SPRG0 + 4).contains(&s) => guest.sprg((s - SPR_SPRG0) as usize),
        s if (SPR_IBAT0U..SPR_IBAT0U + 8).contains(&s) => {
            let i = ((s - SPR_IBAT0U) / 2) as usize;
            let (upper, lower) = guest.ubat(i);
            if (s - SPR_IBAT0U) % 2 == 0 { upper } else { lower }
        }
        s if (SPR_DBAT0U..SPR_DBAT0U + 8).contains(&s) => 0,
        _ => return Err(Error::Unsupported("mfspr: unmodeled SPR")),
    })
}

fn write_spr(guest: &mut Guest, vmm: &mut Vmm, spr: u32, v: u32) -> Result<()> {
    match spr {
        SPR_PVR => warn!(target: "pvp::emu", "mtspr to read-only PVR ignored"),
        SPR_SRR0 => guest.set_srr0(v),
        SPR_SRR1 => guest.set_srr1(v),
        SPR_SDR1 => guest.set_sdr1(vmm, v)?,
        s if (SPR_SPRG0..SPR_SPRG0 + 4).contains(&s) => guest.set_sprg((s - SPR_SPRG0) as usize, v),
        s if (SPR_IBAT0U..SPR_IBAT0U + 8).contains(&s) => {
            let i = ((s - SPR_IBAT0U) / 2) as usize;
            let (mut upper, mut lower) = guest.ubat(i);
            if (s - SPR_IBAT0U) % 2 == 0 {
                upper = v;
            } else {
                lower = v;
            }
            guest.set_ubat(i, upper, lower);
        }
        s if (SPR_DBAT0U..SPR_DBAT0U + 8).contains(&s) => {
            warn!(target: "pvp::emu", "mtspr to DBAT{} ignored (read-only stub)", (s - SPR_DBAT0U) / 2);
        }
        _ => return Err(Error::Unsupported("mtspr: unmodeled SPR")),
    }
    Ok(())
}

/// Tries each of
/// [`locked_sequences::PATTERNS`] against `insn` plus the words that
/// follow it in guest memory; on a match, writes `SPRG[0]` into the
/// target register and returns the PC to resume at.
fn try_locked_sequence(guest: &mut Guest, vmm: &mut Vmm, pc: u32, insn: u32) -> Result<Option<u32>> {
    for pattern in locked_sequences::PATTERNS {
        if pattern.trigger != insn {
            continue;
        }
        let mut followups = Vec::with_capacity(pattern.followups.len());
        for i in 0..pattern.followups.len() {
            followups.push(fetch_word(guest, vmm, pc + 4 + i as u32 * 4)?);
        }
        if let Some(matched) = locked_sequences::match_at(insn, &followups) {
            let sprg0 = guest.sprg(0);
            vmm.regs_mut(guest.active_vm()).gpr[matched.target_gpr as usize] = sprg0;
            trace!(target: "pvp::emu", "locked-sequence skip at 0x{pc:08x}, hop {} words", matched.hop_words);
            return Ok(Some(pc + matched.hop_words * 4));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::regs::msr;
    use crate::vmm::sim::SimVmm;

    fn test_guest() -> (Vmm, Guest) {
        let mut vmm = Vmm::new(Box::new(SimVmm::new()));
        let guest = Guest::init(&mut vmm, false, 0x10000).unwrap();
        (vmm, guest)
    }

    fn write_insn(guest: &mut Guest, vmm: &mut Vmm, pc: u32, insn: u32) {
        guest
            .guest_to(vmm, Gea(pc), &insn.to_be_bytes(), AccessSize::Word, true)
            .unwrap();
    }

    #[test]
    fn mfspr_pvr_loads_601_value_and_advances_pc() {
        let (mut vmm, mut guest) = test_guest();
        guest.set_msr(&mut vmm, msr::ME).unwrap();
        // mfspr r7, pvr (spr=287 -> spr_hi=8, spr_lo=31... encode directly)
        let spr = SPR_PVR;
        let insn = (31 << 26) | (7 << 21) | ((spr & 0x1f) << 16) | (((spr >> 5) & 0x1f) << 11) | (339 << 1);
        write_insn(&mut guest, &mut vmm, 0x1000, insn);
        vmm.regs_mut(guest.active_vm()).pc = 0x1000;
        step(&mut guest, &mut vmm, 0x1000).unwrap();
        assert_eq!(vmm.regs(guest.active_vm()).gpr[7], 0x0001_0001);
        assert_eq!(vmm.regs(guest.active_vm()).pc, 0x1004);
    }

    #[test]
    fn rfi_sets_pc_from_srr0_and_enables_mmu() {
        let (mut vmm, mut guest) = test_guest();
        guest.set_msr(&mut vmm, msr::ME).unwrap();
        guest.set_srr0(0x100);
        guest.set_srr1(msr::ME | msr::EP | msr::IR | msr::DR);
        let insn = (19 << 26) | (50 << 1);
        write_insn(&mut guest, &mut vmm, 0x2000, insn);
        step(&mut guest, &mut vmm, 0x2000).unwrap();
        assert_eq!(vmm.regs(guest.active_vm()).pc, 0x100);
        assert_eq!(guest.shadow_msr() & msr::IR, msr::IR);
    }

    #[test]
    fn undecodable_instruction_is_unsupported() {
        let (mut vmm, mut guest) = test_guest();
        guest.set_msr(&mut vmm, msr::ME).unwrap();
        write_insn(&mut guest, &mut vmm, 0x3000, 0xFFFF_FFFF);
        let err = step(&mut guest, &mut vmm, 0x3000).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
