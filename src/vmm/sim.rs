//! Software shadow-mapping backend, used by tests and by `--sim-vmm`.
//!
//! `execute()` does not run real PowerPC code — nothing on a non-PowerPC,
//! non-macOS host can. Instead it is a test seam: the harness preloads a
//! queue of exit reasons with [`SimVmm::queue_exit`] and `execute()` pops
//! one each call, keeping the rest of the monitor exercisable without a
//! real backend.

use std::collections::{HashMap, VecDeque};

use super::regs::Regs32;
use super::{ExitReason, HypervisorBackend, Prot, VmHandle};
use crate::error::{Error, Result};

#[derive(Default)]
struct VmState {
    regs: Regs32,
    shadow_map: HashMap<u32, usize>,
    exit_queue: VecDeque<ExitReason>,
}

#[derive(Default)]
pub struct SimVmm {
    vms: Vec<VmState>,
}

impl SimVmm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an exit reason to be returned by the next `vmm_execute(vm)`.
    pub fn queue_exit(&mut self, vm: VmHandle, reason: ExitReason) {
        self.vms[vm.0].exit_queue.push_back(reason);
    }

    #[must_use]
    pub fn shadow_mapping_count(&self, vm: VmHandle) -> usize {
        self.vms[vm.0].shadow_map.len()
    }
}

impl HypervisorBackend for SimVmm {
    fn vmm_init(&mut self) -> Result<()> {
        Ok(())
    }

    fn vmm_init_vm(&mut self) -> Result<VmHandle> {
        let idx = self.vms.len();
        self.vms.push(VmState::default());
        Ok(VmHandle(idx))
    }

    fn vmm_tear_down(&mut self, _vm: VmHandle) -> Result<()> {
        Ok(())
    }

    fn vmm_execute(&mut self, vm: VmHandle) -> Result<ExitReason> {
        self.vms[vm.0]
            .exit_queue
            .pop_front()
            .ok_or(Error::Unsupported("sim VMM: no queued exit reason"))
    }

    fn regs_mut(&mut self, vm: VmHandle) -> &mut Regs32 {
        &mut self.vms[vm.0].regs
    }

    fn regs(&self, vm: VmHandle) -> &Regs32 {
        &self.vms[vm.0].regs
    }

    fn vmm_map(&mut self, vm: VmHandle, ha: usize, ea: u32, _prot: Prot) -> Result<()> {
        self.vms[vm.0].shadow_map.insert(ea, ha);
        Ok(())
    }

    fn vmm_unmap(&mut self, vm: VmHandle, ea: u32) -> Result<()> {
        self.vms[vm.0].shadow_map.remove(&ea);
        Ok(())
    }

    fn vmm_unmap_all(&mut self, vm: VmHandle) -> Result<()> {
        self.vms[vm.0].shadow_map.clear();
        Ok(())
    }

    fn vmm_get_mapping(&mut self, vm: VmHandle, ea: u32) -> Option<usize> {
        self.vms[vm.0].shadow_map.get(&ea).copied()
    }

    fn copy_process_state(&mut self, from: VmHandle, to: VmHandle) {
        let regs = self.vms[from.0].regs;
        self.vms[to.0].regs = regs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_get_mapping_roundtrips() {
        let mut vmm = SimVmm::new();
        let vm = vmm.vmm_init_vm().unwrap();
        vmm.vmm_map(vm, 0xdead_b000, 0xC000_0000, Prot::rwx())
            .unwrap();
        assert_eq!(vmm.vmm_get_mapping(vm, 0xC000_0000), Some(0xdead_b000));
    }

    #[test]
    fn unmap_all_clears_every_entry() {
        let mut vmm = SimVmm::new();
        let vm = vmm.vmm_init_vm().unwrap();
        vmm.vmm_map(vm, 0x1000, 0x2000, Prot::rwx()).unwrap();
        vmm.vmm_map(vm, 0x3000, 0x4000, Prot::rwx()).unwrap();
        vmm.vmm_unmap_all(vm).unwrap();
        assert_eq!(vmm.shadow_mapping_count(vm), 0);
    }
}
