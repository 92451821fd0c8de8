//! Hypervisor facade: the single choke point for calls into the host VM
//! facility.
//!
//! Every other component consumes only [`HypervisorBackend`] (through a
//! [`Vmm`]); none of them embed a host-specific type. Two backends exist:
//! a real one (`mac`, macOS-only, FFI bindings against the historical
//! `vmachmon` dispatch table) and a software one (`sim`) used by tests and
//! by `--sim-vmm` so the rest of the monitor is exercisable on any host.

pub mod regs;
#[cfg(any(test, feature = "sim-vmm", not(target_os = "macos")))]
pub mod sim;

#[cfg(target_os = "macos")]
pub mod mac;

use crate::error::Result;
use regs::Regs32;

/// Why `vmm_execute` returned control to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A page the guest touched has no shadow mapping yet.
    PageFault { fault_ea: u32, dsisr: u32 },
    /// A privileged/unimplemented instruction trapped.
    ProgramException,
    /// `sc` — used here exclusively for the CIF trampoline.
    SystemCall,
    /// Anything this monitor does not model; routes to the debugger.
    Other(u32),
}

/// Page protection requested of `vmm_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prot {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Prot {
    #[must_use]
    pub fn rwx() -> Self {
        Self {
            read: true,
            write: true,
            exec: true,
        }
    }
}

/// Opaque per-VM-context handle. The concrete value is backend-defined;
/// callers only ever pass it back to the same backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmHandle(pub usize);

/// Contract every hypervisor backend must satisfy.
pub trait HypervisorBackend {
    /// Process-global init of the dispatch stub. Called once.
    fn vmm_init(&mut self) -> Result<()>;

    /// Allocate a per-VM state page; returns its handle.
    fn vmm_init_vm(&mut self) -> Result<VmHandle>;

    fn vmm_tear_down(&mut self, vm: VmHandle) -> Result<()>;

    /// Run the guest until it traps, returning the exit reason and a
    /// mutable view of the register bank that was live during the run.
    fn vmm_execute(&mut self, vm: VmHandle) -> Result<ExitReason>;

    /// Mutable access to `vm`'s register bank, valid between calls to
    /// `vmm_execute`.
    fn regs_mut(&mut self, vm: VmHandle) -> &mut Regs32;
    fn regs(&self, vm: VmHandle) -> &Regs32;

    fn vmm_map(&mut self, vm: VmHandle, ha: usize, ea: u32, prot: Prot) -> Result<()>;
    fn vmm_unmap(&mut self, vm: VmHandle, ea: u32) -> Result<()>;
    fn vmm_unmap_all(&mut self, vm: VmHandle) -> Result<()>;
    fn vmm_get_mapping(&mut self, vm: VmHandle, ea: u32) -> Option<usize>;

    /// Copy `from`'s process state into `to` (double-buffered MMU-on/off
    /// contexts). Used by [`crate::guest::Guest::set_msr`] when
    /// toggling `MSR_IR|MSR_DR`.
    fn copy_process_state(&mut self, from: VmHandle, to: VmHandle);
}

/// Owning wrapper around a boxed backend, so the rest of the crate names
/// one concrete type instead of a type parameter everywhere.
pub struct Vmm {
    backend: Box<dyn HypervisorBackend>,
}

impl Vmm {
    #[must_use]
    pub fn new(backend: Box<dyn HypervisorBackend>) -> Self {
        Self { backend }
    }

    pub fn init(&mut self) -> Result<()> {
        self.backend.vmm_init()
    }

    pub fn init_vm(&mut self) -> Result<VmHandle> {
        self.backend.vmm_init_vm()
    }

    pub fn tear_down(&mut self, vm: VmHandle) -> Result<()> {
        self.backend.vmm_tear_down(vm)
    }

    pub fn execute(&mut self, vm: VmHandle) -> Result<ExitReason> {
        self.backend.vmm_execute(vm)
    }

    pub fn regs_mut(&mut self, vm: VmHandle) -> &mut Regs32 {
        self.backend.regs_mut(vm)
    }

    pub fn regs(&self, vm: VmHandle) -> &Regs32 {
        self.backend.regs(vm)
    }

    pub fn map(&mut self, vm: VmHandle, ha: usize, ea: u32, prot: Prot) -> Result<()> {
        self.backend.vmm_map(vm, ha, ea, prot)
    }

    pub fn unmap(&mut self, vm: VmHandle, ea: u32) -> Result<()> {
        self.backend.vmm_unmap(vm, ea)
    }

    pub fn unmap_all(&mut self, vm: VmHandle) -> Result<()> {
        self.backend.vmm_unmap_all(vm)
    }

    pub fn get_mapping(&mut self, vm: VmHandle, ea: u32) -> Option<usize> {
        self.backend.vmm_get_mapping(vm, ea)
    }

    pub fn copy_process_state(&mut self, from: VmHandle, to: VmHandle) {
        self.backend.copy_process_state(from, to);
    }
}
