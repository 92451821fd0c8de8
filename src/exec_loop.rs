//! Execution Loop: the single-threaded cooperative scheduler.
//!
//! The only suspension point that runs guest code is `vmm_execute`; every
//! other component runs strictly between exits. Grounded on
//! `original_source/mon.c`'s main loop, structured as a "decode the exit
//! reason, route to exactly one handler" dispatch.

use log::{error, info, warn};

use crate::cif::Cif;
use crate::emulator;
use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::net::{Debugger, DebuggerAction, LineDebugger};
use crate::vmm::{ExitReason, Vmm};

pub struct ExecLoop {
    pub vmm: Vmm,
    pub guest: Guest,
    pub cif: Cif,
    pub debugger: LineDebugger,
    paused: bool,
}

impl ExecLoop {
    pub fn new(vmm: Vmm, guest: Guest, cif: Cif, debugger: LineDebugger) -> Self {
        Self { vmm, guest, cif, debugger, paused: false }
    }

    /// Runs until a clean [`Error::Shutdown`] or an unrecoverable error.
    /// Returns `Ok(())` on a clean shutdown.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if let Err(e) = self.poll_debugger() {
                match e {
                    Error::Shutdown => return self.teardown(),
                    other => return Err(other),
                }
            }

            if self.paused {
                continue;
            }

            let exit = self.vmm.execute(self.guest.active_vm())?;
            if let Err(e) = self.handle_exit(exit) {
                match e {
                    Error::Shutdown => return self.teardown(),
                    Error::NotRomCall | Error::Unsupported(_) | Error::BadAccess(_) => {
                        error!(target: "pvp::exec", "unhandled exit: {e}; entering debugger");
                        self.paused = true;
                    }
                    other => return Err(other),
                }
            }
        }
    }

    fn handle_exit(&mut self, exit: ExitReason) -> Result<()> {
        match exit {
            ExitReason::PageFault { .. } => self.guest.guest_fault(&mut self.vmm, exit),
            ExitReason::SystemCall => {
                let pc = self.vmm.regs(self.guest.active_vm()).pc;
                self.cif.dispatch(&mut self.guest, &mut self.vmm, pc)
            }
            ExitReason::ProgramException => {
                let pc = self.vmm.regs(self.guest.active_vm()).pc;
                match self.cif.dispatch(&mut self.guest, &mut self.vmm, pc) {
                    Err(Error::NotRomCall) => emulator::step(&mut self.guest, &mut self.vmm, pc),
                    other => other,
                }
            }
            ExitReason::Other(code) => {
                warn!(target: "pvp::exec", "unmodeled VM exit reason: {code}");
                Err(Error::Unsupported("unmodeled VM exit reason"))
            }
        }
    }

    fn poll_debugger(&mut self) -> Result<()> {
        self.cif.console_poll_accept()?;
        match self.debugger.poll()? {
            DebuggerAction::None => Ok(()),
            DebuggerAction::Continue => {
                self.paused = false;
                Ok(())
            }
            DebuggerAction::Pause => {
                self.paused = true;
                Ok(())
            }
            DebuggerAction::SingleStepToggled => {
                let enabled = !self.guest.single_stepping();
                self.guest.set_single_step(&mut self.vmm, enabled)
            }
            DebuggerAction::Shutdown => Err(Error::Shutdown),
        }
    }

    /// Tear down both hypervisor contexts and return so `main` can exit 0.
    fn teardown(&mut self) -> Result<()> {
        info!(target: "pvp::exec", "shutdown requested, tearing down");
        if let Err(e) = self.vmm.tear_down(self.guest.active_vm()) {
            warn!(target: "pvp::exec", "tear_down failed: {e}");
        }
        Ok(())
    }
}
