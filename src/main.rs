//! `pvp`: a user-space monitor hosting a 32-bit PowerPC guest under
//! IEEE-1275 Open Firmware. Entry point wires the CLI config, firmware
//! boot, guest core, hypervisor backend, and execution loop together in a
//! plain bootstrap-then-run shape.

mod boot;
mod cif;
mod config;
mod disk;
mod emulator;
mod error;
mod exec_loop;
mod guest;
mod mmu_ranges;
mod net;
mod pmem;
mod ranges;
mod types;
mod vmm;

use std::cell::RefCell;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use log::error;

use config::Config;
use exec_loop::ExecLoop;
use guest::Guest;
use net::{LineDebugger, TcpEndpoint};
use vmm::Vmm;

fn main() -> ExitCode {
    let config = Config::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.verbosity.filter()),
    )
    .init();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(target: "pvp", "fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> error::Result<()> {
    let backend = select_backend(&config)?;
    let mut vmm = Vmm::new(backend);
    let mut guest = Guest::init(&mut vmm, config.little_endian, config.memory)?;

    let console = Rc::new(RefCell::new(TcpEndpoint::bind(
        config.console_port,
        "console",
        "This is the pvp monitor console\r\n-------------------------------\r\n\n",
    )?));
    let cif = boot::load(&mut guest, &mut vmm, config.little_endian, &config.dtb_path, console)?;
    let debugger = LineDebugger::new(config.debug_port)?;

    ExecLoop::new(vmm, guest, cif, debugger).run()
}

#[cfg(target_os = "macos")]
fn select_backend(config: &Config) -> error::Result<Box<dyn vmm::HypervisorBackend>> {
    if config.sim_vmm {
        return Ok(Box::new(vmm::sim::SimVmm::new()));
    }
    Ok(Box::new(vmm::mac::MacVmm::new()))
}

#[cfg(not(target_os = "macos"))]
fn select_backend(_config: &Config) -> error::Result<Box<dyn vmm::HypervisorBackend>> {
    Ok(Box::new(vmm::sim::SimVmm::new()))
}
