//! Command-line configuration, derived with
//! `clap::Parser` the same way a cargo `xtask` binary derives its own CLI.

use std::path::PathBuf;

use clap::{Args, Parser};

const DEFAULT_DT_PATH: &str = "pvp.dtb";
const DEFAULT_CONSOLE_PORT: u16 = 1234;
const DEFAULT_DEBUG_PORT: u16 = 1235;
const DEFAULT_MEMORY_BYTES: u32 = 32 * 1024 * 1024;

/// A user-space monitor hosting a 32-bit PowerPC guest.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Run the guest little-endian (loads `veneer.exe` instead of `iquik.b`).
    #[arg(short = 'L', long)]
    pub little_endian: bool,

    /// Path to the flattened device-tree blob.
    #[arg(short = 'F', long = "dtb", default_value = DEFAULT_DT_PATH)]
    pub dtb_path: PathBuf,

    /// Guest RAM size in bytes.
    #[arg(short = 'm', long = "memory", default_value_t = DEFAULT_MEMORY_BYTES)]
    pub memory: u32,

    /// TCP port for the guest console.
    #[arg(short = 'c', long = "console-port", default_value_t = DEFAULT_CONSOLE_PORT)]
    pub console_port: u16,

    /// TCP port for the line debugger.
    #[arg(short = 'd', long = "debug-port", default_value_t = DEFAULT_DEBUG_PORT)]
    pub debug_port: u16,

    /// Run the software VMM backend instead of the native one (implied on
    /// non-macOS hosts; useful for testing on macOS too).
    #[arg(long)]
    pub sim_vmm: bool,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

#[derive(Args, Debug)]
pub struct Verbosity {
    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease log verbosity (repeatable).
    #[arg(short = 'q', long, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

impl Verbosity {
    #[must_use]
    pub fn filter(&self) -> &'static str {
        let level = 2 + i16::from(self.verbose) - i16::from(self.quiet);
        match level {
            i16::MIN..=0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    }
}
