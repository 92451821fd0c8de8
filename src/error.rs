//! The monitor's error taxonomy.
//!
//! Mirrors the `err_t` enum the source (`original_source/include/err.h`)
//! funnels every fallible call through, so every component can propagate
//! with `?` instead of the source's goto-to-label cleanup. `Assert` is the
//! one variant that is never propagated: [`bug!`]/[`massert!`] log at
//! `error!` and panic in its place, matching the source's `BUG_ON`, which
//! logs and aborts.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Backs [`bug!`]/[`massert!`]; carries the message logged before the
    /// panic. Never returned through `?` — the macros panic instead of
    /// constructing and returning this variant, it exists for completeness
    /// of the taxonomy and so a caught panic payload can be typed.
    #[error("assertion failure: {0}")]
    Assert(String),

    /// A resource that isn't ready yet (a non-blocking read/accept that
    /// would block).
    #[error("not ready")]
    NotReady,

    /// A guest memory access fell (at least partially) outside backed RAM
    /// or could not be translated.
    #[error("bad guest memory access at {0:#x}")]
    BadAccess(u32),

    /// A transfer or claim request falls outside a bound (RAM size, buffer
    /// length, ...).
    #[error("out of bounds")]
    OutOfBounds,

    /// A short transfer that isn't itself an OS-level failure (e.g. a disk
    /// read returning fewer bytes than the sector size demands).
    #[error("io error: short transfer")]
    IoError,

    /// Decode or dispatch hit a form this monitor doesn't emulate.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("no memory")]
    NoMem,

    #[error("not found")]
    NotFound,

    /// The underlying hypervisor facility reported a failure.
    #[error("hypervisor facility error: {0}")]
    Mach(&'static str),

    /// Graceful stop request (CIF `exit`/`enter`/`boot`/`chain`, or the
    /// debugger's `quit`).
    #[error("shutdown requested")]
    Shutdown,

    /// Debugger resume request.
    #[error("continue")]
    Continue,

    /// Debugger halt request.
    #[error("pause")]
    Pause,

    #[error("host I/O error: {0}")]
    Posix(#[from] std::io::Error),

    /// The trapping PC did not match the CIF trampoline; the emulator
    /// should be tried instead.
    #[error("not a CIF call")]
    NotRomCall,

    /// A taxonomy bug: should be unreachable.
    #[error("invalid error code")]
    Invalid,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal, unconditional assertion failure. Logs at `error!` and panics,
/// matching the source's `BUG_ON(1, fmt, ...)` call sites.
#[macro_export]
macro_rules! bug {
    ($($arg:tt)+) => {{
        let err = $crate::error::Error::Assert(format!($($arg)+));
        log::error!("{err}");
        panic!("{err}");
    }};
}

/// Fatal assertion: logs at `error!` and panics if `cond` is false,
/// matching the source's `BUG_ON(!cond, fmt, ...)` pattern (inverted sense:
/// `BUG_ON` fires on the bad condition, `massert!` fires on its negation).
#[macro_export]
macro_rules! massert {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::bug!($($arg)+);
        }
    };
}
