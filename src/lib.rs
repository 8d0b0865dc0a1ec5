//! Control-flow integrity monitor for Armv8-M processors with Security
//! Extensions
//!
//! This crate is the Secure-state core of a CFI scheme protecting Non-Secure
//! code against return-address corruption. It provides:
//!
//! - A shadow exception stack engine: on every Non-Secure interrupt entry a
//!   trampoline crosses into the monitor, which mirrors the integrity
//!   critical fields of the in-flight hardware exception frames; on return
//!   the mirror is checked and any disagreement halts the system.
//! - Per-thread shadow stack switching, so a cooperative Non-Secure
//!   scheduler keeps CFI across context switches.
//! - A function-return shadow stack driven by instrumented
//!   prologues/epilogues.
//! - The gateway surface Non-Secure calls to create and activate threads,
//!   reset and lock down the monitor.
//! - The bump arena all per-thread state is allocated from; Secure memory
//!   has no heap.
//!
//! Board and bus configuration (SAU, MPC, interrupt targeting), the
//! Non-Secure trampoline stubs and the Secure boot path are external
//! collaborators: they set up the world this monitor runs in.
//!
//! # Usage
//!
//! Secure boot calls [`gateway::cfi_initialize`] with the Non-Secure vector
//! table address, then starts Non-Secure. Everything else happens through
//! the gateway as Non-Secure code runs. On targets without the Security
//! Extensions only the data structures compile; the assembly adapters need
//! `thumbv8m`.

#![deny(missing_docs)]
#![no_std]

pub mod arena;
pub mod entry_pc;
pub mod exc_return;
pub mod gateway;
pub mod mem;
pub mod monitor;
pub mod mutex;
pub mod shadow;
pub mod thread;
pub mod walker;

pub use crate::gateway::Status;
pub use crate::monitor::Monitor;
pub use crate::shadow::ShadowFrame;
pub use crate::thread::CreateInfo;

/// Recoverable failures reported to Non-Secure callers.
///
/// Anything that instead proves the CFI invariant has been violated does not
/// get an error code; it halts the system.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Arena or thread-slot exhaustion.
    OutOfMemory = 1,
    /// The operation is refused after lockdown.
    Unprivileged = 2,
    /// A parameter carries an invalid value.
    InvalidArgument = 3,
    /// The monitor's current state forbids the call.
    InvalidOperation = 4,
}

// Halts Secure execution after an unrecoverable integrity violation.
//
// Recovering would mean returning to code an attacker may have redirected,
// so the monitor stops taking interrupts and panics; the panic transport of
// the enclosing binary (semihosting, ITM, ...) carries the diagnostic out.
pub(crate) fn fatal(message: &'static str) -> ! {
    #[cfg(cortex_m)]
    cortex_m::interrupt::disable();
    panic!("{}", message)
}
