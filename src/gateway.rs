//! Non-Secure-callable surface
//!
//! Every function here is an entry point of the monitor. A linker conforming
//! to "Armv8-M Security Extensions: Requirements on Development Tools"
//! publishes the `cfi_*` management entries to Non-Secure state through
//! SG veneers in Non-Secure-callable memory; the `__cfi_*` entries are not
//! meant for applications but for the CFI infrastructure itself (interrupt
//! trampolines and instrumented prologues/epilogues).
//!
//! Management entries serialize through a try-lock: a call that loses the
//! race reports [`Status::InvalidOperation`] instead of waiting, because the
//! monitor has nothing to yield to. The interrupt and call-stack paths run
//! lockless; they are serialized by the exception-priority contract with the
//! Non-Secure side, and a violation of that contract is a compromise the
//! fatal taxonomy owns.

use core::cell::UnsafeCell;
use core::mem::align_of;
use core::ptr;

use crate::monitor::Monitor;
use crate::mutex::Mutex;
use crate::thread::CreateInfo;
use crate::Error;

/// Result of a gateway call, returned to Non-Secure by value.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// The operation completed.
    Success = 0,
    /// Arena or thread-slot exhaustion.
    OutOfMemory = 1,
    /// The operation is refused after lockdown.
    Unprivileged = 2,
    /// A parameter carries an invalid value, an invalid pointer included.
    InvalidArgument = 3,
    /// The monitor's current state forbids the call, a lost try-lock race
    /// included.
    InvalidOperation = 4,
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        match error {
            Error::OutOfMemory => Status::OutOfMemory,
            Error::Unprivileged => Status::Unprivileged,
            Error::InvalidArgument => Status::InvalidArgument,
            Error::InvalidOperation => Status::InvalidOperation,
        }
    }
}

struct MonitorCell {
    lock: Mutex,
    inner: UnsafeCell<Monitor>,
}

// One Secure hardware thread. Management entries serialize through `lock`;
// the lockless paths are serialized by exception priority.
unsafe impl Sync for MonitorCell {}

static MONITOR: MonitorCell = MonitorCell {
    lock: Mutex::new(),
    inner: UnsafeCell::new(Monitor::new()),
};

fn with_monitor(f: impl FnOnce(&mut Monitor) -> Result<(), Error>) -> Status {
    let guard = MONITOR.lock.try_lock();
    if guard.is_none() {
        return Status::InvalidOperation;
    }
    let monitor = unsafe { &mut *MONITOR.inner.get() };
    match f(monitor) {
        Ok(()) => Status::Success,
        Err(error) => error.into(),
    }
}

/// Rewinds the monitor to its post-boot state.
///
/// Thread ids handed out earlier are invalid afterwards.
#[no_mangle]
pub extern "C" fn cfi_reset() -> Status {
    #[cfg(feature = "defmt")]
    defmt::debug!("cfi: reset");
    with_monitor(|monitor| monitor.reset())
}

/// Creates a thread from `*info` and writes its id to `*thread`.
///
/// Both structures are copied through volatile accesses: Non-Secure keeps
/// access to the backing memory while the call runs, and must not be able to
/// change its mind about what was validated. The id is written only on
/// success.
#[no_mangle]
pub unsafe extern "C" fn cfi_create_thread(info: *const CreateInfo, thread: *mut u32) -> Status {
    if info.is_null()
        || thread.is_null()
        || info as usize % align_of::<CreateInfo>() != 0
        || thread as usize % align_of::<u32>() != 0
    {
        return Status::InvalidArgument;
    }
    let info = ptr::read_volatile(info);
    #[cfg(feature = "defmt")]
    defmt::debug!("cfi: create thread {}", info);
    with_monitor(|monitor| {
        let id = monitor.create_thread(&info, false)?;
        ptr::write_volatile(thread, id);
        Ok(())
    })
}

/// Makes `thread` the thread whose shadow stacks are live.
#[no_mangle]
pub extern "C" fn cfi_activate_thread(thread: u32) -> Status {
    #[cfg(feature = "defmt")]
    defmt::trace!("cfi: activate thread {}", thread);
    with_monitor(|monitor| monitor.activate_thread(thread))
}

/// Transitions into the lockdown state.
///
/// One-way: configuration changes fail with [`Status::Unprivileged`] from
/// now on.
#[no_mangle]
pub extern "C" fn cfi_lockdown() -> Status {
    #[cfg(feature = "defmt")]
    defmt::debug!("cfi: lockdown");
    with_monitor(|monitor| monitor.lockdown())
}

/// Parses the Non-Secure vector table at `vector_table` and readies the
/// monitor for interrupts.
///
/// Secure-only: called once from Secure boot before Non-Secure starts, with
/// nothing else running, hence no lock. A second call is fatal.
///
/// # Safety
///
/// `vector_table` must point at the Non-Secure vector table described in the
/// module documentation of [`crate::entry_pc`].
#[no_mangle]
pub unsafe extern "C" fn cfi_initialize(vector_table: u32) {
    #[cfg(feature = "defmt")]
    defmt::debug!("cfi: initialize, vector table at {=u32:#x}", vector_table);
    let mem = crate::mem::NsMemory::new();
    let monitor = &mut *MONITOR.inner.get();
    monitor.initialize(&mem, vector_table);
}

/// Arms the statistical profiler. No-op unless the `profile` feature is
/// compiled in.
#[no_mangle]
pub extern "C" fn cfi_profiler_start() {
    #[cfg(feature = "profile")]
    {
        let _ = with_monitor(|monitor| {
            monitor.profiler_start();
            Ok(())
        });
    }
}

/// Disarms the statistical profiler. No-op unless the `profile` feature is
/// compiled in.
#[no_mangle]
pub extern "C" fn cfi_profiler_stop() {
    #[cfg(feature = "profile")]
    {
        let _ = with_monitor(|monitor| {
            monitor.profiler_stop();
            Ok(())
        });
    }
}

/// Reports the collected profile. No-op unless the `profile` feature is
/// compiled in; the report goes out through `defmt` when that is enabled.
#[no_mangle]
pub extern "C" fn cfi_profiler_dump() {
    #[cfg(feature = "profile")]
    {
        let _ = with_monitor(|monitor| {
            let _snapshot = monitor.profile();
            #[cfg(feature = "defmt")]
            defmt::info!("cfi profile: {}", _snapshot);
            Ok(())
        });
    }
}

/// Assembly adapters bridging the Non-Secure trampolines into the monitor.
///
/// These are the only places where CPU state is captured; everything behind
/// them works on plain values.
#[cfg(armv8m)]
mod veneer {
    use core::arch::asm;

    use cortex_m::register::{msp, psp};

    use super::MONITOR;
    use crate::mem::NsMemory;

    extern "C" fn push_shadow_frames(exc_return: u32) {
        // The Non-Secure stack pointers are unchanged since the gateway
        // crossing.
        let msp_ns = msp::read_ns();
        let psp_ns = psp::read_ns();
        let mem = unsafe { NsMemory::new() };
        let monitor = unsafe { &mut *MONITOR.inner.get() };
        monitor.push(&mem, exc_return, msp_ns, psp_ns);
    }

    extern "C" fn push_return_address(ret: u32) {
        let monitor = unsafe { &mut *MONITOR.inner.get() };
        monitor.push_return(ret);
    }

    extern "C" fn assert_return_address(ret: u32) {
        let monitor = unsafe { &mut *MONITOR.inner.get() };
        monitor.assert_return(ret);
    }

    /// First Secure stop of every Non-Secure interrupt.
    ///
    /// Entered with r0 holding the ISR body and LR still holding the
    /// EXC_RETURN the CPU delivered on exception entry. Mirrors the in-flight
    /// frames, then branches Non-Secure into the ISR body with the return
    /// aimed at [`__cfi_leave_interrupt`].
    #[no_mangle]
    pub unsafe extern "C" fn __cfi_enter_interrupt(_isr_body: extern "C" fn()) -> ! {
        asm!(
            "push {{r0, lr}}",
            "mov r0, lr",
            "bl {push}",
            "pop {{r0, lr}}",
            "ldr lr, ={leave}",
            "bxns r0",
            push = sym push_shadow_frames,
            leave = sym __cfi_leave_interrupt,
            options(noreturn),
        )
    }

    /// Return half of the interrupt trampoline.
    ///
    /// Verifies the mirror against the hardware frames and completes the
    /// CPU's exception-return sequence with the EXC_RETURN recorded at entry.
    #[no_mangle]
    pub unsafe extern "C" fn __cfi_leave_interrupt() -> ! {
        let msp_ns = msp::read_ns();
        let psp_ns = psp::read_ns();
        let mem = NsMemory::new();
        let monitor = &mut *MONITOR.inner.get();
        let exc_return = monitor.verify(&mem, msp_ns, psp_ns);
        asm!("bx {0}", in(reg) exc_return, options(noreturn))
    }

    /// Records LR on the call shadow stack; returns to Non-Secure through
    /// r12, the convention instrumented prologues use.
    #[no_mangle]
    pub unsafe extern "C" fn __cfi_shadow_push() -> ! {
        asm!(
            "push {{r0-r3, r12, lr}}",
            "mov r0, lr",
            "bl {push}",
            "pop {{r0-r3, r12, lr}}",
            "bxns r12",
            push = sym push_return_address,
            options(noreturn),
        )
    }

    /// Pops the top call-stack entry and checks it against LR; returns to
    /// Non-Secure through r12.
    #[no_mangle]
    pub unsafe extern "C" fn __cfi_shadow_assert() -> ! {
        asm!(
            "push {{r0-r3, r12, lr}}",
            "mov r0, lr",
            "bl {check}",
            "pop {{r0-r3, r12, lr}}",
            "bxns r12",
            check = sym assert_return_address,
            options(noreturn),
        )
    }

    /// Pops the top call-stack entry and checks it against LR; returns to
    /// Non-Secure through LR itself, which the check just proved legitimate.
    #[no_mangle]
    pub unsafe extern "C" fn __cfi_shadow_assert_return() -> ! {
        asm!(
            "push {{r0-r3, r12, lr}}",
            "mov r0, lr",
            "bl {check}",
            "pop {{r0-r3, r12, lr}}",
            "bxns lr",
            check = sym assert_return_address,
            options(noreturn),
        )
    }
}

#[cfg(armv8m)]
pub use veneer::{
    __cfi_enter_interrupt, __cfi_leave_interrupt, __cfi_shadow_assert,
    __cfi_shadow_assert_return, __cfi_shadow_push,
};
