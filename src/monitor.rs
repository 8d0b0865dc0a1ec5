//! The monitor capability record
//!
//! One [`Monitor`] owns every piece of mutable monitor state: the arena, the
//! thread table, the entry-PC set and the active shadow stacks. The gateway
//! layer holds the sole instance; every internal component borrows it. There
//! are no other process-wide variables.

use crate::arena::Arena;
use crate::entry_pc::EntryPcSet;
use crate::mem::ReadWords;
use crate::shadow::{CallStack, ShadowStack};
use crate::thread::{CreateInfo, ThreadTable, EXC_STACK_BYTES};
use crate::Error;

/// Capacity of the monitor's arena in bytes. Policy, not protocol.
pub const ARENA_BYTES: usize = 8192;

// Entries in the boot context's call shadow stack.
const BOOT_CALL_ENTRIES: usize = 16;

const THREAD_ID_MASK: u32 = crate::thread::THREAD_CAPACITY as u32 - 1;

type MonitorArena = Arena<ARENA_BYTES>;

/// Event counters collected between `profiler_start` and `profiler_stop`.
#[cfg(feature = "profile")]
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Profile {
    /// Counting is armed.
    pub running: bool,
    /// Exception shadow stack pushes.
    pub exc_pushes: u32,
    /// Exception shadow stack verifies.
    pub exc_verifies: u32,
    /// Call shadow stack pushes.
    pub call_pushes: u32,
    /// Call shadow stack asserts.
    pub call_asserts: u32,
    /// Thread activations.
    pub context_switches: u32,
}

#[cfg(feature = "profile")]
impl Profile {
    const fn new() -> Self {
        Profile {
            running: false,
            exc_pushes: 0,
            exc_verifies: 0,
            call_pushes: 0,
            call_asserts: 0,
            context_switches: 0,
        }
    }
}

/// The monitor state.
pub struct Monitor {
    arena: MonitorArena,
    threads: ThreadTable,
    entry_pcs: EntryPcSet,
    // Shadow stacks of whatever runs right now; always a copy of the owning
    // thread's stored state.
    active_exc: ShadowStack,
    active_calls: CallStack,
    active_thread: Option<u32>,
    locked_down: bool,
    initialized: bool,
    #[cfg(feature = "profile")]
    profile: Profile,
}

impl Monitor {
    /// Creates a monitor with nothing configured.
    ///
    /// [`Monitor::initialize`] must run before the first interrupt can be
    /// taken. The value must not be moved once `initialize` has run: the
    /// shadow stacks point into the arena.
    pub const fn new() -> Self {
        Monitor {
            arena: MonitorArena::new(),
            threads: ThreadTable::new(),
            entry_pcs: EntryPcSet::empty(),
            active_exc: ShadowStack::unbound(),
            active_calls: CallStack::unbound(),
            active_thread: None,
            locked_down: false,
            initialized: false,
            #[cfg(feature = "profile")]
            profile: Profile::new(),
        }
    }

    /// Parses the Non-Secure vector table and seeds the boot shadow stacks.
    ///
    /// Called exactly once from Secure boot, before Non-Secure starts; a
    /// second call is fatal.
    pub fn initialize(&mut self, mem: &impl ReadWords, vector_table: u32) {
        if self.initialized {
            crate::fatal("monitor initialized twice");
        }
        self.entry_pcs = EntryPcSet::load(mem, vector_table);
        self.seed_boot_stacks();
        self.initialized = true;
    }

    // The boot context takes interrupts before any thread exists, so it gets
    // shadow stacks of its own. They are abandoned at the first activation;
    // the boot context never resumes once the scheduler is running.
    fn seed_boot_stacks(&mut self) {
        let exc = match self.arena.allocate_bytes(EXC_STACK_BYTES, 4) {
            Some(alloc) => alloc,
            None => crate::fatal("arena exhausted seeding boot stacks"),
        };
        let calls = match self.arena.allocate_bytes(BOOT_CALL_ENTRIES * 4, 4) {
            Some(alloc) => alloc,
            None => crate::fatal("arena exhausted seeding boot stacks"),
        };
        self.active_exc = unsafe { ShadowStack::bind(exc.ptr.as_ptr(), EXC_STACK_BYTES) };
        self.active_calls = unsafe { CallStack::bind(calls.ptr.as_ptr(), BOOT_CALL_ENTRIES) };
        self.active_thread = None;
    }

    /// Rewinds the arena and forgets every thread.
    ///
    /// Callers must recreate the threads they need; outstanding ids are
    /// invalid afterwards.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.check_privileged()?;
        self.arena.reset();
        self.threads.clear();
        if self.initialized {
            self.seed_boot_stacks();
        } else {
            self.active_exc = ShadowStack::unbound();
            self.active_calls = CallStack::unbound();
            self.active_thread = None;
        }
        Ok(())
    }

    /// Creates a thread, returning its id.
    ///
    /// The Non-Secure gateway always creates threads as not-yet-running;
    /// `running` exists for Secure boot configuration.
    pub fn create_thread(&mut self, info: &CreateInfo, running: bool) -> Result<u32, Error> {
        self.check_privileged()?;
        if info.flags != 0 {
            return Err(Error::InvalidArgument);
        }
        self.threads.create(&mut self.arena, info, running)
    }

    /// Makes thread `id` the one whose shadow stacks are live.
    ///
    /// Saves the active pointer triples into the outgoing thread's record
    /// and loads the incoming thread's. No frame data moves.
    pub fn activate_thread(&mut self, id: u32) -> Result<(), Error> {
        self.check_privileged()?;
        let incoming = match self.threads.lookup(id) {
            Some(thread) => thread,
            None => return Err(Error::InvalidArgument),
        };

        if let Some(current) = self.active_thread {
            if let Some(outgoing) = self.threads.lookup(current) {
                unsafe {
                    (*outgoing.as_ptr()).exc_stack = self.active_exc;
                    (*outgoing.as_ptr()).call_stack = self.active_calls;
                }
            }
        }

        // A self-activation reads back what was just saved.
        let incoming = unsafe { &*incoming.as_ptr() };
        self.active_exc = incoming.exc_stack;
        self.active_calls = incoming.call_stack;
        self.active_thread = Some(id & THREAD_ID_MASK);

        #[cfg(feature = "profile")]
        self.tally(|p| &mut p.context_switches);
        Ok(())
    }

    /// Locks the configuration down.
    ///
    /// One-way: reset, create and activate fail with `Unprivileged` from now
    /// on. Refused while the active exception shadow stack is non-empty,
    /// because a push/verify pair is then in flight.
    pub fn lockdown(&mut self) -> Result<(), Error> {
        if self.locked_down {
            return Ok(());
        }
        if self.active_exc.depth() != 0 {
            return Err(Error::InvalidOperation);
        }
        self.locked_down = true;
        Ok(())
    }

    /// Mirrors the in-flight exception frames on interrupt entry.
    pub fn push(&mut self, mem: &impl ReadWords, exc_return: u32, msp: u32, psp: u32) {
        self.active_exc
            .push(mem, &self.entry_pcs, exc_return, msp, psp);
        #[cfg(feature = "profile")]
        self.tally(|p| &mut p.exc_pushes);
    }

    /// Checks the mirror and pops the innermost frame on interrupt return.
    ///
    /// Returns the EXC_RETURN the matching push recorded.
    pub fn verify(&mut self, mem: &impl ReadWords, msp: u32, psp: u32) -> u32 {
        let exc_return = self.active_exc.verify(mem, &self.entry_pcs, msp, psp);
        #[cfg(feature = "profile")]
        self.tally(|p| &mut p.exc_verifies);
        exc_return
    }

    /// Records a return address on the active call shadow stack.
    pub fn push_return(&mut self, ret: u32) {
        self.active_calls.push(ret);
        #[cfg(feature = "profile")]
        self.tally(|p| &mut p.call_pushes);
    }

    /// Pops and checks a return address on the active call shadow stack.
    pub fn assert_return(&mut self, ret: u32) {
        self.active_calls.assert_return(ret);
        #[cfg(feature = "profile")]
        self.tally(|p| &mut p.call_asserts);
    }

    /// Depth of the active exception shadow stack.
    pub fn active_depth(&self) -> usize {
        self.active_exc.depth()
    }

    fn check_privileged(&self) -> Result<(), Error> {
        if self.locked_down {
            Err(Error::Unprivileged)
        } else {
            Ok(())
        }
    }

    /// Arms the profiler.
    #[cfg(feature = "profile")]
    pub fn profiler_start(&mut self) {
        self.profile.running = true;
    }

    /// Disarms the profiler, keeping the counters.
    #[cfg(feature = "profile")]
    pub fn profiler_stop(&mut self) {
        self.profile.running = false;
    }

    /// Snapshot of the collected counters.
    #[cfg(feature = "profile")]
    pub fn profile(&self) -> Profile {
        self.profile
    }

    #[cfg(feature = "profile")]
    fn tally(&mut self, counter: fn(&mut Profile) -> &mut u32) {
        if self.profile.running {
            *counter(&mut self.profile) += 1;
        }
    }

    #[cfg(test)]
    pub(crate) fn thread_view(&self, id: u32) -> Option<&crate::thread::Thread> {
        self.threads
            .lookup(id)
            .map(|thread| unsafe { &*thread.as_ptr() })
    }

    #[cfg(test)]
    pub(crate) fn active_stack(&self) -> &ShadowStack {
        &self.active_exc
    }
}
