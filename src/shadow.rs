//! Shadow stacks
//!
//! Secure-only mirrors of the state that an attacker in control of
//! Non-Secure memory must not be able to forge: a stack of exception-frame
//! snapshots pushed on interrupt entry and checked on interrupt return, and a
//! stack of function return addresses maintained by instrumented
//! prologues/epilogues. Each thread owns one of each; the monitor keeps the
//! running thread's stacks loaded and swaps the pointer triples on context
//! switch.

use core::mem::size_of;
use core::ptr;

use crate::entry_pc::EntryPcSet;
use crate::mem::ReadWords;
use crate::walker::{FrameWalker, WalkStep};

/// Snapshot of the integrity-critical fields of one hardware exception frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ShadowFrame {
    /// Saved program counter of the interrupted code.
    pub pc: u32,
    /// Saved LR of the interrupted code.
    pub lr: u32,
    /// EXC_RETURN of the activation that produced the frame.
    pub exc_return: u32,
    /// Address at which the hardware deposited the frame.
    pub frame: u32,
}

/// One thread's exception shadow stack.
///
/// `start` and `limit` bound a region of arena storage; `top` is one past the
/// last occupied slot, so `top == start` means empty. Context switches copy
/// the three pointers wholesale; the mirrored frames themselves never move.
#[derive(Debug, Copy, Clone)]
pub struct ShadowStack {
    start: *mut ShadowFrame,
    top: *mut ShadowFrame,
    limit: *mut ShadowFrame,
}

impl ShadowStack {
    /// A stack over no storage. Pushing onto it overflows immediately.
    pub const fn unbound() -> Self {
        ShadowStack {
            start: ptr::null_mut(),
            top: ptr::null_mut(),
            limit: ptr::null_mut(),
        }
    }

    /// Binds an empty stack over `bytes` bytes of storage at `region`.
    ///
    /// # Safety
    ///
    /// The region must be writable, aligned for [`ShadowFrame`] and reserved
    /// for this stack as long as any copy of it is live.
    pub unsafe fn bind(region: *mut u8, bytes: usize) -> Self {
        let start = region as *mut ShadowFrame;
        ShadowStack {
            start,
            top: start,
            limit: start.add(bytes / size_of::<ShadowFrame>()),
        }
    }

    /// Number of occupied slots.
    pub fn depth(&self) -> usize {
        (self.top as usize - self.start as usize) / size_of::<ShadowFrame>()
    }

    fn is_empty(&self) -> bool {
        self.top == self.start
    }

    /// Pushes one pre-staged frame.
    ///
    /// Used to seed the stack of a thread that has never run: its scheduler
    /// will start it by popping a staged exception frame, and the mirror of
    /// that frame must already be in place for the verify half to accept the
    /// switch.
    pub fn push_simulated(&mut self, frame: ShadowFrame) {
        if self.top == self.limit {
            crate::fatal("shadow exception stack overflow");
        }
        unsafe {
            self.top.write(frame);
            self.top = self.top.add(1);
        }
    }

    /// Mirrors every in-flight exception frame not yet on the stack.
    ///
    /// The walker yields frames innermost first. Frames are appended until
    /// the walk reaches the previously mirrored top (matched by frame
    /// address) or runs out, then the appended run is reversed in place so
    /// the stack stays innermost-on-top. One pass, no frame counted twice.
    pub fn push(
        &mut self,
        mem: &impl ReadWords,
        entry_pcs: &EntryPcSet,
        exc_return: u32,
        msp: u32,
        psp: u32,
    ) {
        let mut walker = FrameWalker::new(mem, exc_return, msp, psp);
        let anchor = if self.is_empty() {
            None
        } else {
            Some(unsafe { (*self.top.sub(1)).frame })
        };

        let run_start = self.top;
        let mut run_end = self.top;
        loop {
            let frame = walker.shadow_frame();
            if anchor == Some(frame.frame) {
                break;
            }
            if run_end == self.limit {
                crate::fatal("shadow exception stack overflow");
            }
            unsafe {
                run_end.write(frame);
                run_end = run_end.add(1);
            }
            if walker.move_next(entry_pcs) != WalkStep::NextFrame {
                break;
            }
        }

        let mut lo = run_start;
        let mut hi = run_end;
        while lo < hi {
            unsafe {
                hi = hi.sub(1);
                ptr::swap(lo, hi);
                lo = lo.add(1);
            }
        }

        self.top = run_end;
    }

    /// Checks the mirror against live Non-Secure memory and pops the
    /// innermost frame.
    ///
    /// Returns the EXC_RETURN recorded at push time; the caller completes
    /// the CPU's exception return with it. The frame below the innermost one
    /// is checked as well when the walker can reach it: comparing two frames
    /// is the minimum that catches both innermost tampering and single-frame
    /// injection.
    pub fn verify(
        &mut self,
        mem: &impl ReadWords,
        entry_pcs: &EntryPcSet,
        msp: u32,
        psp: u32,
    ) -> u32 {
        if self.is_empty() {
            crate::fatal("shadow exception stack underflow");
        }
        let expected = unsafe { *self.top.sub(1) };

        let mut walker = FrameWalker::new(mem, expected.exc_return, msp, psp);
        if walker.shadow_frame() != expected {
            crate::fatal("exception frame mismatch");
        }
        if walker.move_next(entry_pcs) == WalkStep::NextFrame {
            if self.depth() < 2 {
                crate::fatal("shadow stack missing chained frame");
            }
            if walker.shadow_frame() != unsafe { *self.top.sub(2) } {
                crate::fatal("chained exception frame mismatch");
            }
        }

        self.top = unsafe { self.top.sub(1) };
        expected.exc_return
    }

    #[cfg(test)]
    pub(crate) fn frame_at(&self, index: usize) -> ShadowFrame {
        assert!(index < self.depth());
        unsafe { *self.start.add(index) }
    }
}

/// One thread's function-return shadow stack.
///
/// Instrumented prologues push the live LR here and the matching epilogues
/// assert it back; entries are plain return addresses.
#[derive(Debug, Copy, Clone)]
pub struct CallStack {
    start: *mut u32,
    top: *mut u32,
    limit: *mut u32,
}

impl CallStack {
    /// A stack over no storage.
    pub const fn unbound() -> Self {
        CallStack {
            start: ptr::null_mut(),
            top: ptr::null_mut(),
            limit: ptr::null_mut(),
        }
    }

    /// Binds an empty stack holding up to `entries` return addresses.
    ///
    /// # Safety
    ///
    /// Same region contract as [`ShadowStack::bind`].
    pub unsafe fn bind(region: *mut u8, entries: usize) -> Self {
        let start = region as *mut u32;
        CallStack {
            start,
            top: start,
            limit: start.add(entries),
        }
    }

    /// Number of recorded return addresses.
    pub fn depth(&self) -> usize {
        (self.top as usize - self.start as usize) / size_of::<u32>()
    }

    /// Records `ret` as the only legitimate return address for the frame
    /// being entered.
    pub fn push(&mut self, ret: u32) {
        if self.top == self.limit {
            crate::fatal("shadow call stack overflow");
        }
        unsafe {
            self.top.write(ret);
            self.top = self.top.add(1);
        }
    }

    /// Pops the top entry and checks the epilogue's LR against it.
    pub fn assert_return(&mut self, ret: u32) {
        if self.top == self.start {
            crate::fatal("shadow call stack underflow");
        }
        unsafe {
            self.top = self.top.sub(1);
            if self.top.read() != ret {
                crate::fatal("return address mismatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::mem::MaybeUninit;

    use super::{CallStack, ShadowFrame, ShadowStack};
    use crate::entry_pc::EntryPcSet;
    use crate::mem::fixture::RamImage;

    const RAM_BASE: u32 = 0x2002_0000;

    struct Fixture {
        ram: RamImage<128>,
        set: EntryPcSet,
    }

    impl Fixture {
        fn new() -> Self {
            let mut ram = RamImage::new(RAM_BASE);
            let vtor = RAM_BASE + 4 * 100;
            ram.words[100] = 0xBEEF_0006;
            ram.words[101] = 0x0020_0201;
            ram.words[102] = 0x0020_0101;
            ram.words[103] = 0x0020_0105;
            ram.words[104] = 0x0020_0109;
            ram.words[105] = 0x0020_010D;
            let set = EntryPcSet::load(&ram, vtor);
            Fixture { ram, set }
        }

        fn write_frame(&mut self, addr: u32, pc: u32, lr: u32) {
            let base = self.ram.index_of(addr);
            self.ram.words[base + 5] = lr;
            self.ram.words[base + 6] = pc;
        }
    }

    fn stack(buf: &mut [MaybeUninit<ShadowFrame>]) -> ShadowStack {
        unsafe {
            ShadowStack::bind(
                buf.as_mut_ptr() as *mut u8,
                buf.len() * core::mem::size_of::<ShadowFrame>(),
            )
        }
    }

    #[test]
    fn push_mirrors_a_single_frame() {
        let mut fx = Fixture::new();
        fx.write_frame(RAM_BASE, 0x0000_8000, 0xFFFF_FFF9);

        let mut buf = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF9, RAM_BASE, 0);

        assert_eq!(ss.depth(), 1);
        assert_eq!(
            ss.frame_at(0),
            ShadowFrame {
                pc: 0x0000_8000,
                lr: 0xFFFF_FFF9,
                exc_return: 0xFFFF_FFF9,
                frame: RAM_BASE,
            }
        );
    }

    #[test]
    fn push_mirrors_the_whole_chain_innermost_on_top() {
        let mut fx = Fixture::new();
        let psp = RAM_BASE + 0x40;
        let msp = RAM_BASE;
        fx.write_frame(psp, 0x0000_4000, 0x0000_1234);
        fx.write_frame(msp, 0x0020_0104, 0xFFFF_FFFD);

        let mut buf = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF1, msp, psp);

        assert_eq!(ss.depth(), 2);
        // outermost first in storage, innermost on top
        assert_eq!(ss.frame_at(0).frame, psp);
        assert_eq!(ss.frame_at(1).frame, msp);
        assert_eq!(ss.frame_at(1).pc, 0x0020_0104);
    }

    #[test]
    fn push_stops_at_the_previously_mirrored_top() {
        let mut fx = Fixture::new();
        let psp = RAM_BASE + 0x40;
        let msp = RAM_BASE;
        fx.write_frame(psp, 0x0000_4000, 0x0000_1234);

        let mut buf = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        // the outer activation was mirrored earlier
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFFD, 0, psp);
        assert_eq!(ss.depth(), 1);

        // a new interrupt catches the outer trampoline: only the inner frame
        // is new
        fx.write_frame(msp, 0x0020_0104, 0xFFFF_FFFD);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF1, msp, psp);

        assert_eq!(ss.depth(), 2);
        assert_eq!(ss.frame_at(0).frame, psp);
        assert_eq!(ss.frame_at(1).frame, msp);
    }

    #[test]
    fn verify_pops_and_returns_the_pushed_exc_return() {
        let mut fx = Fixture::new();
        fx.write_frame(RAM_BASE, 0x0000_8000, 0xFFFF_FFF9);

        let mut buf = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF9, RAM_BASE, 0);

        assert_eq!(ss.verify(&fx.ram, &fx.set, RAM_BASE, 0), 0xFFFF_FFF9);
        assert_eq!(ss.depth(), 0);
    }

    #[test]
    fn nested_push_verify_symmetry() {
        let mut fx = Fixture::new();
        let psp = RAM_BASE + 0x40;
        let msp = RAM_BASE;
        fx.write_frame(psp, 0x0000_4000, 0x0000_1234);
        fx.write_frame(msp, 0x0020_0104, 0xFFFF_FFFD);

        let mut buf = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF1, msp, psp);

        // inner activation returns; hardware has popped its frame
        assert_eq!(ss.verify(&fx.ram, &fx.set, msp, psp), 0xFFFF_FFF1);
        assert_eq!(ss.depth(), 1);
        // outer activation returns
        assert_eq!(ss.verify(&fx.ram, &fx.set, msp + 32, psp), 0xFFFF_FFFD);
        assert_eq!(ss.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "exception frame mismatch")]
    fn tampered_return_pc_is_fatal() {
        let mut fx = Fixture::new();
        fx.write_frame(RAM_BASE, 0x0000_8000, 0xFFFF_FFF9);

        let mut buf = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF9, RAM_BASE, 0);

        // attacker redirects the saved PC between entry and return
        let pc_word = fx.ram.index_of(RAM_BASE) + 6;
        fx.ram.words[pc_word] = 0x0000_8004;
        ss.verify(&fx.ram, &fx.set, RAM_BASE, 0);
    }

    #[test]
    #[should_panic(expected = "chained exception frame mismatch")]
    fn tampered_outer_frame_is_fatal() {
        let mut fx = Fixture::new();
        let psp = RAM_BASE + 0x40;
        let msp = RAM_BASE;
        fx.write_frame(psp, 0x0000_4000, 0x0000_1234);
        fx.write_frame(msp, 0x0020_0104, 0xFFFF_FFFD);

        let mut buf = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF1, msp, psp);

        let lr_word = fx.ram.index_of(psp) + 5;
        fx.ram.words[lr_word] = 0x0000_4321;
        ss.verify(&fx.ram, &fx.set, msp, psp);
    }

    #[test]
    #[should_panic(expected = "shadow exception stack underflow")]
    fn verify_on_an_empty_stack_is_fatal() {
        let fx = Fixture::new();
        let mut buf: [MaybeUninit<ShadowFrame>; 8] = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        ss.verify(&fx.ram, &fx.set, RAM_BASE, 0);
    }

    #[test]
    #[should_panic(expected = "shadow exception stack overflow")]
    fn push_past_the_limit_is_fatal() {
        let mut fx = Fixture::new();
        fx.write_frame(RAM_BASE, 0x0000_8000, 0xFFFF_FFF9);

        let mut buf = [MaybeUninit::uninit(); 1];
        let mut ss = stack(&mut buf);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF9, RAM_BASE, 0);
        // the mirrored frame address no longer matches, so this pushes again
        fx.write_frame(RAM_BASE + 0x80, 0x0000_8000, 0xFFFF_FFF9);
        ss.push(&fx.ram, &fx.set, 0xFFFF_FFF9, RAM_BASE + 0x80, 0);
    }

    #[test]
    fn simulated_frame_seeds_one_entry() {
        let mut buf = [MaybeUninit::uninit(); 8];
        let mut ss = stack(&mut buf);
        let staged = ShadowFrame {
            pc: 0x0000_4000,
            lr: 0xFFFF_FFFD,
            exc_return: 0xFFFF_FFBC,
            frame: 0x2001_0000,
        };
        ss.push_simulated(staged);
        assert_eq!(ss.depth(), 1);
        assert_eq!(ss.frame_at(0), staged);
    }

    #[test]
    fn call_stack_is_lifo() {
        let mut buf = [0u32; 8];
        let mut cs = unsafe { CallStack::bind(buf.as_mut_ptr() as *mut u8, buf.len()) };
        cs.push(0x0000_1001);
        cs.push(0x0000_2001);
        assert_eq!(cs.depth(), 2);
        cs.assert_return(0x0000_2001);
        cs.assert_return(0x0000_1001);
        assert_eq!(cs.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "return address mismatch")]
    fn call_stack_mismatch_is_fatal() {
        let mut buf = [0u32; 8];
        let mut cs = unsafe { CallStack::bind(buf.as_mut_ptr() as *mut u8, buf.len()) };
        cs.push(0x0000_1001);
        cs.assert_return(0x0000_1005);
    }

    #[test]
    #[should_panic(expected = "shadow call stack underflow")]
    fn call_stack_underflow_is_fatal() {
        let mut buf = [0u32; 8];
        let mut cs = unsafe { CallStack::bind(buf.as_mut_ptr() as *mut u8, buf.len()) };
        cs.assert_return(0x0000_1001);
    }

    #[test]
    #[should_panic(expected = "shadow call stack overflow")]
    fn call_stack_overflow_is_fatal() {
        let mut buf = [0u32; 2];
        let mut cs = unsafe { CallStack::bind(buf.as_mut_ptr() as *mut u8, buf.len()) };
        cs.push(1);
        cs.push(2);
        cs.push(3);
    }
}
