//! Word reads from the Non-Secure address space
//!
//! Walking chained exception frames and parsing the Non-Secure vector table
//! are pointer walks into memory the monitor does not own and must never
//! write. Both go through this capability so that production code reads with
//! device-memory semantics while tests substitute a RAM image.

use volatile_register::RO;

/// Reads machine words from addresses supplied by Non-Secure state.
pub trait ReadWords {
    /// Reads the word at `addr`.
    fn read_word(&self, addr: u32) -> u32;
}

/// Production reader: one volatile load per word.
///
/// Non-Secure RAM can change under the monitor at any time, so every word is
/// read exactly once and never cached.
pub struct NsMemory(());

impl NsMemory {
    /// Creates the reader.
    ///
    /// # Safety
    ///
    /// The caller guarantees that every address later handed to
    /// [`ReadWords::read_word`] is readable from Secure state. The monitor
    /// meets this by only walking addresses derived from the Non-Secure
    /// stack pointers and vector table, whose attribution the SAU
    /// configuration (an external collaborator) pins down.
    pub const unsafe fn new() -> Self {
        NsMemory(())
    }
}

impl ReadWords for NsMemory {
    #[inline]
    fn read_word(&self, addr: u32) -> u32 {
        unsafe { (*(addr as usize as *const RO<u32>)).read() }
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use super::ReadWords;

    /// A fake span of Non-Secure RAM starting at `base`.
    pub(crate) struct RamImage<const WORDS: usize> {
        pub base: u32,
        pub words: [u32; WORDS],
    }

    impl<const WORDS: usize> RamImage<WORDS> {
        pub fn new(base: u32) -> Self {
            RamImage {
                base,
                words: [0; WORDS],
            }
        }

        /// Index of the word at `addr`.
        pub fn index_of(&self, addr: u32) -> usize {
            assert_eq!(addr % 4, 0, "unaligned word access");
            ((addr - self.base) / 4) as usize
        }
    }

    impl<const WORDS: usize> ReadWords for RamImage<WORDS> {
        fn read_word(&self, addr: u32) -> u32 {
            self.words[self.index_of(addr)]
        }
    }
}
