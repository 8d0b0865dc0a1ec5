//! EXC_RETURN decoding
//!
//! On exception entry the CPU loads a magic value into LR that encodes which
//! stack holds the exception frame, which security state and mode to resume,
//! and the frame format. See the Armv8-M Architecture Reference Manual,
//! section B3.19, for the field layout.

use modular_bitfield::prelude::*;

/// Size in bytes of a standard (integer-only) hardware exception frame.
pub const STANDARD_FRAME_BYTES: u32 = 32;

/// Size in bytes of an extended hardware exception frame with FP state.
pub const EXTENDED_FRAME_BYTES: u32 = 104;

/// Decoded view of an EXC_RETURN value.
///
/// `spsel` selects the stack holding the exception frame (set: process
/// stack), `mode` the mode to resume (set: thread mode), `ftype` the frame
/// format (set: standard, no FP state stacked).
#[bitfield]
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ExcReturn {
    pub exception_secure: bool,
    #[skip]
    __: bool,
    pub spsel: bool,
    pub mode: bool,
    pub ftype: bool,
    pub dcrs: bool,
    pub secure_stack: bool,
    #[skip]
    __: B25,
}

impl ExcReturn {
    /// Bytes the hardware pushed for this activation's frame.
    pub fn frame_bytes(self) -> u32 {
        if self.ftype() {
            STANDARD_FRAME_BYTES
        } else {
            EXTENDED_FRAME_BYTES
        }
    }
}
