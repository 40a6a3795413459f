//! AArch64 stub ABI constants (register roles, frame geometry, slot sizes).
//!
//! This module centralizes every fixed register choice made by the generated stubs,
//! so the convention checks, the generators and the tests agree on them.

use crate::a64::Gpr;
use crate::a64::registers::{X9, X10, X11, X12, X13, X14, X15, X28};

// ── Register roles ──

/// Holds the current thread record for the whole stub.
pub const THREAD_REG: Gpr = X28;

/// Downcall temp 1. Also carries the native target address into the call.
pub const TMP1: Gpr = X9;

/// Downcall temp 2 (address of the thread state field for release stores).
pub const TMP2: Gpr = X10;

/// Scratch for the argument shuffle: cycle breaks and memory-to-memory moves.
///
/// `x8` is avoided because it is the indirect result register of the standard ABI.
pub const SHUFFLE_SCRATCH: Gpr = X11;

/// Context-adapter registers. All caller-saved, so the native callee may clobber them.
///
/// `x8` stays untouched for the same reason as in [`super::SHUFFLE_SCRATCH`].
pub mod adapter {
    use super::{Gpr, X9, X10, X11, X12, X13, X14, X15};

    /// Aligned stack size, then the native entry address.
    pub const SCRATCH: Gpr = X9;
    pub const CTX: Gpr = X10;
    pub const STACK_SIZE: Gpr = X11;
    pub const WORDS: Gpr = X12;
    pub const TMP: Gpr = X13;
    pub const SRC_PTR: Gpr = X14;
    pub const DST_PTR: Gpr = X15;

    pub const WORKING_SET: [Gpr; 7] = [SCRATCH, CTX, STACK_SIZE, WORDS, TMP, SRC_PTR, DST_PTR];
}

// ── Frame layout ──

pub const WORD_SIZE: u32 = 8;

/// Saved fp + lr, pushed by `enter()`.
pub const FRAME_HEADER_SIZE: u32 = 16;

/// Incoming stack arguments start above the saved fp/lr pair.
pub const INCOMING_ARGS_BIAS: i32 = 16;

/// Required `sp` alignment at every call.
pub const STACK_ALIGNMENT: u32 = 16;

/// Bytes per stack argument slot in both conventions.
pub const STACK_SLOT_SIZE: u32 = 8;

// ── Context record slots ──

pub const INTEGER_SLOT_SIZE: u32 = 8;
pub const VECTOR_SLOT_SIZE: u32 = 16;

/// Rounds `value` up to a power-of-two `alignment`, `None` on overflow.
#[must_use]
pub const fn align_up(value: u32, alignment: u32) -> Option<u32> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}
