//! A64 register operands.
//!
//! Register number 31 means either the stack pointer or the zero register
//! depending on the instruction form, so both are kept as distinct values here
//! and collapse to the same 5-bit field only at encoding time.

use std::fmt;

/// A general-purpose register operand (`x0`-`x30`, `sp` or `xzr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gpr(u8);

impl Gpr {
    pub const SP: Self = Self(31);
    pub const ZR: Self = Self(32);

    /// Returns `x{n}` for `n < 31`.
    #[must_use]
    pub const fn new(n: u8) -> Option<Self> {
        if n < 31 { Some(Self(n)) } else { None }
    }

    /// Register number as it appears in the 5-bit encoding field.
    #[must_use]
    pub const fn enc(self) -> u32 {
        (self.0 & 0x1F) as u32
    }

    /// Index into a 31-entry register file, `None` for `sp` and `xzr`.
    #[must_use]
    pub const fn file_index(self) -> Option<usize> {
        if self.0 < 31 {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn is_sp(self) -> bool {
        self.0 == 31
    }

    #[must_use]
    pub const fn is_zr(self) -> bool {
        self.0 == 32
    }

    /// Assembler name for a 64-bit (`wide`) or 32-bit access.
    #[must_use]
    pub fn name(self, wide: bool) -> String {
        match (self.0, wide) {
            (31, true) => "sp".to_string(),
            (31, false) => "wsp".to_string(),
            (32, true) => "xzr".to_string(),
            (32, false) => "wzr".to_string(),
            (n, true) => format!("x{n}"),
            (n, false) => format!("w{n}"),
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name(true))
    }
}

/// An FP/SIMD register operand (`v0`-`v31`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fpr(u8);

impl Fpr {
    #[must_use]
    pub const fn new(n: u8) -> Option<Self> {
        if n < 32 { Some(Self(n)) } else { None }
    }

    #[must_use]
    pub const fn enc(self) -> u32 {
        self.0 as u32
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Fpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

pub const X0: Gpr = Gpr(0);
pub const X1: Gpr = Gpr(1);
pub const X2: Gpr = Gpr(2);
pub const X3: Gpr = Gpr(3);
pub const X4: Gpr = Gpr(4);
pub const X5: Gpr = Gpr(5);
pub const X6: Gpr = Gpr(6);
pub const X7: Gpr = Gpr(7);
pub const X8: Gpr = Gpr(8);
pub const X9: Gpr = Gpr(9);
pub const X10: Gpr = Gpr(10);
pub const X11: Gpr = Gpr(11);
pub const X12: Gpr = Gpr(12);
pub const X13: Gpr = Gpr(13);
pub const X14: Gpr = Gpr(14);
pub const X15: Gpr = Gpr(15);
pub const X28: Gpr = Gpr(28);
/// Frame pointer.
pub const FP: Gpr = Gpr(29);
/// Link register.
pub const LR: Gpr = Gpr(30);

pub const V0: Fpr = Fpr(0);
pub const V1: Fpr = Fpr(1);
pub const V2: Fpr = Fpr(2);
pub const V3: Fpr = Fpr(3);
pub const V4: Fpr = Fpr(4);
pub const V5: Fpr = Fpr(5);
pub const V6: Fpr = Fpr(6);
pub const V7: Fpr = Fpr(7);
