use std::fmt;

use super::registers::{Fpr, Gpr};

/// Condition codes for `b.cond` and `cset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Cond {
    #[must_use]
    pub const fn invert(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Hs => Self::Lo,
            Self::Lo => Self::Hs,
            Self::Mi => Self::Pl,
            Self::Pl => Self::Mi,
            Self::Vs => Self::Vc,
            Self::Vc => Self::Vs,
            Self::Hi => Self::Ls,
            Self::Ls => Self::Hi,
            Self::Ge => Self::Lt,
            Self::Lt => Self::Ge,
            Self::Gt => Self::Le,
            Self::Le => Self::Gt,
            Self::Al => Self::Al,
        }
    }

    const fn mnemonic(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Hs => "hs",
            Self::Lo => "lo",
            Self::Mi => "mi",
            Self::Pl => "pl",
            Self::Vs => "vs",
            Self::Vc => "vc",
            Self::Hi => "hi",
            Self::Ls => "ls",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Al => "al",
        }
    }
}

/// Access width of a general-purpose load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B8,
    W32,
    X64,
}

impl Width {
    #[must_use]
    pub const fn scale_log2(self) -> u32 {
        match self {
            Self::B8 => 0,
            Self::W32 => 2,
            Self::X64 => 3,
        }
    }

    #[must_use]
    pub const fn bytes(self) -> u32 {
        1 << self.scale_log2()
    }

    const fn size_field(self) -> u32 {
        match self {
            Self::B8 => 0b00,
            Self::W32 => 0b10,
            Self::X64 => 0b11,
        }
    }
}

/// Access size of an FP/SIMD load, store or move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpSize {
    S,
    D,
    Q,
}

impl FpSize {
    #[must_use]
    pub const fn scale_log2(self) -> u32 {
        match self {
            Self::S => 2,
            Self::D => 3,
            Self::Q => 4,
        }
    }

    #[must_use]
    pub const fn bytes(self) -> u32 {
        1 << self.scale_log2()
    }

    /// (`size`, `opc` for a store) fields; loads set the low `opc` bit.
    const fn fields(self) -> (u32, u32) {
        match self {
            Self::S => (0b10, 0b00),
            Self::D => (0b11, 0b00),
            Self::Q => (0b00, 0b10),
        }
    }

    const fn prefix(self) -> char {
        match self {
            Self::S => 's',
            Self::D => 'd',
            Self::Q => 'q',
        }
    }
}

/// Writeback mode of an indexed load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    /// `[base, #imm]!`
    Pre,
    /// `[base], #imm`
    Post,
}

/// The A64 instruction forms used by the invoker stubs.
///
/// Register operands that may name `sp` are noted per variant; everywhere else
/// register 31 is the zero register. Branch and `adr` offsets are byte offsets
/// relative to the instruction itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `mov xd, xm` (`orr xd, xzr, xm`).
    Mov { dst: Gpr, src: Gpr },
    /// `mov` to or from `sp` (`add xd, xn, #0`).
    MovSp { dst: Gpr, src: Gpr },
    Movz { dst: Gpr, imm: u16, shift: u8 },
    Movk { dst: Gpr, imm: u16, shift: u8 },
    /// `add xd|sp, xn|sp, #imm12`
    AddImm { dst: Gpr, src: Gpr, imm: u16 },
    /// `sub xd|sp, xn|sp, #imm12`
    SubImm { dst: Gpr, src: Gpr, imm: u16 },
    /// `sub xd|sp, xn|sp, xm, uxtx`
    SubExt { dst: Gpr, src: Gpr, rm: Gpr },
    Sbfm {
        wide: bool,
        dst: Gpr,
        src: Gpr,
        immr: u8,
        imms: u8,
    },
    Ubfm {
        wide: bool,
        dst: Gpr,
        src: Gpr,
        immr: u8,
        imms: u8,
    },
    /// `cmp rn, #imm12` (`subs zr, rn, #imm`)
    CmpImm { wide: bool, src: Gpr, imm: u16 },
    /// `cmp rn, rm` (`subs zr, rn, rm`)
    CmpReg { wide: bool, lhs: Gpr, rhs: Gpr },
    /// `cset wd, cond`
    Cset { dst: Gpr, cond: Cond },
    /// Base may be `sp`.
    Ldr {
        width: Width,
        dst: Gpr,
        base: Gpr,
        offset: i32,
    },
    Ldrsw { dst: Gpr, base: Gpr, offset: i32 },
    Str {
        width: Width,
        src: Gpr,
        base: Gpr,
        offset: i32,
    },
    /// 64-bit load with base writeback.
    LdrIdx {
        dst: Gpr,
        base: Gpr,
        imm: i16,
        index: Index,
    },
    /// 64-bit store with base writeback.
    StrIdx {
        src: Gpr,
        base: Gpr,
        imm: i16,
        index: Index,
    },
    Stp {
        first: Gpr,
        second: Gpr,
        base: Gpr,
        imm: i16,
        index: Index,
    },
    Ldp {
        first: Gpr,
        second: Gpr,
        base: Gpr,
        imm: i16,
        index: Index,
    },
    LdrFp {
        size: FpSize,
        dst: Fpr,
        base: Gpr,
        offset: i32,
    },
    StrFp {
        size: FpSize,
        src: Fpr,
        base: Gpr,
        offset: i32,
    },
    /// Scalar register copy; `size` is `S` or `D`.
    FmovReg { size: FpSize, dst: Fpr, src: Fpr },
    /// `fmov wd, sn` / `fmov xd, dn`
    FmovToGpr { size: FpSize, dst: Gpr, src: Fpr },
    /// `fmov sd, wn` / `fmov dd, xn`
    FmovFromGpr { size: FpSize, dst: Fpr, src: Gpr },
    /// Store-release; base may be `sp`.
    Stlr { wide: bool, src: Gpr, base: Gpr },
    /// Load-acquire; base may be `sp`.
    Ldar { wide: bool, dst: Gpr, base: Gpr },
    DmbIsh,
    Adr { dst: Gpr, offset: i32 },
    B { offset: i32 },
    BCond { cond: Cond, offset: i32 },
    Cbz { wide: bool, reg: Gpr, offset: i32 },
    Cbnz { wide: bool, reg: Gpr, offset: i32 },
    Blr { target: Gpr },
    Ret { target: Gpr },
}

impl Instruction {
    /// Every instruction is one 32-bit word.
    pub const SIZE: usize = 4;

    /// Encode to the little-endian instruction word.
    ///
    /// Out-of-range immediates are masked to their field width; the assembler
    /// checks ranges before an instruction is emitted.
    #[must_use]
    pub fn encode(&self) -> u32 {
        match self {
            Self::Mov { dst, src } => 0xAA00_03E0 | src.enc() << 16 | dst.enc(),
            Self::MovSp { dst, src } => 0x9100_0000 | src.enc() << 5 | dst.enc(),
            Self::Movz { dst, imm, shift } => {
                0xD280_0000 | u32::from(shift / 16) << 21 | u32::from(*imm) << 5 | dst.enc()
            }
            Self::Movk { dst, imm, shift } => {
                0xF280_0000 | u32::from(shift / 16) << 21 | u32::from(*imm) << 5 | dst.enc()
            }
            Self::AddImm { dst, src, imm } => {
                0x9100_0000 | (u32::from(*imm) & 0xFFF) << 10 | src.enc() << 5 | dst.enc()
            }
            Self::SubImm { dst, src, imm } => {
                0xD100_0000 | (u32::from(*imm) & 0xFFF) << 10 | src.enc() << 5 | dst.enc()
            }
            Self::SubExt { dst, src, rm } => {
                0xCB20_6000 | rm.enc() << 16 | src.enc() << 5 | dst.enc()
            }
            Self::Sbfm {
                wide,
                dst,
                src,
                immr,
                imms,
            } => {
                let base = if *wide { 0x9340_0000 } else { 0x1300_0000 };
                encode_bitfield(base, *immr, *imms, *src, *dst)
            }
            Self::Ubfm {
                wide,
                dst,
                src,
                immr,
                imms,
            } => {
                let base = if *wide { 0xD340_0000 } else { 0x5300_0000 };
                encode_bitfield(base, *immr, *imms, *src, *dst)
            }
            Self::CmpImm { wide, src, imm } => {
                let base = if *wide { 0xF100_0000 } else { 0x7100_0000 };
                base | (u32::from(*imm) & 0xFFF) << 10 | src.enc() << 5 | 0x1F
            }
            Self::CmpReg { wide, lhs, rhs } => {
                let base = if *wide { 0xEB00_0000 } else { 0x6B00_0000 };
                base | rhs.enc() << 16 | lhs.enc() << 5 | 0x1F
            }
            Self::Cset { dst, cond } => {
                0x1A9F_07E0 | u32::from(cond.invert() as u8) << 12 | dst.enc()
            }
            Self::Ldr {
                width,
                dst,
                base,
                offset,
            } => encode_load_store(
                width.size_field(),
                0,
                0b01,
                *offset,
                width.scale_log2(),
                base.enc(),
                dst.enc(),
            ),
            Self::Ldrsw { dst, base, offset } => {
                encode_load_store(0b10, 0, 0b10, *offset, 2, base.enc(), dst.enc())
            }
            Self::Str {
                width,
                src,
                base,
                offset,
            } => encode_load_store(
                width.size_field(),
                0,
                0b00,
                *offset,
                width.scale_log2(),
                base.enc(),
                src.enc(),
            ),
            Self::LdrIdx {
                dst,
                base,
                imm,
                index,
            } => encode_indexed(0b01, *imm, *index, base.enc(), dst.enc()),
            Self::StrIdx {
                src,
                base,
                imm,
                index,
            } => encode_indexed(0b00, *imm, *index, base.enc(), src.enc()),
            Self::Stp {
                first,
                second,
                base,
                imm,
                index,
            } => encode_pair(false, *imm, *index, *first, *second, *base),
            Self::Ldp {
                first,
                second,
                base,
                imm,
                index,
            } => encode_pair(true, *imm, *index, *first, *second, *base),
            Self::LdrFp {
                size,
                dst,
                base,
                offset,
            } => {
                let (size_field, opc) = size.fields();
                encode_load_store(
                    size_field,
                    1,
                    opc | 1,
                    *offset,
                    size.scale_log2(),
                    base.enc(),
                    dst.enc(),
                )
            }
            Self::StrFp {
                size,
                src,
                base,
                offset,
            } => {
                let (size_field, opc) = size.fields();
                encode_load_store(
                    size_field,
                    1,
                    opc,
                    *offset,
                    size.scale_log2(),
                    base.enc(),
                    src.enc(),
                )
            }
            Self::FmovReg { size, dst, src } => {
                let base = if *size == FpSize::S {
                    0x1E20_4000
                } else {
                    0x1E60_4000
                };
                base | src.enc() << 5 | dst.enc()
            }
            Self::FmovToGpr { size, dst, src } => {
                let base = if *size == FpSize::S {
                    0x1E26_0000
                } else {
                    0x9E66_0000
                };
                base | src.enc() << 5 | dst.enc()
            }
            Self::FmovFromGpr { size, dst, src } => {
                let base = if *size == FpSize::S {
                    0x1E27_0000
                } else {
                    0x9E67_0000
                };
                base | src.enc() << 5 | dst.enc()
            }
            Self::Stlr { wide, src, base } => {
                let op = if *wide { 0xC89F_FC00 } else { 0x889F_FC00 };
                op | base.enc() << 5 | src.enc()
            }
            Self::Ldar { wide, dst, base } => {
                let op = if *wide { 0xC8DF_FC00 } else { 0x88DF_FC00 };
                op | base.enc() << 5 | dst.enc()
            }
            Self::DmbIsh => 0xD503_3BBF,
            Self::Adr { dst, offset } => {
                let imm = (*offset as u32) & 0x1F_FFFF;
                0x1000_0000 | (imm & 0b11) << 29 | (imm >> 2) << 5 | dst.enc()
            }
            Self::B { offset } => 0x1400_0000 | ((offset >> 2) as u32 & 0x3FF_FFFF),
            Self::BCond { cond, offset } => {
                0x5400_0000 | imm19(*offset) << 5 | u32::from(*cond as u8)
            }
            Self::Cbz { wide, reg, offset } => {
                let op = if *wide { 0xB400_0000 } else { 0x3400_0000 };
                op | imm19(*offset) << 5 | reg.enc()
            }
            Self::Cbnz { wide, reg, offset } => {
                let op = if *wide { 0xB500_0000 } else { 0x3500_0000 };
                op | imm19(*offset) << 5 | reg.enc()
            }
            Self::Blr { target } => 0xD63F_0000 | target.enc() << 5,
            Self::Ret { target } => 0xD65F_0000 | target.enc() << 5,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        self.encode().to_le_bytes()
    }

    /// Mutable access to the pc-relative offset of branches and `adr`.
    pub fn pc_relative_offset_mut(&mut self) -> Option<&mut i32> {
        match self {
            Self::Adr { offset, .. }
            | Self::B { offset }
            | Self::BCond { offset, .. }
            | Self::Cbz { offset, .. }
            | Self::Cbnz { offset, .. } => Some(offset),
            _ => None,
        }
    }

    /// Largest reachable pc-relative distance, in bytes, for instructions with a label.
    #[must_use]
    pub const fn pc_relative_range(&self) -> Option<i32> {
        match self {
            Self::B { .. } => Some(1 << 27),
            Self::BCond { .. } | Self::Cbz { .. } | Self::Cbnz { .. } => Some(1 << 20),
            Self::Adr { .. } => Some(1 << 20),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        matches!(self, Self::B { .. } | Self::Ret { .. })
    }
}

/// True when `offset` fits the scaled unsigned 12-bit form.
#[must_use]
pub const fn fits_scaled(offset: i32, scale_log2: u32) -> bool {
    offset >= 0 && offset % (1 << scale_log2) == 0 && (offset >> scale_log2) < 4096
}

/// True when `offset` fits the unscaled signed 9-bit form.
#[must_use]
pub const fn fits_unscaled(offset: i32) -> bool {
    offset >= -256 && offset <= 255
}

fn encode_bitfield(base: u32, immr: u8, imms: u8, src: Gpr, dst: Gpr) -> u32 {
    base | (u32::from(immr) & 0x3F) << 16 | (u32::from(imms) & 0x3F) << 10 | src.enc() << 5 | dst.enc()
}

fn encode_load_store(
    size: u32,
    vector: u32,
    opc: u32,
    offset: i32,
    scale_log2: u32,
    rn: u32,
    rt: u32,
) -> u32 {
    let common = size << 30 | vector << 26 | opc << 22 | rn << 5 | rt;
    if fits_scaled(offset, scale_log2) {
        0x3900_0000 | common | ((offset >> scale_log2) as u32) << 10
    } else {
        0x3800_0000 | common | ((offset as u32) & 0x1FF) << 12
    }
}

fn encode_indexed(opc: u32, imm: i16, index: Index, rn: u32, rt: u32) -> u32 {
    let mode = match index {
        Index::Pre => 0b11,
        Index::Post => 0b01,
    };
    0xF800_0000 | opc << 22 | ((imm as u32) & 0x1FF) << 12 | mode << 10 | rn << 5 | rt
}

fn encode_pair(load: bool, imm: i16, index: Index, first: Gpr, second: Gpr, base: Gpr) -> u32 {
    let mode = match index {
        Index::Post => 0b001,
        Index::Pre => 0b011,
    };
    let imm7 = ((i32::from(imm) >> 3) as u32) & 0x7F;
    0xA800_0000
        | mode << 23
        | u32::from(load) << 22
        | imm7 << 15
        | second.enc() << 10
        | base.enc() << 5
        | first.enc()
}

fn imm19(offset: i32) -> u32 {
    ((offset >> 2) as u32) & 0x7FFFF
}

fn mem_operand(base: Gpr, offset: i32) -> String {
    if offset == 0 {
        format!("[{base}]")
    } else {
        format!("[{base}, #{offset}]")
    }
}

fn indexed_operand(base: Gpr, imm: i16, index: Index) -> String {
    match index {
        Index::Pre => format!("[{base}, #{imm}]!"),
        Index::Post => format!("[{base}], #{imm}"),
    }
}

fn ls_mnemonic(load: bool, offset: i32, scale_log2: u32) -> &'static str {
    match (load, fits_scaled(offset, scale_log2)) {
        (true, true) => "ldr",
        (true, false) => "ldur",
        (false, true) => "str",
        (false, false) => "stur",
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mov { dst, src } | Self::MovSp { dst, src } => write!(f, "mov {dst}, {src}"),
            Self::Movz { dst, imm, shift } => write!(f, "movz {dst}, #{imm:#x}, lsl #{shift}"),
            Self::Movk { dst, imm, shift } => write!(f, "movk {dst}, #{imm:#x}, lsl #{shift}"),
            Self::AddImm { dst, src, imm } => write!(f, "add {dst}, {src}, #{imm}"),
            Self::SubImm { dst, src, imm } => write!(f, "sub {dst}, {src}, #{imm}"),
            Self::SubExt { dst, src, rm } => write!(f, "sub {dst}, {src}, {rm}"),
            Self::Sbfm {
                wide,
                dst,
                src,
                immr,
                imms,
            } => write!(
                f,
                "sbfm {}, {}, #{immr}, #{imms}",
                dst.name(*wide),
                src.name(*wide)
            ),
            Self::Ubfm {
                wide,
                dst,
                src,
                immr,
                imms,
            } => write!(
                f,
                "ubfm {}, {}, #{immr}, #{imms}",
                dst.name(*wide),
                src.name(*wide)
            ),
            Self::CmpImm { wide, src, imm } => write!(f, "cmp {}, #{imm}", src.name(*wide)),
            Self::CmpReg { wide, lhs, rhs } => {
                write!(f, "cmp {}, {}", lhs.name(*wide), rhs.name(*wide))
            }
            Self::Cset { dst, cond } => write!(f, "cset {}, {}", dst.name(false), cond.mnemonic()),
            Self::Ldr {
                width,
                dst,
                base,
                offset,
            } => {
                let mnemonic = ls_mnemonic(true, *offset, width.scale_log2());
                let suffix = if *width == Width::B8 { "b" } else { "" };
                write!(
                    f,
                    "{mnemonic}{suffix} {}, {}",
                    dst.name(*width == Width::X64),
                    mem_operand(*base, *offset)
                )
            }
            Self::Ldrsw { dst, base, offset } => {
                let mnemonic = if fits_scaled(*offset, 2) {
                    "ldrsw"
                } else {
                    "ldursw"
                };
                write!(f, "{mnemonic} {dst}, {}", mem_operand(*base, *offset))
            }
            Self::Str {
                width,
                src,
                base,
                offset,
            } => {
                let mnemonic = ls_mnemonic(false, *offset, width.scale_log2());
                let suffix = if *width == Width::B8 { "b" } else { "" };
                write!(
                    f,
                    "{mnemonic}{suffix} {}, {}",
                    src.name(*width == Width::X64),
                    mem_operand(*base, *offset)
                )
            }
            Self::LdrIdx {
                dst,
                base,
                imm,
                index,
            } => write!(f, "ldr {dst}, {}", indexed_operand(*base, *imm, *index)),
            Self::StrIdx {
                src,
                base,
                imm,
                index,
            } => write!(f, "str {src}, {}", indexed_operand(*base, *imm, *index)),
            Self::Stp {
                first,
                second,
                base,
                imm,
                index,
            } => write!(
                f,
                "stp {first}, {second}, {}",
                indexed_operand(*base, *imm, *index)
            ),
            Self::Ldp {
                first,
                second,
                base,
                imm,
                index,
            } => write!(
                f,
                "ldp {first}, {second}, {}",
                indexed_operand(*base, *imm, *index)
            ),
            Self::LdrFp {
                size,
                dst,
                base,
                offset,
            } => write!(
                f,
                "{} {}{}, {}",
                ls_mnemonic(true, *offset, size.scale_log2()),
                size.prefix(),
                dst.index(),
                mem_operand(*base, *offset)
            ),
            Self::StrFp {
                size,
                src,
                base,
                offset,
            } => write!(
                f,
                "{} {}{}, {}",
                ls_mnemonic(false, *offset, size.scale_log2()),
                size.prefix(),
                src.index(),
                mem_operand(*base, *offset)
            ),
            Self::FmovReg { size, dst, src } => write!(
                f,
                "fmov {p}{}, {p}{}",
                dst.index(),
                src.index(),
                p = size.prefix()
            ),
            Self::FmovToGpr { size, dst, src } => write!(
                f,
                "fmov {}, {}{}",
                dst.name(*size != FpSize::S),
                size.prefix(),
                src.index()
            ),
            Self::FmovFromGpr { size, dst, src } => write!(
                f,
                "fmov {}{}, {}",
                size.prefix(),
                dst.index(),
                src.name(*size != FpSize::S)
            ),
            Self::Stlr { wide, src, base } => write!(f, "stlr {}, [{base}]", src.name(*wide)),
            Self::Ldar { wide, dst, base } => write!(f, "ldar {}, [{base}]", dst.name(*wide)),
            Self::DmbIsh => f.write_str("dmb ish"),
            Self::Adr { dst, offset } => write!(f, "adr {dst}, #{offset}"),
            Self::B { offset } => write!(f, "b #{offset}"),
            Self::BCond { cond, offset } => write!(f, "b.{} #{offset}", cond.mnemonic()),
            Self::Cbz { wide, reg, offset } => write!(f, "cbz {}, #{offset}", reg.name(*wide)),
            Self::Cbnz { wide, reg, offset } => {
                write!(f, "cbnz {}, #{offset}", reg.name(*wide))
            }
            Self::Blr { target } => write!(f, "blr {target}"),
            Self::Ret { target } => write!(f, "ret {target}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a64::registers::{FP, LR, V0, X0, X1, X9, X10, X13, X14, X28};

    #[test]
    fn test_frame_entry_encodings() {
        let stp = Instruction::Stp {
            first: FP,
            second: LR,
            base: Gpr::SP,
            imm: -16,
            index: Index::Pre,
        };
        assert_eq!(stp.encode(), 0xA9BF_7BFD);

        let ldp = Instruction::Ldp {
            first: FP,
            second: LR,
            base: Gpr::SP,
            imm: 16,
            index: Index::Post,
        };
        assert_eq!(ldp.encode(), 0xA8C1_7BFD);

        assert_eq!(Instruction::MovSp { dst: FP, src: Gpr::SP }.encode(), 0x9100_03FD);
        assert_eq!(Instruction::Ret { target: LR }.encode(), 0xD65F_03C0);
    }

    #[test]
    fn test_register_moves_and_extensions() {
        assert_eq!(Instruction::Mov { dst: X0, src: X1 }.encode(), 0xAA01_03E0);
        // sxtw x0, w0
        let sxtw = Instruction::Sbfm {
            wide: true,
            dst: X0,
            src: X0,
            immr: 0,
            imms: 31,
        };
        assert_eq!(sxtw.encode(), 0x9340_7C00);
        // uxth w0, w0
        let uxth = Instruction::Ubfm {
            wide: false,
            dst: X0,
            src: X0,
            immr: 0,
            imms: 15,
        };
        assert_eq!(uxth.encode(), 0x5300_3C00);
        assert_eq!(
            Instruction::Cset {
                dst: X0,
                cond: Cond::Ne
            }
            .encode(),
            0x1A9F_07E0
        );
    }

    #[test]
    fn test_load_store_forms() {
        let ldr = Instruction::Ldr {
            width: Width::X64,
            dst: X0,
            base: X1,
            offset: 8,
        };
        assert_eq!(ldr.encode(), 0xF940_0420);

        // Negative offsets fall back to the unscaled form: ldur x10, [x29, #-16]
        let ldur = Instruction::Ldr {
            width: Width::X64,
            dst: X10,
            base: FP,
            offset: -16,
        };
        assert_eq!(ldur.encode(), 0xF85F_03AA);
        assert!(ldur.to_string().starts_with("ldur"));

        let push = Instruction::StrIdx {
            src: X0,
            base: Gpr::SP,
            imm: -16,
            index: Index::Pre,
        };
        assert_eq!(push.encode(), 0xF81F_0FE0);

        let post = Instruction::LdrIdx {
            dst: X13,
            base: X14,
            imm: 8,
            index: Index::Post,
        };
        assert_eq!(post.encode(), 0xF840_85CD);

        let ldrq = Instruction::LdrFp {
            size: FpSize::Q,
            dst: V0,
            base: X10,
            offset: 32,
        };
        assert_eq!(ldrq.encode(), 0x3DC0_0940);

        let ldrb = Instruction::Ldr {
            width: Width::B8,
            dst: X9,
            base: X28,
            offset: 3,
        };
        assert_eq!(ldrb.encode(), 0x3940_0F89);
    }

    #[test]
    fn test_ordering_and_control_flow() {
        assert_eq!(Instruction::DmbIsh.encode(), 0xD503_3BBF);
        assert_eq!(
            Instruction::Stlr {
                wide: false,
                src: X9,
                base: X10
            }
            .encode(),
            0x889F_FD49
        );
        assert_eq!(Instruction::Blr { target: X9 }.encode(), 0xD63F_0120);
        assert_eq!(Instruction::B { offset: -8 }.encode(), 0x17FF_FFFE);
        assert_eq!(
            Instruction::Cbz {
                wide: true,
                reg: X0,
                offset: 8
            }
            .encode(),
            0xB400_0040
        );
        assert_eq!(
            Instruction::BCond {
                cond: Cond::Eq,
                offset: 12
            }
            .encode(),
            0x5400_0060
        );
    }

    #[test]
    fn test_pc_relative_fixup_access() {
        let mut b = Instruction::B { offset: 0 };
        *b.pc_relative_offset_mut().expect("branch") = 16;
        assert_eq!(b, Instruction::B { offset: 16 });
        assert!(Instruction::DmbIsh.pc_relative_offset_mut().is_none());
        assert!(b.is_terminating());
    }
}
