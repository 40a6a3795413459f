//! Test harness for native-invoker unit and integration tests
//!
//! Provides a small A64 interpreter that runs generated stubs directly from
//! their [`Instruction`] stream, a thread record image in simulated memory, and
//! instruction pattern matching for shape assertions.
//!
//! # Example
//!
//! ```rust
//! use native_invoker::test_harness::*;
//! use native_invoker::{DowncallSignature, Location, ValueType};
//! use native_invoker::a64::registers::X0;
//!
//! let sig = DowncallSignature::new(
//!     vec![ValueType::Long, ValueType::Long],
//!     ValueType::Long,
//!     vec![Location::Gpr(X0)],
//!     vec![Location::Gpr(X0)],
//! );
//! let stub = downcall_stub(&sig).unwrap();
//!
//! let mut m = Machine::new();
//! let thread = ThreadImage::install(&mut m);
//! m.register_host_fn(0x5000, |m| m.x[0] += 1);
//! m.x[1] = 0x5000;
//! m.x[2] = 41;
//! m.run(stub.code(), stub.address()).unwrap();
//! assert_eq!(m.x[0], 42);
//! assert_eq!(thread.state(&m), 8);
//! ```

#![allow(
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::manual_assert,
    clippy::missing_panics_doc,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::too_many_lines
)]

use std::collections::HashMap;

use crate::a64::{CodeBlob, Cond, FpSize, Fpr, Gpr, Index, Instruction, Width};
use crate::abi::THREAD_REG;
use crate::runtime::StandardRuntime;
use crate::stub::{HeapCodeAllocator, StubObject};
use crate::thread::{ExecutionState, POLL_DISARMED, StackGuardState, ThreadLayout};
use crate::{DowncallSignature, Result, make_native_invoker};

/// Link register value handed to the stub; returning to it ends the run.
pub const RETURN_SENTINEL: u64 = 0xDEAD_0000_0000;
/// Initial stack pointer of a fresh [`Machine`].
pub const STACK_TOP: u64 = 0x7000_0000;
/// Where [`ThreadImage::install`] places the thread record.
pub const THREAD_BASE: u64 = 0x2000_0000;

pub type HostFn = Box<dyn FnMut(&mut Machine)>;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
    #[error("branch to {0:#x}, outside the stub and not a host function")]
    UnknownTarget(u64),
    #[error("misaligned stack pointer {0:#x} at a call")]
    MisalignedCall(u64),
}

/// Memory-visible side effects, in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Store {
        addr: u64,
        size: u32,
        value: u128,
        release: bool,
    },
    LoadAcquire {
        addr: u64,
    },
    Barrier,
    HostCall {
        addr: u64,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

pub struct Machine {
    pub x: [u64; 31],
    pub sp: u64,
    pub v: [u128; 32],
    pub pc: u64,
    pub events: Vec<Event>,
    pub step_limit: usize,
    flags: Flags,
    memory: HashMap<u64, u8>,
    host_fns: HashMap<u64, HostFn>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            x: [0; 31],
            sp: STACK_TOP,
            v: [0; 32],
            pc: 0,
            events: Vec::new(),
            step_limit: 100_000,
            flags: Flags::default(),
            memory: HashMap::new(),
            host_fns: HashMap::new(),
        }
    }

    /// Calls through `blr` to `addr` run `f` instead and return to the caller.
    pub fn register_host_fn(&mut self, addr: u64, f: impl FnMut(&mut Machine) + 'static) {
        self.host_fns.insert(addr, Box::new(f));
    }

    pub fn gpr(&self, reg: Gpr) -> u64 {
        if reg.is_sp() {
            self.sp
        } else {
            reg.file_index().map_or(0, |i| self.x[i])
        }
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        if reg.is_sp() {
            self.sp = value;
        } else if let Some(i) = reg.file_index() {
            self.x[i] = value;
        }
    }

    pub fn fpr(&self, reg: Fpr) -> u128 {
        self.v[reg.index()]
    }

    pub fn set_fpr(&mut self, reg: Fpr, value: u128) {
        self.v[reg.index()] = value;
    }

    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| self.memory.get(&(addr + i)).copied().unwrap_or(0))
            .collect()
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *b);
        }
    }

    /// Little-endian load of `size` bytes, zero-extended.
    pub fn read(&self, addr: u64, size: u32) -> u128 {
        self.read_bytes(addr, size as usize)
            .iter()
            .rev()
            .fold(0u128, |acc, b| (acc << 8) | u128::from(*b))
    }

    pub fn write(&mut self, addr: u64, size: u32, value: u128) {
        let bytes = value.to_le_bytes();
        self.write_bytes(addr, &bytes[..size as usize]);
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        self.read(addr, 8) as u64
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, 8, u128::from(value));
    }

    fn store(&mut self, addr: u64, size: u32, value: u128, release: bool) {
        let value = value & mask128(size);
        self.write(addr, size, value);
        self.events.push(Event::Store {
            addr,
            size,
            value,
            release,
        });
    }

    /// Host calls recorded so far, by target address.
    pub fn host_calls(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::HostCall { addr } => Some(*addr),
                _ => None,
            })
            .collect()
    }

    /// Run `blob` placed at `base` from its first instruction.
    ///
    /// `lr` is set to [`RETURN_SENTINEL`]; the run ends when control reaches it
    /// or falls off the end of the code. Returns the number of steps taken.
    pub fn run(&mut self, blob: &CodeBlob, base: u64) -> std::result::Result<usize, SimError> {
        self.pc = base;
        self.x[30] = RETURN_SENTINEL;
        let end = base + blob.size_bytes() as u64;
        for step in 0..self.step_limit {
            if self.pc == RETURN_SENTINEL || self.pc == end {
                return Ok(step);
            }
            let Some(instr) = self.pc.checked_sub(base).and_then(|off| blob.instruction_at(off))
            else {
                return Err(SimError::UnknownTarget(self.pc));
            };
            let instr = instr.clone();
            self.step(&instr, base, end)?;
        }
        Err(SimError::StepLimit(self.step_limit))
    }

    fn step(&mut self, instr: &Instruction, base: u64, end: u64) -> std::result::Result<(), SimError> {
        let pc = self.pc;
        let mut next = pc + 4;
        match *instr {
            Instruction::Mov { dst, src } | Instruction::MovSp { dst, src } => {
                self.set_gpr(dst, self.gpr(src));
            }
            Instruction::Movz { dst, imm, shift } => {
                self.set_gpr(dst, u64::from(imm) << shift);
            }
            Instruction::Movk { dst, imm, shift } => {
                let cleared = self.gpr(dst) & !(0xFFFF_u64 << shift);
                self.set_gpr(dst, cleared | (u64::from(imm) << shift));
            }
            Instruction::AddImm { dst, src, imm } => {
                self.set_gpr(dst, self.gpr(src).wrapping_add(u64::from(imm)));
            }
            Instruction::SubImm { dst, src, imm } => {
                self.set_gpr(dst, self.gpr(src).wrapping_sub(u64::from(imm)));
            }
            Instruction::SubExt { dst, src, rm } => {
                self.set_gpr(dst, self.gpr(src).wrapping_sub(self.gpr(rm)));
            }
            Instruction::Sbfm {
                wide,
                dst,
                src,
                immr,
                imms,
            } => {
                let value = bitfield_move(self.gpr(src), wide, immr, imms, true);
                self.set_gpr(dst, value);
            }
            Instruction::Ubfm {
                wide,
                dst,
                src,
                immr,
                imms,
            } => {
                let value = bitfield_move(self.gpr(src), wide, immr, imms, false);
                self.set_gpr(dst, value);
            }
            Instruction::CmpImm { wide, src, imm } => {
                self.flags = sub_flags(self.gpr(src), u64::from(imm), wide);
            }
            Instruction::CmpReg { wide, lhs, rhs } => {
                self.flags = sub_flags(self.gpr(lhs), self.gpr(rhs), wide);
            }
            Instruction::Cset { dst, cond } => {
                self.set_gpr(dst, u64::from(self.holds(cond)));
            }
            Instruction::Ldr {
                width,
                dst,
                base: rn,
                offset,
            } => {
                let addr = self.gpr(rn).wrapping_add(offset as u64);
                let value = self.read(addr, width.bytes()) as u64;
                self.set_gpr(dst, value);
            }
            Instruction::Ldrsw {
                dst,
                base: rn,
                offset,
            } => {
                let addr = self.gpr(rn).wrapping_add(offset as u64);
                let value = self.read(addr, 4) as u32 as i32 as i64 as u64;
                self.set_gpr(dst, value);
            }
            Instruction::Str {
                width,
                src,
                base: rn,
                offset,
            } => {
                let addr = self.gpr(rn).wrapping_add(offset as u64);
                self.store(addr, width.bytes(), u128::from(self.gpr(src)), false);
            }
            Instruction::LdrIdx {
                dst,
                base: rn,
                imm,
                index,
            } => {
                let addr = self.indexed(rn, imm, index);
                let value = self.read_u64(addr);
                self.set_gpr(dst, value);
            }
            Instruction::StrIdx {
                src,
                base: rn,
                imm,
                index,
            } => {
                let value = self.gpr(src);
                let addr = self.indexed(rn, imm, index);
                self.store(addr, 8, u128::from(value), false);
            }
            Instruction::Stp {
                first,
                second,
                base: rn,
                imm,
                index,
            } => {
                let (a, b) = (self.gpr(first), self.gpr(second));
                let addr = self.indexed(rn, imm, index);
                self.store(addr, 8, u128::from(a), false);
                self.store(addr + 8, 8, u128::from(b), false);
            }
            Instruction::Ldp {
                first,
                second,
                base: rn,
                imm,
                index,
            } => {
                let addr = self.indexed(rn, imm, index);
                let (a, b) = (self.read_u64(addr), self.read_u64(addr + 8));
                self.set_gpr(first, a);
                self.set_gpr(second, b);
            }
            Instruction::LdrFp {
                size,
                dst,
                base: rn,
                offset,
            } => {
                let addr = self.gpr(rn).wrapping_add(offset as u64);
                let value = self.read(addr, size.bytes());
                self.set_fpr(dst, value);
            }
            Instruction::StrFp {
                size,
                src,
                base: rn,
                offset,
            } => {
                let addr = self.gpr(rn).wrapping_add(offset as u64);
                self.store(addr, size.bytes(), self.fpr(src), false);
            }
            Instruction::FmovReg { size, dst, src } => {
                self.set_fpr(dst, self.fpr(src) & mask128(size.bytes()));
            }
            Instruction::FmovToGpr { size, dst, src } => {
                self.set_gpr(dst, (self.fpr(src) & mask128(size.bytes())) as u64);
            }
            Instruction::FmovFromGpr { size, dst, src } => {
                self.set_fpr(dst, u128::from(self.gpr(src)) & mask128(size.bytes()));
            }
            Instruction::Stlr { wide, src, base: rn } => {
                let size = if wide { 8 } else { 4 };
                self.store(self.gpr(rn), size, u128::from(self.gpr(src)), true);
            }
            Instruction::Ldar { wide, dst, base: rn } => {
                let addr = self.gpr(rn);
                let size = if wide { 8 } else { 4 };
                let value = self.read(addr, size) as u64;
                self.events.push(Event::LoadAcquire { addr });
                self.set_gpr(dst, value);
            }
            Instruction::DmbIsh => self.events.push(Event::Barrier),
            Instruction::Adr { dst, offset } => {
                self.set_gpr(dst, pc.wrapping_add(offset as u64));
            }
            Instruction::B { offset } => next = pc.wrapping_add(offset as u64),
            Instruction::BCond { cond, offset } => {
                if self.holds(cond) {
                    next = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Cbz { wide, reg, offset } => {
                if truncate(self.gpr(reg), wide) == 0 {
                    next = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Cbnz { wide, reg, offset } => {
                if truncate(self.gpr(reg), wide) != 0 {
                    next = pc.wrapping_add(offset as u64);
                }
            }
            Instruction::Blr { target } => {
                let addr = self.gpr(target);
                if self.sp % 16 != 0 {
                    return Err(SimError::MisalignedCall(self.sp));
                }
                self.x[30] = next;
                if let Some(mut f) = self.host_fns.remove(&addr) {
                    self.events.push(Event::HostCall { addr });
                    f(self);
                    self.host_fns.insert(addr, f);
                } else if (base..end).contains(&addr) {
                    next = addr;
                } else {
                    return Err(SimError::UnknownTarget(addr));
                }
            }
            Instruction::Ret { target } => next = self.gpr(target),
        }
        self.pc = next;
        Ok(())
    }

    fn indexed(&mut self, rn: Gpr, imm: i16, index: Index) -> u64 {
        let base = self.gpr(rn);
        let moved = base.wrapping_add(i64::from(imm) as u64);
        self.set_gpr(rn, moved);
        match index {
            Index::Pre => moved,
            Index::Post => base,
        }
    }

    fn holds(&self, cond: Cond) -> bool {
        let Flags { n, z, c, v } = self.flags;
        match cond {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Hs => c,
            Cond::Lo => !c,
            Cond::Mi => n,
            Cond::Pl => !n,
            Cond::Vs => v,
            Cond::Vc => !v,
            Cond::Hi => c && !z,
            Cond::Ls => !(c && !z),
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => !(!z && n == v),
            Cond::Al => true,
        }
    }
}

fn mask128(bytes: u32) -> u128 {
    if bytes >= 16 {
        u128::MAX
    } else {
        (1u128 << (bytes * 8)) - 1
    }
}

fn truncate(value: u64, wide: bool) -> u64 {
    if wide { value } else { value & 0xFFFF_FFFF }
}

fn sub_flags(a: u64, b: u64, wide: bool) -> Flags {
    if wide {
        let (r, borrow) = a.overflowing_sub(b);
        Flags {
            n: (r as i64) < 0,
            z: r == 0,
            c: !borrow,
            v: (a as i64).overflowing_sub(b as i64).1,
        }
    } else {
        let (a, b) = (a as u32, b as u32);
        let (r, borrow) = a.overflowing_sub(b);
        Flags {
            n: (r as i32) < 0,
            z: r == 0,
            c: !borrow,
            v: (a as i32).overflowing_sub(b as i32).1,
        }
    }
}

/// `sbfm`/`ubfm` semantics, covering the extract and insert forms.
fn bitfield_move(src: u64, wide: bool, immr: u8, imms: u8, signed: bool) -> u64 {
    let datasize = if wide { 64u32 } else { 32 };
    let src = truncate(src, wide);
    let (immr, imms) = (u32::from(immr), u32::from(imms));
    let (field, top_bit) = if imms >= immr {
        let width = imms - immr + 1;
        ((src >> immr) & low_mask(width), width - 1)
    } else {
        let width = imms + 1;
        let shift = datasize - immr;
        ((src & low_mask(width)) << shift, width - 1 + shift)
    };
    let value = if signed && (field >> top_bit) & 1 == 1 {
        field | !low_mask(top_bit + 1)
    } else {
        field
    };
    truncate(value, wide)
}

fn low_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// A runtime thread record laid out in simulated memory at [`THREAD_BASE`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadImage {
    pub base: u64,
    pub layout: ThreadLayout,
}

impl ThreadImage {
    /// Write a managed, disarmed, fully guarded record and point `x28` at it.
    pub fn install(m: &mut Machine) -> Self {
        let image = Self {
            base: THREAD_BASE,
            layout: ThreadLayout::host(),
        };
        m.write_bytes(image.base, &vec![0; image.layout.size as usize]);
        image.set_state(m, ExecutionState::Managed.raw());
        image.set_polling_word(m, POLL_DISARMED);
        image.set_guard_state(m, StackGuardState::Enabled as u8);
        m.set_gpr(THREAD_REG, image.base);
        image
    }

    fn at(&self, offset: u32) -> u64 {
        self.base + u64::from(offset)
    }

    pub fn address_of_state(&self) -> u64 {
        self.at(self.layout.state)
    }

    pub fn state(&self, m: &Machine) -> u32 {
        m.read(self.at(self.layout.state), 4) as u32
    }

    pub fn set_state(&self, m: &mut Machine, raw: u32) {
        m.write(self.at(self.layout.state), 4, u128::from(raw));
    }

    pub fn set_suspend_flags(&self, m: &mut Machine, flags: u32) {
        m.write(self.at(self.layout.suspend_flags), 4, u128::from(flags));
    }

    pub fn set_polling_word(&self, m: &mut Machine, word: u64) {
        m.write_u64(self.at(self.layout.polling_word), word);
    }

    /// `(sp, fp, pc)` of the published frame anchor.
    pub fn anchor(&self, m: &Machine) -> (u64, u64, u64) {
        (
            m.read_u64(self.at(self.layout.anchor_sp)),
            m.read_u64(self.at(self.layout.anchor_fp)),
            m.read_u64(self.at(self.layout.anchor_pc)),
        )
    }

    pub fn anchor_addresses(&self) -> (u64, u64, u64) {
        (
            self.at(self.layout.anchor_sp),
            self.at(self.layout.anchor_fp),
            self.at(self.layout.anchor_pc),
        )
    }

    pub fn guard_state(&self, m: &Machine) -> u8 {
        m.read(self.at(self.layout.stack_guard_state), 1) as u8
    }

    pub fn set_guard_state(&self, m: &mut Machine, state: u8) {
        m.write(self.at(self.layout.stack_guard_state), 1, u128::from(state));
    }
}

/// Generate a downcall stub with the standard runtime and a fresh allocator.
pub fn downcall_stub(signature: &DowncallSignature) -> Result<StubObject> {
    let runtime = StandardRuntime::default();
    let mut alloc = HeapCodeAllocator::default();
    make_native_invoker(signature, &runtime, &mut alloc)
}

/// Pattern matching for instruction fields
#[derive(Debug, Clone)]
pub enum Pat<T> {
    /// Match any value
    Any,
    /// Match exact value
    Exact(T),
    /// Match if value satisfies predicate
    Predicate(fn(&T) -> bool),
}

impl<T: PartialEq> Pat<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Exact(expected) => value == expected,
            Pat::Predicate(pred) => pred(value),
        }
    }
}

/// Pattern for matching instructions in tests
#[derive(Debug, Clone)]
pub enum InstructionPattern {
    Any,
    Movz {
        dst: Pat<Gpr>,
        imm: Pat<u16>,
    },
    Str {
        width: Pat<Width>,
        src: Pat<Gpr>,
        base: Pat<Gpr>,
        offset: Pat<i32>,
    },
    Stlr {
        wide: Pat<bool>,
        src: Pat<Gpr>,
    },
    Ldar {
        wide: Pat<bool>,
    },
    DmbIsh,
    Blr {
        target: Pat<Gpr>,
    },
    BCond {
        cond: Pat<Cond>,
    },
    Sbfm {
        wide: Pat<bool>,
        dst: Pat<Gpr>,
        imms: Pat<u8>,
    },
    Ubfm {
        wide: Pat<bool>,
        dst: Pat<Gpr>,
        imms: Pat<u8>,
    },
    StrFp {
        size: Pat<FpSize>,
        src: Pat<Fpr>,
    },
}

impl InstructionPattern {
    pub fn matches(&self, instr: &Instruction) -> bool {
        match (self, instr) {
            (Self::Any, _) => true,
            (Self::Movz { dst, imm }, Instruction::Movz { dst: d, imm: i, .. }) => {
                dst.matches(d) && imm.matches(i)
            }
            (
                Self::Str {
                    width,
                    src,
                    base,
                    offset,
                },
                Instruction::Str {
                    width: w,
                    src: s,
                    base: b,
                    offset: o,
                },
            ) => width.matches(w) && src.matches(s) && base.matches(b) && offset.matches(o),
            (Self::Stlr { wide, src }, Instruction::Stlr { wide: w, src: s, .. }) => {
                wide.matches(w) && src.matches(s)
            }
            (Self::Ldar { wide }, Instruction::Ldar { wide: w, .. }) => wide.matches(w),
            (Self::DmbIsh, Instruction::DmbIsh) => true,
            (Self::Blr { target }, Instruction::Blr { target: t }) => target.matches(t),
            (Self::BCond { cond }, Instruction::BCond { cond: c, .. }) => cond.matches(c),
            (
                Self::Sbfm { wide, dst, imms },
                Instruction::Sbfm {
                    wide: w,
                    dst: d,
                    imms: s,
                    ..
                },
            )
            | (
                Self::Ubfm { wide, dst, imms },
                Instruction::Ubfm {
                    wide: w,
                    dst: d,
                    imms: s,
                    ..
                },
            ) => wide.matches(w) && dst.matches(d) && imms.matches(s),
            (Self::StrFp { size, src }, Instruction::StrFp { size: z, src: s, .. }) => {
                size.matches(z) && src.matches(s)
            }
            _ => false,
        }
    }
}

/// Index of the first instruction where `pattern` matches consecutively.
pub fn find_pattern(instructions: &[Instruction], pattern: &[InstructionPattern]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }
    instructions.windows(pattern.len()).position(|window| {
        window
            .iter()
            .zip(pattern)
            .all(|(instr, pat)| pat.matches(instr))
    })
}

pub fn assert_has_pattern(instructions: &[Instruction], pattern: &[InstructionPattern]) {
    if find_pattern(instructions, pattern).is_none() {
        panic!(
            "Pattern not found in instructions.\nPattern: {:?}\nInstructions: {:#?}",
            pattern, instructions
        );
    }
}

pub fn count_matching(instructions: &[Instruction], pattern: &InstructionPattern) -> usize {
    instructions.iter().filter(|i| pattern.matches(i)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitfield_forms() {
        // sxth x
        assert_eq!(bitfield_move(0x8001, true, 0, 15, true), 0xFFFF_FFFF_FFFF_8001);
        // uxtb w
        assert_eq!(bitfield_move(0x1FF, false, 0, 7, false), 0xFF);
        // lsr x, #4
        assert_eq!(bitfield_move(0xF0, true, 4, 63, false), 0xF);
        // lsl x, #4
        assert_eq!(bitfield_move(0xF, true, 60, 59, false), 0xF0);
    }

    #[test]
    fn test_unsigned_higher_condition() {
        let f = sub_flags(10, 1, true);
        assert!(f.c && !f.z);
        let f = sub_flags(1, !1, true);
        assert!(!f.c);
    }
}
