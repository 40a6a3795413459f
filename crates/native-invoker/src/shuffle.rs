// Argument shuffle: parallel-move resolution between two calling conventions.
//
// Every argument contributes one move `from -> to`. A move is ready once no other
// pending move still reads its destination. When nothing is ready, the remaining
// moves form disjoint register cycles (destinations are unique and stack slots
// are never both read and written); one cycle at a time is opened by copying a
// source into the scratch register and re-queueing its move to read the scratch.
//
// Source stack locations address the caller's outgoing area (`fp + 16 + offset`),
// destination stack locations address the stub's own outgoing area (`sp + offset`).

use std::collections::HashSet;
use std::fmt;

use crate::a64::registers::FP;
use crate::a64::{Assembler, FpSize, Gpr, Instruction, Width};
use crate::abi::{INCOMING_ARGS_BIAS, STACK_SLOT_SIZE, align_up};
use crate::callconv::CallingConvention;
use crate::location::{Location, ValueType};
use crate::{Error, Result};

/// One typed move of the shuffle program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub ty: ValueType,
    pub from: Location,
    pub to: Location,
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.ty, self.from, self.to)
    }
}

/// An ordered move program realizing a simultaneous argument assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentShuffle {
    moves: Vec<Move>,
    scratch: Gpr,
    out_arg_bytes: u32,
    cycle_breaks: usize,
}

impl ArgumentShuffle {
    /// Plan the moves taking argument `i` from `src.arg_location(i)` to
    /// `dst.arg_location(i)` for every `i < types.len()`.
    ///
    /// Arguments whose destination is `Bad` are dropped. `stack_alignment` must be
    /// a power of two; the outgoing stack area is rounded up to it.
    pub fn new(
        types: &[ValueType],
        src: &dyn CallingConvention,
        dst: &dyn CallingConvention,
        scratch: Gpr,
        stack_alignment: u32,
    ) -> Result<Self> {
        if src.len() != dst.len() {
            return Err(Error::ArgumentCountMismatch {
                src: src.len(),
                dst: dst.len(),
            });
        }
        if types.len() != src.len() {
            return Err(Error::ArgumentCountMismatch {
                src: types.len(),
                dst: src.len(),
            });
        }

        let scratch_loc = Location::Gpr(scratch);
        let mut pending = Vec::with_capacity(types.len());
        let mut destinations = HashSet::new();
        let mut out_arg_end = 0u32;

        for (i, &ty) in types.iter().enumerate() {
            let from = src.arg_location(i);
            let to = dst.arg_location(i);
            if !to.is_valid() {
                continue;
            }
            if !from.is_valid() {
                return Err(Error::UnresolvableShuffle(format!(
                    "argument {i} has no source location"
                )));
            }
            if from == scratch_loc || to == scratch_loc {
                return Err(Error::RegisterConflict {
                    reg: scratch_loc,
                    role: "shuffle scratch",
                });
            }
            check_class(ty, from)?;
            check_class(ty, to)?;
            if !destinations.insert(to) {
                return Err(Error::UnresolvableShuffle(format!(
                    "argument {i} writes {to}, which another argument already writes"
                )));
            }
            if let Location::Stack(offset) = to {
                let end = offset.checked_add(STACK_SLOT_SIZE).ok_or(
                    Error::ImmediateOutOfRange {
                        what: "outgoing stack offset",
                        value: i64::from(offset),
                    },
                )?;
                out_arg_end = out_arg_end.max(end);
            }
            if from == to && from.is_register() {
                continue;
            }
            pending.push(Move { ty, from, to });
        }

        let out_arg_bytes =
            align_up(out_arg_end, stack_alignment).ok_or(Error::ImmediateOutOfRange {
                what: "outgoing argument area",
                value: i64::from(out_arg_end),
            })?;
        let (moves, cycle_breaks) = resolve(pending, scratch_loc)?;
        Ok(Self {
            moves,
            scratch,
            out_arg_bytes,
            cycle_breaks,
        })
    }

    #[must_use]
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    /// Outgoing stack bytes the destination convention needs, aligned.
    #[must_use]
    pub const fn out_arg_bytes(&self) -> u32 {
        self.out_arg_bytes
    }

    /// Number of cycles opened through the scratch register.
    #[must_use]
    pub const fn cycle_breaks(&self) -> usize {
        self.cycle_breaks
    }

    #[must_use]
    pub const fn scratch(&self) -> Gpr {
        self.scratch
    }

    /// Emit the move program. Both stack biases must be zero on this target.
    pub fn generate(&self, asm: &mut Assembler, in_stk_bias: i32, out_stk_bias: i32) -> Result<()> {
        if in_stk_bias != 0 || out_stk_bias != 0 {
            return Err(Error::Internal(format!(
                "unsupported stack bias (in {in_stk_bias}, out {out_stk_bias})"
            )));
        }
        asm.block_comment(format!("argument shuffle: {} moves", self.moves.len()));
        for mv in &self.moves {
            match mv.ty {
                ValueType::Long => int_move(asm, mv, self.scratch, false)?,
                ValueType::Float => fp_move(asm, mv, self.scratch, FpSize::S)?,
                ValueType::Double => fp_move(asm, mv, self.scratch, FpSize::D)?,
                ValueType::Void => return Err(Error::UnsupportedType(mv.ty, "void argument")),
                _ => int_move(asm, mv, self.scratch, true)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for ArgumentShuffle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "shuffle via {}: {} moves, {} cycle breaks, {} outgoing stack bytes",
            self.scratch,
            self.moves.len(),
            self.cycle_breaks,
            self.out_arg_bytes
        )?;
        for mv in &self.moves {
            writeln!(f, "  {mv}")?;
        }
        Ok(())
    }
}

fn check_class(ty: ValueType, loc: Location) -> Result<()> {
    match (ty, loc) {
        (ValueType::Void, _) => Err(Error::UnsupportedType(ty, "void argument")),
        (_, Location::Fpr(_)) if ty.is_integral() => Err(Error::UnsupportedType(
            ty,
            "integer value in a vector register",
        )),
        (_, Location::Gpr(_)) if ty.is_floating() => Err(Error::UnsupportedType(
            ty,
            "floating-point value in a general register",
        )),
        _ => Ok(()),
    }
}

/// A pending move still needs the value held in `loc`.
fn reads(mv: &Move, loc: Location) -> bool {
    loc.is_register() && mv.from == loc
}

fn resolve(mut pending: Vec<Move>, scratch: Location) -> Result<(Vec<Move>, usize)> {
    let mut ordered = Vec::with_capacity(pending.len() + 2);
    let mut cycle_breaks = 0;

    while !pending.is_empty() {
        let before = pending.len();
        let mut i = 0;
        while i < pending.len() {
            let to = pending[i].to;
            let blocked = pending
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && reads(other, to));
            if blocked {
                i += 1;
            } else {
                ordered.push(pending.remove(i));
            }
        }
        if pending.len() < before {
            continue;
        }

        // Only cycles remain. The scratch must be free to open one.
        if pending.iter().any(|mv| mv.from == scratch) {
            return Err(Error::UnresolvableShuffle(
                "scratch register is live while another cycle needs it".to_string(),
            ));
        }
        if pending.iter().any(|mv| mv.from.is_stack() && mv.to.is_stack()) {
            return Err(Error::UnresolvableShuffle(
                "memory-to-memory move pending while a cycle holds the scratch".to_string(),
            ));
        }
        let Move { ty, from, to } = pending[0];
        ordered.push(Move {
            ty,
            from,
            to: scratch,
        });
        pending[0] = Move {
            ty,
            from: scratch,
            to,
        };
        cycle_breaks += 1;
    }

    Ok((ordered, cycle_breaks))
}

fn incoming(offset: u32) -> Result<i32> {
    i32::try_from(offset)
        .ok()
        .and_then(|o| o.checked_add(INCOMING_ARGS_BIAS))
        .ok_or(Error::ImmediateOutOfRange {
            what: "incoming stack offset",
            value: i64::from(offset),
        })
}

fn outgoing(offset: u32) -> Result<i32> {
    i32::try_from(offset).map_err(|_| Error::ImmediateOutOfRange {
        what: "outgoing stack offset",
        value: i64::from(offset),
    })
}

fn unsupported_move(mv: &Move) -> Error {
    Error::Internal(format!("no instruction sequence for move {mv}"))
}

/// General-register classes. Sub-word values travel sign-extended to 64 bits.
fn int_move(asm: &mut Assembler, mv: &Move, scratch: Gpr, sign_extend: bool) -> Result<()> {
    match (mv.from, mv.to) {
        (Location::Gpr(src), Location::Gpr(dst)) => {
            if src != dst {
                if sign_extend {
                    // sxtw
                    asm.emit(Instruction::Sbfm {
                        wide: true,
                        dst,
                        src,
                        immr: 0,
                        imms: 31,
                    });
                } else {
                    asm.emit(Instruction::Mov { dst, src });
                }
            }
        }
        (Location::Stack(offset), Location::Gpr(dst)) => {
            if sign_extend {
                asm.ldrsw(dst, FP, incoming(offset)?)?;
            } else {
                asm.ldr(Width::X64, dst, FP, incoming(offset)?)?;
            }
        }
        (Location::Gpr(src), Location::Stack(offset)) => {
            asm.str(Width::X64, src, Gpr::SP, outgoing(offset)?)?;
        }
        (Location::Stack(from), Location::Stack(to)) => {
            asm.ldr(Width::X64, scratch, FP, incoming(from)?)?;
            asm.str(Width::X64, scratch, Gpr::SP, outgoing(to)?)?;
        }
        _ => return Err(unsupported_move(mv)),
    }
    Ok(())
}

/// Scalar floating point. Crossing to a general register only happens through
/// the scratch while a cycle is open.
fn fp_move(asm: &mut Assembler, mv: &Move, scratch: Gpr, size: FpSize) -> Result<()> {
    let width = if size == FpSize::S {
        Width::W32
    } else {
        Width::X64
    };
    match (mv.from, mv.to) {
        (Location::Fpr(src), Location::Fpr(dst)) => {
            if src != dst {
                asm.emit(Instruction::FmovReg { size, dst, src });
            }
        }
        (Location::Fpr(src), Location::Gpr(dst)) => {
            asm.emit(Instruction::FmovToGpr { size, dst, src });
        }
        (Location::Gpr(src), Location::Fpr(dst)) => {
            asm.emit(Instruction::FmovFromGpr { size, dst, src });
        }
        (Location::Stack(offset), Location::Fpr(dst)) => {
            asm.ldr_fp(size, dst, FP, incoming(offset)?)?;
        }
        (Location::Fpr(src), Location::Stack(offset)) => {
            asm.str_fp(size, src, Gpr::SP, outgoing(offset)?)?;
        }
        (Location::Gpr(src), Location::Stack(offset)) => {
            asm.str(width, src, Gpr::SP, outgoing(offset)?)?;
        }
        (Location::Stack(from), Location::Stack(to)) => {
            asm.ldr(width, scratch, FP, incoming(from)?)?;
            asm.str(width, scratch, Gpr::SP, outgoing(to)?)?;
        }
        _ => return Err(unsupported_move(mv)),
    }
    Ok(())
}
