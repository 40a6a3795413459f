// Context-record adapter: arguments come from an in-memory record, results go back to it.
//
// Frame, from the caller's sp downwards:
//   [fp + 8]   saved lr
//   [fp + 0]   saved fp
//   [fp - 16]  context record pointer (16-byte slot)
//   [sp ...]   copy of the stack argument block, size rounded up to the alignment
//
// No thread state transition, poll or root map: the caller vouches for the
// target through the trust criterion carried by the request.

#![allow(clippy::cast_possible_truncation)]

use crate::a64::registers::{FP, LR, X0};
use crate::a64::{Assembler, FpSize, Gpr, Index, Instruction, Width};
use crate::abi::adapter::{
    CTX, DST_PTR, SCRATCH, SRC_PTR, STACK_SIZE, TMP, WORDS, WORKING_SET,
};
use crate::abi::{FRAME_HEADER_SIZE, STACK_ALIGNMENT, WORD_SIZE};
use crate::descriptor::{AbiDescriptor, BufferLayout};
use crate::location::Location;
use crate::{Error, Result};

use super::{EmittedStub, displacement};

/// fp/lr pair plus the 16-byte context slot.
const STATIC_FRAME_BYTES: u32 = FRAME_HEADER_SIZE + 16;

fn validate(abi: &AbiDescriptor, layout: &BufferLayout) -> Result<()> {
    if abi.shadow_space != 0 {
        return Err(Error::ShadowSpace(abi.shadow_space));
    }
    if abi.stack_alignment % STACK_ALIGNMENT != 0 {
        return Err(Error::Descriptor(format!(
            "stack alignment {} is not a multiple of {STACK_ALIGNMENT}",
            abi.stack_alignment
        )));
    }
    if let Some(reg) = abi
        .declared_locations()
        .find(|loc| WORKING_SET.iter().any(|w| Location::Gpr(*w) == *loc))
    {
        return Err(Error::RegisterConflict {
            reg,
            role: "context adapter working register",
        });
    }
    layout.check_fits(abi)
}

pub(super) fn emit(abi: &AbiDescriptor, layout: &BufferLayout) -> Result<EmittedStub> {
    validate(abi, layout)?;
    let mut asm = Assembler::new();

    asm.enter();
    asm.emit(Instruction::Mov { dst: CTX, src: X0 });
    asm.emit(Instruction::StrIdx {
        src: CTX,
        base: Gpr::SP,
        imm: -16,
        index: Index::Pre,
    });
    let frame_complete = asm.current_offset() as u32;

    asm.block_comment("reserve aligned stack argument area");
    let shift = abi.stack_alignment.trailing_zeros() as u8;
    asm.ldr(
        Width::X64,
        STACK_SIZE,
        CTX,
        displacement(layout.stack_args_bytes, "stack size offset")?,
    )?;
    asm.add_imm(SCRATCH, STACK_SIZE, abi.stack_alignment - 1)?;
    asm.lsr(SCRATCH, SCRATCH, shift);
    asm.lsl(SCRATCH, SCRATCH, shift);
    asm.emit(Instruction::SubExt {
        dst: Gpr::SP,
        src: Gpr::SP,
        rm: SCRATCH,
    });

    asm.block_comment("copy stack arguments");
    asm.ldr(
        Width::X64,
        SRC_PTR,
        CTX,
        displacement(layout.stack_args, "stack arguments offset")?,
    )?;
    asm.add_imm(WORDS, STACK_SIZE, WORD_SIZE - 1)?;
    asm.lsr(WORDS, WORDS, WORD_SIZE.trailing_zeros() as u8);
    asm.emit(Instruction::MovSp {
        dst: DST_PTR,
        src: Gpr::SP,
    });
    let next = asm.alloc_label();
    let done = asm.alloc_label();
    asm.bind(next);
    asm.cbz(true, WORDS, done);
    asm.emit(Instruction::LdrIdx {
        dst: TMP,
        base: SRC_PTR,
        imm: WORD_SIZE as i16,
        index: Index::Post,
    });
    asm.emit(Instruction::StrIdx {
        src: TMP,
        base: DST_PTR,
        imm: WORD_SIZE as i16,
        index: Index::Post,
    });
    asm.sub_imm(WORDS, WORDS, 1)?;
    asm.b(next);
    asm.bind(done);

    asm.block_comment("load argument registers");
    for (i, &reg) in abi.vector_args.iter().enumerate() {
        let offset = layout.vector_arg_offset(i as u32);
        asm.ldr_fp(FpSize::Q, reg, CTX, displacement(offset, "vector argument offset")?)?;
    }
    for (i, &reg) in abi.integer_args.iter().enumerate() {
        let offset = layout.integer_arg_offset(i as u32);
        asm.ldr(
            Width::X64,
            reg,
            CTX,
            displacement(offset, "integer argument offset")?,
        )?;
    }

    asm.block_comment("call native entry");
    asm.ldr(
        Width::X64,
        SCRATCH,
        CTX,
        displacement(layout.arguments_next_pc, "native entry offset")?,
    )?;
    asm.emit(Instruction::Blr { target: SCRATCH });

    asm.block_comment("store return registers");
    asm.ldr(Width::X64, CTX, FP, -16)?;
    for (i, &reg) in abi.integer_returns.iter().enumerate() {
        let offset = layout.integer_return_offset(i as u32);
        asm.str(
            Width::X64,
            reg,
            CTX,
            displacement(offset, "integer return offset")?,
        )?;
    }
    for (i, &reg) in abi.vector_returns.iter().enumerate() {
        let offset = layout.vector_return_offset(i as u32);
        asm.str_fp(FpSize::Q, reg, CTX, displacement(offset, "vector return offset")?)?;
    }

    asm.leave();
    asm.emit(Instruction::Ret { target: LR });

    Ok(EmittedStub {
        code: asm.finish()?,
        frame_complete,
        frame_size_words: STATIC_FRAME_BYTES / WORD_SIZE,
        root_maps: None,
    })
}
