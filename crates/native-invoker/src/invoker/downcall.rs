// Cooperative downcall: managed arguments are shuffled straight into the native
// convention, with thread state transitions around the call.
//
// Frame, from the caller's sp downwards:
//   [fp + 16 ...]  incoming managed stack arguments
//   [fp + 8]       saved lr
//   [fp + 0]       saved fp
//   [sp + out]     return value spill area
//   [sp + 0]       outgoing native stack arguments
//
// Fast path:
//   publish last managed frame (pc, fp, sp) -> state Native (release)
//   shuffle -> blr -> normalize result
//   state NativeTransition (plain + dmb ish) -> pause poll, suspend flags
//   state Managed (release) -> clear frame anchor -> stack guard check
//   move result to the managed return register -> leave
//
// Slow paths spill the result, call into the runtime and branch back.

#![allow(clippy::cast_possible_truncation)]

use crate::a64::registers::{FP, LR, X0};
use crate::a64::{Assembler, Cond, FpSize, Gpr, Instruction, Width};
use crate::abi::{
    FRAME_HEADER_SIZE, SHUFFLE_SCRATCH, STACK_ALIGNMENT, THREAD_REG, TMP1, TMP2, WORD_SIZE,
    align_up,
};
use crate::callconv::{ManagedCallConv, NativeCallConv, managed_return_location};
use crate::descriptor::DowncallSignature;
use crate::location::{Location, ValueType};
use crate::runtime::RuntimeServices;
use crate::shuffle::ArgumentShuffle;
use crate::spill::RegSpiller;
use crate::stub::{RootMap, RootMapSet};
use crate::thread::{PublishOrdering, StackGuardState, StateTransition, ThreadLayout};
use crate::{Error, Result};

use super::{EmittedStub, displacement};

/// Fixed registers of a downcall stub, checked against one signature's locations.
///
/// Only [`ReservedRegisters::for_signature`] builds one, so holding a value
/// means none of these registers carries an argument or the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedRegisters {
    thread: Gpr,
    tmp1: Gpr,
    tmp2: Gpr,
    shuffle_scratch: Gpr,
}

impl ReservedRegisters {
    pub fn for_signature(signature: &DowncallSignature) -> Result<Self> {
        let reserved = Self {
            thread: THREAD_REG,
            tmp1: TMP1,
            tmp2: TMP2,
            shuffle_scratch: SHUFFLE_SCRATCH,
        };
        let declared = signature
            .input_locations
            .iter()
            .chain(&signature.output_locations)
            .copied()
            .filter(|loc| loc.is_valid());
        for loc in declared {
            if let Some((_, role)) = reserved
                .roles()
                .into_iter()
                .find(|(reg, _)| Location::Gpr(*reg) == loc)
            {
                return Err(Error::RegisterConflict { reg: loc, role });
            }
        }
        Ok(reserved)
    }

    fn roles(&self) -> [(Gpr, &'static str); 4] {
        [
            (self.thread, "thread register"),
            (self.tmp1, "target/temp register"),
            (self.tmp2, "temp register"),
            (self.shuffle_scratch, "shuffle scratch"),
        ]
    }

    #[must_use]
    pub const fn thread(&self) -> Gpr {
        self.thread
    }

    /// Carries the native target into the call; free as a temp otherwise.
    #[must_use]
    pub const fn tmp1(&self) -> Gpr {
        self.tmp1
    }

    #[must_use]
    pub const fn tmp2(&self) -> Gpr {
        self.tmp2
    }

    #[must_use]
    pub const fn shuffle_scratch(&self) -> Gpr {
        self.shuffle_scratch
    }
}

fn validate(signature: &DowncallSignature) -> Result<()> {
    let outputs = &signature.output_locations;
    if outputs.iter().skip(1).any(|loc| loc.is_valid()) {
        return Err(Error::MultiRegisterReturn(outputs.len()));
    }
    if signature.shadow_space != 0 {
        return Err(Error::ShadowSpace(signature.shadow_space));
    }
    match signature.arg_types.first() {
        Some(ValueType::Long) => {}
        Some(&other) => {
            return Err(Error::UnsupportedType(other, "target address must be a long"));
        }
        None => {
            return Err(Error::Descriptor(
                "downcall signature has no target address argument".to_string(),
            ));
        }
    }
    if signature.arg_types.len() != signature.input_locations.len() + 1 {
        return Err(Error::ArgumentCountMismatch {
            src: signature.arg_types.len(),
            dst: signature.input_locations.len() + 1,
        });
    }

    let ret = signature.return_type;
    let out = signature.output_location();
    let class_ok = match ret {
        ValueType::Void => true,
        ty if ty.is_integral() => matches!(out, Location::Gpr(_)),
        _ => matches!(out, Location::Fpr(_)),
    };
    if !class_ok {
        return Err(Error::UnsupportedType(
            ret,
            "return location does not match the return type",
        ));
    }
    Ok(())
}

fn thread_offset(offset: u32) -> Result<i32> {
    displacement(offset, "thread record offset")
}

fn emit_transition(
    asm: &mut Assembler,
    regs: &ReservedRegisters,
    layout: &ThreadLayout,
    transition: StateTransition,
) -> Result<()> {
    asm.emit(Instruction::Movz {
        dst: regs.tmp1,
        imm: transition.target().raw() as u16,
        shift: 0,
    });
    match transition.ordering() {
        PublishOrdering::Release => {
            asm.add_imm(regs.tmp2, regs.thread, layout.state)?;
            asm.emit(Instruction::Stlr {
                wide: false,
                src: regs.tmp1,
                base: regs.tmp2,
            });
        }
        PublishOrdering::PlainThenFullFence => {
            asm.str(Width::W32, regs.tmp1, regs.thread, thread_offset(layout.state)?)?;
            asm.emit(Instruction::DmbIsh);
        }
    }
    Ok(())
}

/// Bring a sub-word integer result to its canonical register form.
fn normalize_result(asm: &mut Assembler, ty: ValueType, reg: Gpr) -> Result<()> {
    let sign_extend = |asm: &mut Assembler, imms: u8| {
        asm.emit(Instruction::Sbfm {
            wide: true,
            dst: reg,
            src: reg,
            immr: 0,
            imms,
        });
    };
    match ty {
        ValueType::Bool => {
            // uxtb; cmp; cset ne
            asm.emit(Instruction::Ubfm {
                wide: false,
                dst: reg,
                src: reg,
                immr: 0,
                imms: 7,
            });
            asm.cmp_imm(false, reg, 0)?;
            asm.emit(Instruction::Cset {
                dst: reg,
                cond: Cond::Ne,
            });
        }
        ValueType::Char => asm.emit(Instruction::Ubfm {
            wide: false,
            dst: reg,
            src: reg,
            immr: 0,
            imms: 15,
        }),
        ValueType::Byte => sign_extend(asm, 7),
        ValueType::Short => sign_extend(asm, 15),
        ValueType::Int => sign_extend(asm, 31),
        ValueType::Long | ValueType::Float | ValueType::Double | ValueType::Void => {}
    }
    Ok(())
}

fn emit_result_move(asm: &mut Assembler, ty: ValueType, from: Location, to: Location) -> Result<()> {
    if from == to || !to.is_valid() {
        return Ok(());
    }
    match (from, to) {
        (Location::Gpr(src), Location::Gpr(dst)) => asm.emit(Instruction::Mov { dst, src }),
        (Location::Fpr(src), Location::Fpr(dst)) => {
            let size = if ty == ValueType::Float {
                FpSize::S
            } else {
                FpSize::D
            };
            asm.emit(Instruction::FmovReg { size, dst, src });
        }
        _ => {
            return Err(Error::Internal(format!(
                "cannot move {ty} result from {from} to {to}"
            )));
        }
    }
    Ok(())
}

fn emit_runtime_call(asm: &mut Assembler, regs: &ReservedRegisters, entry: u64) {
    asm.mov_imm64(regs.tmp1, entry);
    asm.emit(Instruction::Blr { target: regs.tmp1 });
}

pub(super) fn emit(
    signature: &DowncallSignature,
    runtime: &dyn RuntimeServices,
) -> Result<EmittedStub> {
    validate(signature)?;
    let regs = ReservedRegisters::for_signature(signature)?;
    let layout = runtime.thread_layout();

    let managed = ManagedCallConv::new(&signature.arg_types)?;
    let native = NativeCallConv::new(regs.tmp1, &signature.input_locations);
    let shuffle = ArgumentShuffle::new(
        &signature.arg_types,
        &managed,
        &native,
        regs.shuffle_scratch,
        STACK_ALIGNMENT,
    )?;
    tracing::trace!("downcall {shuffle}");

    let ret = signature.return_type;
    let native_result = if ret == ValueType::Void {
        Location::Bad
    } else {
        signature.output_location()
    };
    let spiller = RegSpiller::new(&[native_result]);
    let spill_offset = shuffle.out_arg_bytes();

    let frame_size = FRAME_HEADER_SIZE
        .checked_add(shuffle.out_arg_bytes())
        .and_then(|size| size.checked_add(spiller.spill_size_bytes()))
        .and_then(|size| align_up(size, STACK_ALIGNMENT))
        .ok_or(Error::ImmediateOutOfRange {
            what: "downcall frame size",
            value: i64::from(shuffle.out_arg_bytes()),
        })?;
    if frame_size % STACK_ALIGNMENT != 0 {
        return Err(Error::MisalignedFrame {
            size: frame_size,
            alignment: STACK_ALIGNMENT,
        });
    }
    let frame_size_words = frame_size / WORD_SIZE;

    let mut asm = Assembler::new();
    let after_poll = asm.alloc_label();
    let poll_slow = asm.alloc_label();
    let after_reguard = asm.alloc_label();
    let reguard = asm.alloc_label();

    asm.enter();
    asm.sub_imm(Gpr::SP, FP, frame_size - FRAME_HEADER_SIZE)?;
    let frame_complete = asm.current_offset() as u32;

    asm.block_comment("publish last managed frame");
    let anchor_pc = asm.current_offset() as u32;
    asm.emit(Instruction::Adr {
        dst: regs.tmp1,
        offset: 0,
    });
    asm.str(Width::X64, regs.tmp1, regs.thread, thread_offset(layout.anchor_pc)?)?;
    asm.str(Width::X64, FP, regs.thread, thread_offset(layout.anchor_fp)?)?;
    asm.emit(Instruction::MovSp {
        dst: regs.tmp2,
        src: Gpr::SP,
    });
    asm.str(Width::X64, regs.tmp2, regs.thread, thread_offset(layout.anchor_sp)?)?;
    let mut root_maps = RootMapSet::new();
    root_maps.add_gc_map(anchor_pc, RootMap::new(frame_size_words));

    asm.block_comment("thread state: native");
    emit_transition(&mut asm, &regs, &layout, StateTransition::EnterNative)?;

    shuffle.generate(&mut asm, 0, 0)?;

    asm.block_comment("call native target");
    asm.emit(Instruction::Blr { target: regs.tmp1 });
    if let Location::Gpr(reg) = native_result {
        normalize_result(&mut asm, ret, reg)?;
    }

    asm.block_comment("thread state: native transition");
    emit_transition(&mut asm, &regs, &layout, StateTransition::BeginReturn)?;

    asm.block_comment("suspension poll");
    runtime.emit_pause_poll(&mut asm, regs.tmp1, poll_slow)?;
    runtime.emit_special_condition_check(&mut asm, regs.tmp1, poll_slow)?;
    asm.bind(after_poll);

    asm.block_comment("thread state: managed");
    emit_transition(&mut asm, &regs, &layout, StateTransition::ReturnToManaged)?;
    asm.str(Width::X64, Gpr::ZR, regs.thread, thread_offset(layout.anchor_sp)?)?;
    asm.str(Width::X64, Gpr::ZR, regs.thread, thread_offset(layout.anchor_fp)?)?;
    asm.str(Width::X64, Gpr::ZR, regs.thread, thread_offset(layout.anchor_pc)?)?;

    asm.block_comment("stack guard check");
    asm.ldr(
        Width::B8,
        regs.tmp1,
        regs.thread,
        thread_offset(layout.stack_guard_state)?,
    )?;
    asm.cmp_imm(false, regs.tmp1, StackGuardState::YellowReservedDisabled as u32)?;
    asm.b_cond(Cond::Eq, reguard);
    asm.bind(after_reguard);

    emit_result_move(&mut asm, ret, native_result, managed_return_location(ret))?;
    asm.leave();
    asm.emit(Instruction::Ret { target: LR });

    let spill_at = displacement(spill_offset, "spill offset")?;

    asm.block_comment("slow path: special condition");
    asm.bind(poll_slow);
    spiller.generate_spill(&mut asm, spill_at)?;
    asm.emit(Instruction::Mov {
        dst: X0,
        src: regs.thread,
    });
    emit_runtime_call(&mut asm, &regs, runtime.check_special_condition_entry());
    spiller.generate_fill(&mut asm, spill_at)?;
    asm.b(after_poll);

    asm.block_comment("slow path: reguard stack");
    asm.bind(reguard);
    spiller.generate_spill(&mut asm, spill_at)?;
    emit_runtime_call(&mut asm, &regs, runtime.reguard_stack_entry());
    spiller.generate_fill(&mut asm, spill_at)?;
    asm.b(after_reguard);

    Ok(EmittedStub {
        code: asm.finish()?,
        frame_complete,
        frame_size_words,
        root_maps: Some(root_maps),
    })
}
