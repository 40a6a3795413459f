//! Runtime collaborators reached from downcall stubs.
//!
//! The stub only needs the thread record layout, two poll emitters and the
//! entry addresses of two slow-path services. `StandardRuntime` implements the
//! poll the way the rest of the runtime arms it (see [`crate::thread::POLL_ARMED`]).

use crate::a64::registers::FP;
use crate::a64::{Assembler, Cond, Gpr, Instruction, Label, Width};
use crate::abi::THREAD_REG;
use crate::thread::ThreadLayout;
use crate::{Error, Result};

pub trait RuntimeServices {
    fn thread_layout(&self) -> ThreadLayout;

    /// Entry of `check_special_condition(thread)`, called with the thread in `x0`.
    fn check_special_condition_entry(&self) -> u64;

    /// Entry of `reguard_stack()`, no arguments.
    fn reguard_stack_entry(&self) -> u64;

    /// Branch to `slow` if a pause is requested for this thread.
    ///
    /// The polling word is loaded with acquire semantics and compared against
    /// the frame pointer: an armed word is below every frame pointer.
    fn emit_pause_poll(&self, asm: &mut Assembler, tmp: Gpr, slow: Label) -> Result<()> {
        let layout = self.thread_layout();
        asm.add_imm(tmp, THREAD_REG, layout.polling_word)?;
        asm.emit(Instruction::Ldar {
            wide: true,
            dst: tmp,
            base: tmp,
        });
        asm.emit(Instruction::CmpReg {
            wide: true,
            lhs: FP,
            rhs: tmp,
        });
        asm.b_cond(Cond::Hi, slow);
        Ok(())
    }

    /// Branch to `slow` if any suspend flag is set.
    fn emit_special_condition_check(&self, asm: &mut Assembler, tmp: Gpr, slow: Label) -> Result<()> {
        let layout = self.thread_layout();
        let offset = i32::try_from(layout.suspend_flags).map_err(|_| {
            Error::ImmediateOutOfRange {
                what: "suspend flags offset",
                value: i64::from(layout.suspend_flags),
            }
        })?;
        asm.ldr(Width::W32, tmp, THREAD_REG, offset)?;
        asm.cbnz(false, tmp, slow);
        Ok(())
    }
}

/// Runtime whose thread records are [`crate::thread::ThreadRecord`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardRuntime {
    pub check_special_condition: u64,
    pub reguard_stack: u64,
}

impl StandardRuntime {
    pub const DEFAULT_CHECK_SPECIAL_CONDITION: u64 = 0x0000_7F00_0000_1000;
    pub const DEFAULT_REGUARD_STACK: u64 = 0x0000_7F00_0000_2000;

    #[must_use]
    pub const fn new(check_special_condition: u64, reguard_stack: u64) -> Self {
        Self {
            check_special_condition,
            reguard_stack,
        }
    }
}

impl Default for StandardRuntime {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_CHECK_SPECIAL_CONDITION,
            Self::DEFAULT_REGUARD_STACK,
        )
    }
}

impl RuntimeServices for StandardRuntime {
    fn thread_layout(&self) -> ThreadLayout {
        ThreadLayout::host()
    }

    fn check_special_condition_entry(&self) -> u64 {
        self.check_special_condition
    }

    fn reguard_stack_entry(&self) -> u64 {
        self.reguard_stack
    }
}
