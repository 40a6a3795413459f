// A64 emitter: an append-only instruction stream with labels and branch fixups.
//
// Branches to labels are emitted with a zero offset and patched in `finish()`,
// once every label has a byte offset. Memory and immediate helpers check that
// operands are encodable and fail with `Error::ImmediateOutOfRange` otherwise.

use crate::{Error, Result};

use super::blob::CodeBlob;
use super::instruction::{Cond, FpSize, Index, Instruction, Width, fits_scaled, fits_unscaled};
use super::registers::{FP, Fpr, Gpr, LR};

/// A branch target inside one stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Default)]
pub struct Assembler {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
    comments: Vec<(usize, String)>,
}

impl Assembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_label(&mut self) -> Label {
        let id = self.labels.len();
        self.labels.push(None);
        Label(id)
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.current_offset());
    }

    /// Byte offset of the next instruction.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.instructions.len() * Instruction::SIZE
    }

    pub fn emit(&mut self, instr: Instruction) {
        self.instructions.push(instr);
    }

    /// Attach a comment to the next emitted instruction (shown in listings).
    pub fn block_comment(&mut self, text: impl Into<String>) {
        self.comments.push((self.instructions.len(), text.into()));
    }

    fn emit_to_label(&mut self, instr: Instruction, label: Label) {
        self.fixups.push((self.instructions.len(), label));
        self.emit(instr);
    }

    pub fn b(&mut self, label: Label) {
        self.emit_to_label(Instruction::B { offset: 0 }, label);
    }

    pub fn b_cond(&mut self, cond: Cond, label: Label) {
        self.emit_to_label(Instruction::BCond { cond, offset: 0 }, label);
    }

    pub fn cbz(&mut self, wide: bool, reg: Gpr, label: Label) {
        self.emit_to_label(
            Instruction::Cbz {
                wide,
                reg,
                offset: 0,
            },
            label,
        );
    }

    pub fn cbnz(&mut self, wide: bool, reg: Gpr, label: Label) {
        self.emit_to_label(
            Instruction::Cbnz {
                wide,
                reg,
                offset: 0,
            },
            label,
        );
    }

    // ── Frames ──

    /// `stp fp, lr, [sp, #-16]!; mov fp, sp`
    pub fn enter(&mut self) {
        self.emit(Instruction::Stp {
            first: FP,
            second: LR,
            base: Gpr::SP,
            imm: -16,
            index: Index::Pre,
        });
        self.emit(Instruction::MovSp {
            dst: FP,
            src: Gpr::SP,
        });
    }

    /// `mov sp, fp; ldp fp, lr, [sp], #16`
    pub fn leave(&mut self) {
        self.emit(Instruction::MovSp {
            dst: Gpr::SP,
            src: FP,
        });
        self.emit(Instruction::Ldp {
            first: FP,
            second: LR,
            base: Gpr::SP,
            imm: 16,
            index: Index::Post,
        });
    }

    // ── Immediates ──

    pub fn add_imm(&mut self, dst: Gpr, src: Gpr, imm: u32) -> Result<()> {
        let imm = imm12(imm, "add immediate")?;
        self.emit(Instruction::AddImm { dst, src, imm });
        Ok(())
    }

    pub fn sub_imm(&mut self, dst: Gpr, src: Gpr, imm: u32) -> Result<()> {
        let imm = imm12(imm, "sub immediate")?;
        self.emit(Instruction::SubImm { dst, src, imm });
        Ok(())
    }

    pub fn cmp_imm(&mut self, wide: bool, src: Gpr, imm: u32) -> Result<()> {
        let imm = imm12(imm, "compare immediate")?;
        self.emit(Instruction::CmpImm { wide, src, imm });
        Ok(())
    }

    /// Materialize a 64-bit constant with `movz` and as many `movk` as needed.
    pub fn mov_imm64(&mut self, dst: Gpr, value: u64) {
        self.emit(Instruction::Movz {
            dst,
            imm: (value & 0xFFFF) as u16,
            shift: 0,
        });
        for shift in [16u8, 32, 48] {
            let chunk = ((value >> shift) & 0xFFFF) as u16;
            if chunk != 0 {
                self.emit(Instruction::Movk {
                    dst,
                    imm: chunk,
                    shift,
                });
            }
        }
    }

    /// `lsr xd, xn, #shift`
    pub fn lsr(&mut self, dst: Gpr, src: Gpr, shift: u8) {
        self.emit(Instruction::Ubfm {
            wide: true,
            dst,
            src,
            immr: shift & 63,
            imms: 63,
        });
    }

    /// `lsl xd, xn, #shift`
    pub fn lsl(&mut self, dst: Gpr, src: Gpr, shift: u8) {
        let shift = shift & 63;
        self.emit(Instruction::Ubfm {
            wide: true,
            dst,
            src,
            immr: (64 - shift) & 63,
            imms: 63 - shift,
        });
    }

    // ── Memory ──

    pub fn ldr(&mut self, width: Width, dst: Gpr, base: Gpr, offset: i32) -> Result<()> {
        check_offset(offset, width.scale_log2())?;
        self.emit(Instruction::Ldr {
            width,
            dst,
            base,
            offset,
        });
        Ok(())
    }

    pub fn ldrsw(&mut self, dst: Gpr, base: Gpr, offset: i32) -> Result<()> {
        check_offset(offset, 2)?;
        self.emit(Instruction::Ldrsw { dst, base, offset });
        Ok(())
    }

    pub fn str(&mut self, width: Width, src: Gpr, base: Gpr, offset: i32) -> Result<()> {
        check_offset(offset, width.scale_log2())?;
        self.emit(Instruction::Str {
            width,
            src,
            base,
            offset,
        });
        Ok(())
    }

    pub fn ldr_fp(&mut self, size: FpSize, dst: Fpr, base: Gpr, offset: i32) -> Result<()> {
        check_offset(offset, size.scale_log2())?;
        self.emit(Instruction::LdrFp {
            size,
            dst,
            base,
            offset,
        });
        Ok(())
    }

    pub fn str_fp(&mut self, size: FpSize, src: Fpr, base: Gpr, offset: i32) -> Result<()> {
        check_offset(offset, size.scale_log2())?;
        self.emit(Instruction::StrFp {
            size,
            src,
            base,
            offset,
        });
        Ok(())
    }

    // ── Fixup resolution ──

    /// Patch every label reference and hand back the finished code.
    pub fn finish(mut self) -> Result<CodeBlob> {
        for &(instr_idx, label) in &self.fixups {
            let target = self.labels[label.0]
                .ok_or_else(|| Error::Internal(format!("unbound label {}", label.0)))?;
            let relative = target as i64 - (instr_idx * Instruction::SIZE) as i64;

            let instr = &mut self.instructions[instr_idx];
            let range = instr.pc_relative_range().ok_or_else(|| {
                Error::Internal(format!("cannot fix up non-branch instruction {instr}"))
            })?;
            if relative < -i64::from(range) || relative >= i64::from(range) {
                return Err(Error::ImmediateOutOfRange {
                    what: "branch offset",
                    value: relative,
                });
            }
            if let Some(offset) = instr.pc_relative_offset_mut() {
                *offset = relative as i32;
            }
        }
        Ok(CodeBlob::new(self.instructions, self.comments))
    }
}

fn imm12(imm: u32, what: &'static str) -> Result<u16> {
    if imm < 4096 {
        Ok(imm as u16)
    } else {
        Err(Error::ImmediateOutOfRange {
            what,
            value: i64::from(imm),
        })
    }
}

fn check_offset(offset: i32, scale_log2: u32) -> Result<()> {
    if fits_scaled(offset, scale_log2) || fits_unscaled(offset) {
        Ok(())
    } else {
        Err(Error::ImmediateOutOfRange {
            what: "memory offset",
            value: i64::from(offset),
        })
    }
}
