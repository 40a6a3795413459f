//! Return-value spilling around slow-path service calls.

use crate::a64::{Assembler, FpSize, Gpr, Width};
use crate::location::Location;
use crate::Result;

/// Saves and restores a fixed set of return locations to an `sp`-relative region.
///
/// General registers take 8 bytes, vector registers take a full 16-byte `q`
/// slot aligned to 16 within the region. Stack and `Bad` locations need no
/// saving and are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegSpiller {
    slots: Vec<(Location, u32)>,
    size: u32,
}

impl RegSpiller {
    #[must_use]
    pub fn new(locations: &[Location]) -> Self {
        let mut slots = Vec::new();
        let mut size = 0u32;
        for &loc in locations {
            let bytes = Self::slot_size(loc);
            if bytes == 0 {
                continue;
            }
            let offset = size.next_multiple_of(bytes);
            slots.push((loc, offset));
            size = offset + bytes;
        }
        Self { slots, size }
    }

    const fn slot_size(loc: Location) -> u32 {
        match loc {
            Location::Gpr(_) => 8,
            Location::Fpr(_) => 16,
            Location::Stack(_) | Location::Bad => 0,
        }
    }

    #[must_use]
    pub const fn spill_size_bytes(&self) -> u32 {
        self.size
    }

    /// Store every location to `[sp, #sp_offset + slot]`.
    pub fn generate_spill(&self, asm: &mut Assembler, sp_offset: i32) -> Result<()> {
        for &(loc, slot) in &self.slots {
            let offset = slot_offset(sp_offset, slot)?;
            match loc {
                Location::Gpr(reg) => asm.str(Width::X64, reg, Gpr::SP, offset)?,
                Location::Fpr(reg) => asm.str_fp(FpSize::Q, reg, Gpr::SP, offset)?,
                Location::Stack(_) | Location::Bad => {}
            }
        }
        Ok(())
    }

    /// Reload every location from where `generate_spill` put it.
    pub fn generate_fill(&self, asm: &mut Assembler, sp_offset: i32) -> Result<()> {
        for &(loc, slot) in &self.slots {
            let offset = slot_offset(sp_offset, slot)?;
            match loc {
                Location::Gpr(reg) => asm.ldr(Width::X64, reg, Gpr::SP, offset)?,
                Location::Fpr(reg) => asm.ldr_fp(FpSize::Q, reg, Gpr::SP, offset)?,
                Location::Stack(_) | Location::Bad => {}
            }
        }
        Ok(())
    }
}

fn slot_offset(base: i32, slot: u32) -> Result<i32> {
    i32::try_from(slot)
        .ok()
        .and_then(|s| base.checked_add(s))
        .ok_or(crate::Error::ImmediateOutOfRange {
            what: "spill offset",
            value: i64::from(base) + i64::from(slot),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a64::Instruction;
    use crate::a64::registers::{V0, X0};

    #[test]
    fn test_sizes_by_location_kind() {
        assert_eq!(RegSpiller::new(&[]).spill_size_bytes(), 0);
        assert_eq!(RegSpiller::new(&[Location::Gpr(X0)]).spill_size_bytes(), 8);
        assert_eq!(RegSpiller::new(&[Location::Fpr(V0)]).spill_size_bytes(), 16);
        assert_eq!(
            RegSpiller::new(&[Location::Gpr(X0), Location::Bad]).spill_size_bytes(),
            8
        );
        // The q slot is aligned past the x slot.
        assert_eq!(
            RegSpiller::new(&[Location::Gpr(X0), Location::Fpr(V0)]).spill_size_bytes(),
            32
        );
    }

    #[test]
    fn test_spill_and_fill_mirror_each_other() {
        let spiller = RegSpiller::new(&[Location::Gpr(X0), Location::Fpr(V0)]);
        let mut asm = Assembler::new();
        spiller.generate_spill(&mut asm, 16).unwrap();
        spiller.generate_fill(&mut asm, 16).unwrap();
        let blob = asm.finish().unwrap();
        assert_eq!(
            blob.instructions(),
            &[
                Instruction::Str {
                    width: Width::X64,
                    src: X0,
                    base: Gpr::SP,
                    offset: 16
                },
                Instruction::StrFp {
                    size: FpSize::Q,
                    src: V0,
                    base: Gpr::SP,
                    offset: 32
                },
                Instruction::Ldr {
                    width: Width::X64,
                    dst: X0,
                    base: Gpr::SP,
                    offset: 16
                },
                Instruction::LdrFp {
                    size: FpSize::Q,
                    dst: V0,
                    base: Gpr::SP,
                    offset: 32
                },
            ]
        );
    }
}
