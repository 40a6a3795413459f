use std::fmt::Write;

use super::Instruction;

/// Finished stub code: the instruction stream plus the block comments emitted with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlob {
    instructions: Vec<Instruction>,
    comments: Vec<(usize, String)>,
}

impl CodeBlob {
    #[must_use]
    pub fn new(instructions: Vec<Instruction>, comments: Vec<(usize, String)>) -> Self {
        Self {
            instructions,
            comments,
        }
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.instructions.len() * Instruction::SIZE
    }

    /// Instruction at byte `offset`, if it is an instruction boundary.
    #[must_use]
    pub fn instruction_at(&self, offset: u64) -> Option<&Instruction> {
        if offset % Instruction::SIZE as u64 != 0 {
            return None;
        }
        usize::try_from(offset / Instruction::SIZE as u64)
            .ok()
            .and_then(|idx| self.instructions.get(idx))
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut code = Vec::with_capacity(self.size_bytes());
        for instr in &self.instructions {
            code.extend(instr.to_bytes());
        }
        code
    }

    /// Disassembly listing with byte offsets, raw words and block comments.
    #[must_use]
    pub fn listing(&self) -> String {
        let mut out = String::new();
        let mut comments = self.comments.iter().peekable();
        for (idx, instr) in self.instructions.iter().enumerate() {
            while let Some((_, text)) = comments.next_if(|(at, _)| *at == idx) {
                let _ = writeln!(out, "          ;; {text}");
            }
            let _ = writeln!(
                out,
                "{:#06x}: {:08x}  {instr}",
                idx * Instruction::SIZE,
                instr.encode()
            );
        }
        for (_, text) in comments {
            let _ = writeln!(out, "          ;; {text}");
        }
        out
    }
}
