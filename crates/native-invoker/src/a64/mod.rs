// A64 encoding utilities use explicit 'as' casts for field packing.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

mod assembler;
mod blob;
mod instruction;
pub mod registers;

pub use assembler::{Assembler, Label};
pub use blob::CodeBlob;
pub use instruction::{Cond, FpSize, Index, Instruction, Width, fits_scaled, fits_unscaled};
pub use registers::{Fpr, Gpr};
