use crate::location::{Location, ValueType};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Multi-register returns are not supported: {0} output locations")]
    MultiRegisterReturn(usize),

    #[error("Shadow space is not supported on this target (requested {0} bytes)")]
    ShadowSpace(u32),

    #[error("Register {reg} used as {role} collides with a declared location")]
    RegisterConflict { reg: Location, role: &'static str },

    #[error("Frame size {size} is not aligned to {alignment} bytes")]
    MisalignedFrame { size: u32, alignment: u32 },

    #[error("Unresolvable argument shuffle: {0}")]
    UnresolvableShuffle(String),

    #[error("Argument count mismatch: {src} source vs {dst} destination locations")]
    ArgumentCountMismatch { src: usize, dst: usize },

    #[error("{what} out of encodable range: {value}")]
    ImmediateOutOfRange { what: &'static str, value: i64 },

    #[error("Unsupported type {0}: {1}")]
    UnsupportedType(ValueType, &'static str),

    #[error("Generated code is {size} bytes, limit is {limit}")]
    CodeSizeExceeded { size: usize, limit: usize },

    #[error("Invalid descriptor: {0}")]
    Descriptor(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
