//! Where a value lives: a register, a stack slot, or nowhere.

use std::fmt;

use serde::Deserialize;

use crate::a64::{Fpr, Gpr};

/// Declared type of an argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    /// Unsigned 16-bit.
    Char,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Void,
}

impl ValueType {
    /// Sub-word integers passed and returned in a 32-bit container.
    #[must_use]
    pub const fn is_int32_class(self) -> bool {
        matches!(
            self,
            Self::Bool | Self::Char | Self::Byte | Self::Short | Self::Int
        )
    }

    #[must_use]
    pub const fn is_integral(self) -> bool {
        self.is_int32_class() || matches!(self, Self::Long)
    }

    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Char => "char",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Void => "void",
        };
        f.write_str(name)
    }
}

/// A location handle.
///
/// `Stack` offsets are in bytes and are relative to the convention's own stack
/// area: the caller's outgoing area for a source convention, the stub's
/// outgoing area for a destination convention. `Bad` marks an unused slot and is
/// treated as absent everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Gpr(Gpr),
    Fpr(Fpr),
    Stack(u32),
    Bad,
}

impl Location {
    #[must_use]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Bad)
    }

    #[must_use]
    pub const fn is_register(self) -> bool {
        matches!(self, Self::Gpr(_) | Self::Fpr(_))
    }

    #[must_use]
    pub const fn is_stack(self) -> bool {
        matches!(self, Self::Stack(_))
    }

    #[must_use]
    pub const fn as_gpr(self) -> Option<Gpr> {
        match self {
            Self::Gpr(reg) => Some(reg),
            _ => None,
        }
    }
}

impl From<Gpr> for Location {
    fn from(reg: Gpr) -> Self {
        Self::Gpr(reg)
    }
}

impl From<Fpr> for Location {
    fn from(reg: Fpr) -> Self {
        Self::Fpr(reg)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpr(reg) => write!(f, "{reg}"),
            Self::Fpr(reg) => write!(f, "{reg}"),
            Self::Stack(offset) => write!(f, "stack[{offset}]"),
            Self::Bad => f.write_str("bad"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a64::registers::{V0, X0};

    #[test]
    fn test_type_classes() {
        assert!(ValueType::Char.is_int32_class());
        assert!(!ValueType::Long.is_int32_class());
        assert!(ValueType::Long.is_integral());
        assert!(ValueType::Double.is_floating());
        assert!(!ValueType::Void.is_integral());
    }

    #[test]
    fn test_location_predicates() {
        assert!(Location::from(X0).is_register());
        assert!(Location::from(V0).is_register());
        assert!(Location::Stack(8).is_stack());
        assert!(!Location::Bad.is_valid());
        assert_eq!(Location::Gpr(X0).as_gpr(), Some(X0));
        assert_eq!(Location::Stack(16).to_string(), "stack[16]");
    }
}
