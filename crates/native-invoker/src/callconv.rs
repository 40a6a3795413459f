//! Calling conventions: logical argument index to location.

use crate::a64::registers::{V0, V1, V2, V3, V4, V5, V6, V7, X0, X1, X2, X3, X4, X5, X6, X7};
use crate::a64::{Fpr, Gpr};
use crate::abi::STACK_SLOT_SIZE;
use crate::location::{Location, ValueType};
use crate::{Error, Result};

pub trait CallingConvention {
    /// Location of argument `index`.
    fn arg_location(&self, index: usize) -> Location;

    /// Number of arguments.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All argument locations in order.
    fn locations(&self) -> Vec<Location> {
        (0..self.len()).map(|i| self.arg_location(i)).collect()
    }
}

/// Integer argument registers of the managed convention, in assignment order.
pub const MANAGED_INT_ARGS: [Gpr; 8] = [X1, X2, X3, X4, X5, X6, X7, X0];

/// Float argument registers of the managed convention.
pub const MANAGED_FLOAT_ARGS: [Fpr; 8] = [V0, V1, V2, V3, V4, V5, V6, V7];

/// The convention managed code uses to call a stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedCallConv {
    locations: Vec<Location>,
}

impl ManagedCallConv {
    pub fn new(types: &[ValueType]) -> Result<Self> {
        let mut ints = MANAGED_INT_ARGS.iter();
        let mut floats = MANAGED_FLOAT_ARGS.iter();
        let mut stack_offset = 0u32;
        let mut locations = Vec::with_capacity(types.len());

        for &ty in types {
            let reg = match ty {
                ValueType::Void => {
                    return Err(Error::UnsupportedType(ty, "void argument"));
                }
                ValueType::Float | ValueType::Double => floats.next().copied().map(Location::Fpr),
                _ => ints.next().copied().map(Location::Gpr),
            };
            let loc = reg.unwrap_or_else(|| {
                let slot = Location::Stack(stack_offset);
                stack_offset += STACK_SLOT_SIZE;
                slot
            });
            locations.push(loc);
        }

        Ok(Self { locations })
    }
}

impl CallingConvention for ManagedCallConv {
    fn arg_location(&self, index: usize) -> Location {
        self.locations.get(index).copied().unwrap_or(Location::Bad)
    }

    fn len(&self) -> usize {
        self.locations.len()
    }
}

/// Where managed code expects a result of type `ty`.
#[must_use]
pub fn managed_return_location(ty: ValueType) -> Location {
    match ty {
        ValueType::Void => Location::Bad,
        ValueType::Float | ValueType::Double => Location::Fpr(V0),
        _ => Location::Gpr(X0),
    }
}

/// Destination convention of a downcall: the target address in `target`, then
/// the caller-declared native input locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCallConv {
    target: Gpr,
    inputs: Vec<Location>,
}

impl NativeCallConv {
    #[must_use]
    pub fn new(target: Gpr, inputs: &[Location]) -> Self {
        Self {
            target,
            inputs: inputs.to_vec(),
        }
    }
}

impl CallingConvention for NativeCallConv {
    fn arg_location(&self, index: usize) -> Location {
        match index {
            0 => Location::Gpr(self.target),
            i => self.inputs.get(i - 1).copied().unwrap_or(Location::Bad),
        }
    }

    fn len(&self) -> usize {
        self.inputs.len() + 1
    }
}
