//! Declarative ABI descriptors, context-record layouts and downcall signatures.
//!
//! The `Raw*` types mirror the JSON wire format and are converted with `TryFrom`
//! into validated descriptors. Conversion rejects registers of the wrong class,
//! out-of-range register numbers and alignments that are not powers of two.

use serde::Deserialize;

use crate::abi::{INTEGER_SLOT_SIZE, STACK_SLOT_SIZE, VECTOR_SLOT_SIZE, WORD_SIZE};
use crate::a64::{Fpr, Gpr};
use crate::location::{Location, ValueType};
use crate::{Error, Result};

// ── Wire format ──

/// Storage kind tags used by the wire format.
pub mod storage_type {
    pub const INTEGER: u32 = 0;
    pub const VECTOR: u32 = 1;
    pub const STACK: u32 = 3;
}

/// One storage element: `{ "type": 0|1|3, "index": n }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RawStorage {
    #[serde(rename = "type")]
    pub kind: u32,
    pub index: u32,
}

impl RawStorage {
    /// Decode to a location. Unknown kinds become `Location::Bad`; stack indices
    /// count 8-byte slots.
    pub fn to_location(self) -> Result<Location> {
        match self.kind {
            storage_type::INTEGER => u8::try_from(self.index)
                .ok()
                .and_then(Gpr::new)
                .map(Location::Gpr)
                .ok_or_else(|| Error::Descriptor(format!("no integer register {}", self.index))),
            storage_type::VECTOR => u8::try_from(self.index)
                .ok()
                .and_then(Fpr::new)
                .map(Location::Fpr)
                .ok_or_else(|| Error::Descriptor(format!("no vector register {}", self.index))),
            storage_type::STACK => self
                .index
                .checked_mul(STACK_SLOT_SIZE)
                .map(Location::Stack)
                .ok_or_else(|| Error::Descriptor(format!("stack index {} overflows", self.index))),
            _ => Ok(Location::Bad),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStorageSet {
    #[serde(default)]
    pub integer: Vec<RawStorage>,
    #[serde(default)]
    pub vector: Vec<RawStorage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAbi {
    pub input_storage: RawStorageSet,
    pub output_storage: RawStorageSet,
    #[serde(default)]
    pub volatile_storage: RawStorageSet,
    pub stack_alignment: u32,
    #[serde(default)]
    pub shadow_space: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLayout {
    pub stack_args_bytes: u64,
    pub stack_args: u64,
    pub arguments_next_pc: u64,
    /// `[integer, vector]` base offsets of the argument slots.
    pub input_type_offsets: [u64; 2],
    /// `[integer, vector]` base offsets of the return slots.
    pub output_type_offsets: [u64; 2],
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDowncallSignature {
    pub arg_types: Vec<ValueType>,
    pub return_type: ValueType,
    pub input_locations: Vec<RawStorage>,
    #[serde(default)]
    pub output_locations: Vec<RawStorage>,
    #[serde(default)]
    pub shadow_space: u32,
}

// ── ABI descriptor ──

/// Registers a native convention uses for arguments and returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiDescriptor {
    pub integer_args: Vec<Gpr>,
    pub vector_args: Vec<Fpr>,
    pub integer_returns: Vec<Gpr>,
    pub vector_returns: Vec<Fpr>,
    pub integer_volatile: Vec<Gpr>,
    pub vector_volatile: Vec<Fpr>,
    pub stack_alignment: u32,
    pub shadow_space: u32,
}

impl AbiDescriptor {
    /// True if the callee may clobber `loc`: argument registers plus the
    /// additional volatile registers of the same class.
    #[must_use]
    pub fn is_volatile(&self, loc: Location) -> bool {
        match loc {
            Location::Gpr(reg) => {
                self.integer_args.contains(&reg) || self.integer_volatile.contains(&reg)
            }
            Location::Fpr(reg) => {
                self.vector_args.contains(&reg) || self.vector_volatile.contains(&reg)
            }
            Location::Stack(_) | Location::Bad => false,
        }
    }

    /// Every register the descriptor names, in declaration order.
    pub fn declared_locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.integer_args
            .iter()
            .chain(&self.integer_returns)
            .copied()
            .map(Location::Gpr)
            .chain(
                self.vector_args
                    .iter()
                    .chain(&self.vector_returns)
                    .copied()
                    .map(Location::Fpr),
            )
    }
}

fn gprs(raw: &[RawStorage], what: &str) -> Result<Vec<Gpr>> {
    raw.iter()
        .map(|s| match s.to_location()? {
            Location::Gpr(reg) => Ok(reg),
            other => Err(Error::Descriptor(format!(
                "{what}: expected an integer register, found {other}"
            ))),
        })
        .collect()
}

fn fprs(raw: &[RawStorage], what: &str) -> Result<Vec<Fpr>> {
    raw.iter()
        .map(|s| match s.to_location()? {
            Location::Fpr(reg) => Ok(reg),
            other => Err(Error::Descriptor(format!(
                "{what}: expected a vector register, found {other}"
            ))),
        })
        .collect()
}

impl TryFrom<RawAbi> for AbiDescriptor {
    type Error = Error;

    fn try_from(raw: RawAbi) -> Result<Self> {
        if !raw.stack_alignment.is_power_of_two() || raw.stack_alignment < WORD_SIZE {
            return Err(Error::Descriptor(format!(
                "stack alignment {} is not a power of two of at least {WORD_SIZE}",
                raw.stack_alignment
            )));
        }
        Ok(Self {
            integer_args: gprs(&raw.input_storage.integer, "integer arguments")?,
            vector_args: fprs(&raw.input_storage.vector, "vector arguments")?,
            integer_returns: gprs(&raw.output_storage.integer, "integer returns")?,
            vector_returns: fprs(&raw.output_storage.vector, "vector returns")?,
            integer_volatile: gprs(&raw.volatile_storage.integer, "integer volatile")?,
            vector_volatile: fprs(&raw.volatile_storage.vector, "vector volatile")?,
            stack_alignment: raw.stack_alignment,
            shadow_space: raw.shadow_space,
        })
    }
}

// ── Context record layout ──

/// Byte offsets into the invocation context record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub stack_args_bytes: u32,
    pub stack_args: u32,
    pub arguments_next_pc: u32,
    pub arguments_integer: u32,
    pub arguments_vector: u32,
    pub returns_integer: u32,
    pub returns_vector: u32,
    pub size: u32,
}

impl BufferLayout {
    #[must_use]
    pub const fn integer_arg_offset(&self, index: u32) -> u32 {
        self.arguments_integer + index * INTEGER_SLOT_SIZE
    }

    #[must_use]
    pub const fn vector_arg_offset(&self, index: u32) -> u32 {
        self.arguments_vector + index * VECTOR_SLOT_SIZE
    }

    #[must_use]
    pub const fn integer_return_offset(&self, index: u32) -> u32 {
        self.returns_integer + index * INTEGER_SLOT_SIZE
    }

    #[must_use]
    pub const fn vector_return_offset(&self, index: u32) -> u32 {
        self.returns_vector + index * VECTOR_SLOT_SIZE
    }

    /// Check that every slot `abi` needs lies inside the record.
    pub fn check_fits(&self, abi: &AbiDescriptor) -> Result<()> {
        let arrays = [
            ("integer arguments", self.arguments_integer, abi.integer_args.len(), INTEGER_SLOT_SIZE),
            ("vector arguments", self.arguments_vector, abi.vector_args.len(), VECTOR_SLOT_SIZE),
            ("integer returns", self.returns_integer, abi.integer_returns.len(), INTEGER_SLOT_SIZE),
            ("vector returns", self.returns_vector, abi.vector_returns.len(), VECTOR_SLOT_SIZE),
        ];
        for (what, base, count, slot) in arrays {
            let end = u64::from(base) + count as u64 * u64::from(slot);
            if end > u64::from(self.size) {
                return Err(Error::Descriptor(format!(
                    "{what} end at byte {end}, past the record size {}",
                    self.size
                )));
            }
        }
        for (what, offset) in [
            ("stack argument size", self.stack_args_bytes),
            ("stack argument pointer", self.stack_args),
            ("native entry", self.arguments_next_pc),
        ] {
            if u64::from(offset) + u64::from(WORD_SIZE) > u64::from(self.size) {
                return Err(Error::Descriptor(format!(
                    "{what} at byte {offset} is past the record size {}",
                    self.size
                )));
            }
        }
        Ok(())
    }
}

fn offset32(value: u64, what: &str) -> Result<u32> {
    // Offsets must stay addressable with a signed 32-bit displacement.
    u32::try_from(value)
        .ok()
        .filter(|v| i32::try_from(*v).is_ok())
        .ok_or_else(|| Error::Descriptor(format!("{what} offset {value} is too large")))
}

impl TryFrom<RawLayout> for BufferLayout {
    type Error = Error;

    fn try_from(raw: RawLayout) -> Result<Self> {
        Ok(Self {
            stack_args_bytes: offset32(raw.stack_args_bytes, "stack_args_bytes")?,
            stack_args: offset32(raw.stack_args, "stack_args")?,
            arguments_next_pc: offset32(raw.arguments_next_pc, "arguments_next_pc")?,
            arguments_integer: offset32(raw.input_type_offsets[0], "integer input")?,
            arguments_vector: offset32(raw.input_type_offsets[1], "vector input")?,
            returns_integer: offset32(raw.output_type_offsets[0], "integer output")?,
            returns_vector: offset32(raw.output_type_offsets[1], "vector output")?,
            size: offset32(raw.size, "size")?,
        })
    }
}

// ── Downcall signature ──

/// A downcall: argument types (the first is the `Long` target address), the
/// native locations of the remaining arguments, and the native return location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowncallSignature {
    pub arg_types: Vec<ValueType>,
    pub return_type: ValueType,
    pub input_locations: Vec<Location>,
    pub output_locations: Vec<Location>,
    pub shadow_space: u32,
}

impl DowncallSignature {
    #[must_use]
    pub fn new(
        arg_types: Vec<ValueType>,
        return_type: ValueType,
        input_locations: Vec<Location>,
        output_locations: Vec<Location>,
    ) -> Self {
        Self {
            arg_types,
            return_type,
            input_locations,
            output_locations,
            shadow_space: 0,
        }
    }

    /// The native return location, `Bad` for void.
    #[must_use]
    pub fn output_location(&self) -> Location {
        self.output_locations
            .first()
            .copied()
            .unwrap_or(Location::Bad)
    }
}

impl TryFrom<RawDowncallSignature> for DowncallSignature {
    type Error = Error;

    fn try_from(raw: RawDowncallSignature) -> Result<Self> {
        let input_locations = raw
            .input_locations
            .iter()
            .map(|s| s.to_location())
            .collect::<Result<Vec<_>>>()?;
        let output_locations = raw
            .output_locations
            .iter()
            .map(|s| s.to_location())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            arg_types: raw.arg_types,
            return_type: raw.return_type,
            input_locations,
            output_locations,
            shadow_space: raw.shadow_space,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a64::registers::{V0, X0, X1, X8};

    fn storage(kind: u32, index: u32) -> RawStorage {
        RawStorage { kind, index }
    }

    #[test]
    fn test_storage_decoding() {
        assert_eq!(storage(0, 1).to_location().unwrap(), Location::Gpr(X1));
        assert_eq!(storage(1, 0).to_location().unwrap(), Location::Fpr(V0));
        assert_eq!(storage(3, 2).to_location().unwrap(), Location::Stack(16));
        assert_eq!(storage(7, 0).to_location().unwrap(), Location::Bad);
        assert!(storage(0, 31).to_location().is_err());
        assert!(storage(1, 32).to_location().is_err());
    }

    fn raw_abi(stack_alignment: u32) -> RawAbi {
        RawAbi {
            input_storage: RawStorageSet {
                integer: vec![storage(0, 0), storage(0, 1)],
                vector: vec![storage(1, 0)],
            },
            output_storage: RawStorageSet {
                integer: vec![storage(0, 0)],
                vector: vec![storage(1, 0)],
            },
            volatile_storage: RawStorageSet {
                integer: vec![storage(0, 8)],
                vector: Vec::new(),
            },
            stack_alignment,
            shadow_space: 0,
        }
    }

    #[test]
    fn test_abi_conversion_and_volatility() {
        let abi = AbiDescriptor::try_from(raw_abi(16)).unwrap();
        assert_eq!(abi.integer_args, vec![X0, X1]);
        assert!(abi.is_volatile(Location::Gpr(X1)));
        assert!(abi.is_volatile(Location::Gpr(X8)));
        assert!(abi.is_volatile(Location::Fpr(V0)));
        assert!(!abi.is_volatile(Location::Gpr(crate::abi::THREAD_REG)));
        assert!(!abi.is_volatile(Location::Stack(0)));
        assert_eq!(abi.declared_locations().count(), 5);
    }

    #[test]
    fn test_abi_rejects_bad_alignment_and_wrong_class() {
        assert!(matches!(
            AbiDescriptor::try_from(raw_abi(12)),
            Err(Error::Descriptor(_))
        ));
        let mut raw = raw_abi(16);
        raw.input_storage.integer.push(storage(1, 3));
        assert!(matches!(
            AbiDescriptor::try_from(raw),
            Err(Error::Descriptor(_))
        ));
    }

    #[test]
    fn test_layout_slot_offsets_and_bounds() {
        let layout = BufferLayout::try_from(RawLayout {
            stack_args_bytes: 0,
            stack_args: 8,
            arguments_next_pc: 16,
            input_type_offsets: [24, 48],
            output_type_offsets: [64, 80],
            size: 96,
        })
        .unwrap();
        assert_eq!(layout.integer_arg_offset(1), 32);
        assert_eq!(layout.vector_arg_offset(1), 64);
        assert_eq!(layout.vector_return_offset(0), 80);

        let abi = AbiDescriptor::try_from(raw_abi(16)).unwrap();
        assert!(layout.check_fits(&abi).is_ok());

        let small = BufferLayout { size: 72, ..layout };
        assert!(matches!(small.check_fits(&abi), Err(Error::Descriptor(_))));
    }
}
