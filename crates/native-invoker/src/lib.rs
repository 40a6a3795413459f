#![allow(
    clippy::cast_possible_truncation, // intentional: frame offsets are u32, A64 immediates are narrower
    clippy::module_name_repetitions,
    clippy::missing_errors_doc // every fallible operation returns crate::Error
)]

pub mod a64;
pub mod abi;
pub mod callconv;
pub mod descriptor;
pub mod error;
pub mod invoker;
pub mod location;
pub mod runtime;
pub mod shuffle;
pub mod spill;
pub mod stub;
pub mod thread;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use descriptor::{AbiDescriptor, BufferLayout, DowncallSignature};
pub use error::{Error, Result};
pub use invoker::{
    GeneratorOptions, InvokerGenerator, SafetyProfile, StubRequest, TrustCriterion,
    generate_adapter, make_native_invoker, supports_native_invoker,
};
pub use location::{Location, ValueType};
pub use runtime::{RuntimeServices, StandardRuntime};
pub use stub::{CodeAllocator, HeapCodeAllocator, StubObject};
