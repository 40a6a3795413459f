//! Stub generation entry points.
//!
//! One generator covers both stub kinds. The caller picks the kind through a
//! [`StubRequest`], and the request fixes the [`SafetyProfile`]: a context adapter
//! never transitions the thread state, so the caller must say why that is sound
//! for its target by naming a [`TrustCriterion`].

mod adapter;
mod downcall;

use std::fmt;

use crate::a64::CodeBlob;
use crate::descriptor::{AbiDescriptor, BufferLayout, DowncallSignature};
use crate::runtime::{RuntimeServices, StandardRuntime};
use crate::stub::{CodeAllocator, RootMapSet, StubObject};
use crate::{Error, Result};

pub use downcall::ReservedRegisters;

/// Why a call target may run without leaving the managed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustCriterion {
    /// The target neither blocks nor calls anything that might.
    NonBlockingLeaf,
    /// The target never re-enters the runtime or touches managed objects.
    NoRuntimeInteraction,
}

impl fmt::Display for TrustCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NonBlockingLeaf => "non-blocking leaf",
            Self::NoRuntimeInteraction => "no runtime interaction",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyProfile {
    /// No state transition, poll or root map.
    Unchecked(TrustCriterion),
    /// Full state transitions with suspension poll and stack reguard.
    Cooperative,
}

impl fmt::Display for SafetyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchecked(criterion) => write!(f, "unchecked ({criterion})"),
            Self::Cooperative => f.write_str("cooperative"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorOptions {
    /// Largest stub, in bytes, the generator will hand to the allocator.
    pub code_size_limit: usize,
    /// Emit the disassembly of every stub at `trace` level.
    pub trace_listing: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            code_size_limit: 1024,
            trace_listing: true,
        }
    }
}

/// What to generate. The variant fixes the [`SafetyProfile`]: a context adapter
/// is always `Unchecked` with the caller's [`TrustCriterion`], a downcall is
/// always `Cooperative`. Callers cannot request any other pairing.
#[derive(Debug, Clone, Copy)]
pub enum StubRequest<'a> {
    /// Load arguments from a context record, call, store results back.
    ContextAdapter {
        abi: &'a AbiDescriptor,
        layout: &'a BufferLayout,
        criterion: TrustCriterion,
    },
    /// Shuffle managed arguments straight into the native convention.
    Downcall(&'a DowncallSignature),
}

impl StubRequest<'_> {
    #[must_use]
    pub const fn safety_profile(&self) -> SafetyProfile {
        match self {
            Self::ContextAdapter { criterion, .. } => SafetyProfile::Unchecked(*criterion),
            Self::Downcall(_) => SafetyProfile::Cooperative,
        }
    }

    #[must_use]
    pub const fn stub_name(&self) -> &'static str {
        match self {
            Self::ContextAdapter { .. } => "invoke_native_context",
            Self::Downcall(_) => "native_downcall",
        }
    }
}

/// Code and frame facts produced by an emitter, before placement.
struct EmittedStub {
    code: CodeBlob,
    frame_complete: u32,
    frame_size_words: u32,
    root_maps: Option<RootMapSet>,
}

/// Signed displacement for a base-plus-offset address.
fn displacement(offset: u32, what: &'static str) -> Result<i32> {
    i32::try_from(offset).map_err(|_| Error::ImmediateOutOfRange {
        what,
        value: i64::from(offset),
    })
}

pub struct InvokerGenerator<'r> {
    options: GeneratorOptions,
    runtime: &'r dyn RuntimeServices,
}

impl<'r> InvokerGenerator<'r> {
    #[must_use]
    pub fn new(runtime: &'r dyn RuntimeServices) -> Self {
        Self::with_options(GeneratorOptions::default(), runtime)
    }

    #[must_use]
    pub fn with_options(options: GeneratorOptions, runtime: &'r dyn RuntimeServices) -> Self {
        Self { options, runtime }
    }

    #[must_use]
    pub const fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    /// Emit the stub for `request` and place it with `allocator`.
    ///
    /// Every fatal condition is reported before anything is reserved.
    pub fn generate(
        &self,
        request: &StubRequest<'_>,
        allocator: &mut dyn CodeAllocator,
    ) -> Result<StubObject> {
        let profile = request.safety_profile();
        let emitted = match *request {
            StubRequest::ContextAdapter {
                abi,
                layout,
                criterion,
            } => {
                tracing::warn!(
                    "generating context adapter without state transitions, trusted as {criterion}"
                );
                adapter::emit(abi, layout)?
            }
            StubRequest::Downcall(signature) => downcall::emit(signature, self.runtime)?,
        };

        let size = emitted.code.size_bytes();
        if size > self.options.code_size_limit {
            return Err(Error::CodeSizeExceeded {
                size,
                limit: self.options.code_size_limit,
            });
        }

        let name = request.stub_name();
        let address = allocator.reserve(name, size)?;
        tracing::debug!(
            "generated {name} at {address:#x}: {size} bytes, frame {} words, profile {profile}",
            emitted.frame_size_words
        );
        if self.options.trace_listing {
            tracing::trace!("{name} listing:\n{}", emitted.code.listing());
        }

        Ok(StubObject::new(
            name,
            address,
            emitted.code,
            emitted.frame_complete,
            emitted.frame_size_words,
            emitted.root_maps,
            profile,
        ))
    }
}

/// Context-record adapter under an explicit trust criterion.
pub fn generate_adapter(
    abi: &AbiDescriptor,
    layout: &BufferLayout,
    criterion: TrustCriterion,
    allocator: &mut dyn CodeAllocator,
) -> Result<StubObject> {
    let runtime = StandardRuntime::default();
    InvokerGenerator::new(&runtime).generate(
        &StubRequest::ContextAdapter {
            abi,
            layout,
            criterion,
        },
        allocator,
    )
}

/// Cooperative downcall stub for `signature`.
pub fn make_native_invoker(
    signature: &DowncallSignature,
    runtime: &dyn RuntimeServices,
    allocator: &mut dyn CodeAllocator,
) -> Result<StubObject> {
    InvokerGenerator::new(runtime).generate(&StubRequest::Downcall(signature), allocator)
}

/// Native invokers can be generated on this target.
#[must_use]
pub const fn supports_native_invoker() -> bool {
    true
}
