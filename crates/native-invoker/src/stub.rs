//! Generated stubs, their root maps and the allocator that places them.

use std::fmt;

use crate::a64::CodeBlob;
use crate::invoker::SafetyProfile;
use crate::{Error, Result};

/// Live managed references of one frame at one code offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RootMap {
    pub frame_size_words: u32,
    /// Frame slots, in words from `sp`, holding references.
    pub roots: Vec<u32>,
}

impl RootMap {
    #[must_use]
    pub const fn new(frame_size_words: u32) -> Self {
        Self {
            frame_size_words,
            roots: Vec::new(),
        }
    }
}

/// Root maps keyed by code offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RootMapSet {
    maps: Vec<(u32, RootMap)>,
}

impl RootMapSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_gc_map(&mut self, code_offset: u32, map: RootMap) {
        self.maps.push((code_offset, map));
    }

    #[must_use]
    pub fn find(&self, code_offset: u32) -> Option<&RootMap> {
        self.maps
            .iter()
            .find(|(offset, _)| *offset == code_offset)
            .map(|(_, map)| map)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &RootMap)> {
        self.maps.iter().map(|(offset, map)| (*offset, map))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

/// Supplies addresses for finished stubs.
pub trait CodeAllocator {
    /// Reserve `bytes` of code space for the stub called `name`.
    fn reserve(&mut self, name: &str, bytes: usize) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRegion {
    pub name: String,
    pub address: u64,
    pub size: usize,
}

/// Bump allocator over a virtual code range. Keeps a record of every region it
/// handed out; it never maps memory.
#[derive(Debug, Clone)]
pub struct HeapCodeAllocator {
    base: u64,
    capacity: usize,
    used: usize,
    regions: Vec<CodeRegion>,
}

impl HeapCodeAllocator {
    pub const ALIGNMENT: usize = 16;
    pub const DEFAULT_BASE: u64 = 0x0000_1000_0000;
    pub const DEFAULT_CAPACITY: usize = 1 << 20;

    /// `base` is rounded up to the code alignment.
    #[must_use]
    pub fn new(base: u64, capacity: usize) -> Self {
        Self {
            base: base.next_multiple_of(Self::ALIGNMENT as u64),
            capacity,
            used: 0,
            regions: Vec::new(),
        }
    }

    #[must_use]
    pub fn regions(&self) -> &[CodeRegion] {
        &self.regions
    }
}

impl Default for HeapCodeAllocator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_CAPACITY)
    }
}

impl CodeAllocator for HeapCodeAllocator {
    fn reserve(&mut self, name: &str, bytes: usize) -> Result<u64> {
        let start = self.used;
        let end = start
            .checked_add(bytes)
            .map(|end| end.next_multiple_of(Self::ALIGNMENT))
            .filter(|end| *end <= self.capacity)
            .ok_or(Error::CodeSizeExceeded {
                size: start.saturating_add(bytes),
                limit: self.capacity,
            })?;
        let address = self.base + start as u64;
        self.used = end;
        self.regions.push(CodeRegion {
            name: name.to_string(),
            address,
            size: bytes,
        });
        Ok(address)
    }
}

/// A finished stub. Immutable once produced.
#[derive(Debug, Clone)]
pub struct StubObject {
    name: String,
    address: u64,
    code: CodeBlob,
    frame_complete: u32,
    frame_size_words: u32,
    root_maps: Option<RootMapSet>,
    profile: SafetyProfile,
}

impl StubObject {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        address: u64,
        code: CodeBlob,
        frame_complete: u32,
        frame_size_words: u32,
        root_maps: Option<RootMapSet>,
        profile: SafetyProfile,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            code,
            frame_complete,
            frame_size_words,
            root_maps,
            profile,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }

    #[must_use]
    pub const fn code(&self) -> &CodeBlob {
        &self.code
    }

    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.code.encode()
    }

    /// Byte offset of the first instruction after the frame is fully set up.
    #[must_use]
    pub const fn frame_complete(&self) -> u32 {
        self.frame_complete
    }

    #[must_use]
    pub const fn frame_size_words(&self) -> u32 {
        self.frame_size_words
    }

    #[must_use]
    pub const fn frame_size_bytes(&self) -> u32 {
        self.frame_size_words * 8
    }

    #[must_use]
    pub const fn root_maps(&self) -> Option<&RootMapSet> {
        self.root_maps.as_ref()
    }

    #[must_use]
    pub const fn profile(&self) -> SafetyProfile {
        self.profile
    }
}

impl fmt::Display for StubObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stub {} @ {:#x}", self.name, self.address)?;
        writeln!(f, "  profile:        {}", self.profile)?;
        writeln!(f, "  code size:      {} bytes", self.code.size_bytes())?;
        writeln!(f, "  frame complete: {:#x}", self.frame_complete)?;
        writeln!(
            f,
            "  frame size:     {} words ({} bytes)",
            self.frame_size_words,
            self.frame_size_bytes()
        )?;
        match &self.root_maps {
            Some(maps) => {
                for (offset, map) in maps.iter() {
                    writeln!(f, "  root map @ {offset:#x}: {} roots", map.roots.len())?;
                }
            }
            None => writeln!(f, "  root maps:      none")?,
        }
        Ok(())
    }
}
