//! Per-thread execution state shared between managed code and native stubs.
//!
//! A thread moves `Managed -> Native -> NativeTransition -> Managed` around every
//! downcall. Each step is a [`StateTransition`] that fixes both the target state
//! and how the store is published. The stub generator and the host-side
//! [`ThreadStateCell`] derive their stores from the same transition values.

#![allow(clippy::cast_possible_truncation)] // offset_of! yields usize, records are tiny

use std::mem::offset_of;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering, fence};

/// Raw values stored in the thread state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExecutionState {
    Native = 4,
    NativeTransition = 5,
    Managed = 8,
}

impl ExecutionState {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            4 => Some(Self::Native),
            5 => Some(Self::NativeTransition),
            8 => Some(Self::Managed),
            _ => None,
        }
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

/// How a state store becomes visible to other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOrdering {
    /// Store-release: everything written before is visible first.
    Release,
    /// Plain store followed by a full two-way fence, so later loads cannot
    /// be satisfied before the store is visible.
    PlainThenFullFence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    EnterNative,
    BeginReturn,
    ReturnToManaged,
}

impl StateTransition {
    #[must_use]
    pub const fn target(self) -> ExecutionState {
        match self {
            Self::EnterNative => ExecutionState::Native,
            Self::BeginReturn => ExecutionState::NativeTransition,
            Self::ReturnToManaged => ExecutionState::Managed,
        }
    }

    #[must_use]
    pub const fn ordering(self) -> PublishOrdering {
        match self {
            Self::EnterNative | Self::ReturnToManaged => PublishOrdering::Release,
            Self::BeginReturn => PublishOrdering::PlainThenFullFence,
        }
    }

    #[must_use]
    pub const fn expected_source(self) -> ExecutionState {
        match self {
            Self::EnterNative => ExecutionState::Managed,
            Self::BeginReturn => ExecutionState::Native,
            Self::ReturnToManaged => ExecutionState::NativeTransition,
        }
    }
}

/// The thread state word. Only the owning thread writes it.
#[derive(Debug)]
#[repr(transparent)]
pub struct ThreadStateCell {
    value: AtomicU32,
}

impl ThreadStateCell {
    #[must_use]
    pub const fn new(state: ExecutionState) -> Self {
        Self {
            value: AtomicU32::new(state as u32),
        }
    }

    /// Current state as seen by another thread.
    pub fn load(&self) -> Option<ExecutionState> {
        ExecutionState::from_raw(self.value.load(Ordering::Acquire))
    }

    /// Perform `transition` with its publication ordering.
    pub fn apply(&self, transition: StateTransition) {
        debug_assert_eq!(
            ExecutionState::from_raw(self.value.load(Ordering::Relaxed)),
            Some(transition.expected_source()),
            "{transition:?} from an unexpected state"
        );
        let raw = transition.target().raw();
        match transition.ordering() {
            PublishOrdering::Release => self.value.store(raw, Ordering::Release),
            PublishOrdering::PlainThenFullFence => {
                self.value.store(raw, Ordering::Relaxed);
                fence(Ordering::SeqCst);
            }
        }
    }
}

/// Last managed frame of a thread sitting in native code.
///
/// `sp` doubles as the validity flag: zero means no frame is published.
#[derive(Debug, Default)]
#[repr(C)]
pub struct FrameAnchor {
    pub sp: AtomicU64,
    pub fp: AtomicU64,
    pub pc: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorSnapshot {
    pub sp: u64,
    pub fp: u64,
    pub pc: u64,
}

impl FrameAnchor {
    pub fn publish(&self, frame: AnchorSnapshot) {
        self.pc.store(frame.pc, Ordering::Relaxed);
        self.fp.store(frame.fp, Ordering::Relaxed);
        self.sp.store(frame.sp, Ordering::Release);
    }

    pub fn clear(&self) {
        self.sp.store(0, Ordering::Release);
        self.fp.store(0, Ordering::Relaxed);
        self.pc.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Option<AnchorSnapshot> {
        let sp = self.sp.load(Ordering::Acquire);
        (sp != 0).then(|| AnchorSnapshot {
            sp,
            fp: self.fp.load(Ordering::Relaxed),
            pc: self.pc.load(Ordering::Relaxed),
        })
    }
}

/// Polling word value that sends every returning thread to the slow path.
pub const POLL_ARMED: u64 = 1;
/// Polling word value no frame pointer compares above.
pub const POLL_DISARMED: u64 = !1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StackGuardState {
    Unused = 0,
    ReservedDisabled = 1,
    /// Yellow and reserved zones disabled; must be re-armed on the way back.
    YellowReservedDisabled = 2,
    Enabled = 3,
}

/// The fields of a runtime thread that stubs touch.
#[derive(Debug)]
#[repr(C)]
pub struct ThreadRecord {
    pub state: ThreadStateCell,
    pub suspend_flags: AtomicU32,
    pub polling_word: AtomicU64,
    pub anchor: FrameAnchor,
    pub stack_guard_state: AtomicU8,
}

impl Default for ThreadRecord {
    fn default() -> Self {
        Self {
            state: ThreadStateCell::new(ExecutionState::Managed),
            suspend_flags: AtomicU32::new(0),
            polling_word: AtomicU64::new(POLL_DISARMED),
            anchor: FrameAnchor::default(),
            stack_guard_state: AtomicU8::new(StackGuardState::Enabled as u8),
        }
    }
}

impl ThreadRecord {
    /// Arm or disarm this thread's poll. Written by the pause coordinator.
    pub fn set_poll_armed(&self, armed: bool) {
        let word = if armed { POLL_ARMED } else { POLL_DISARMED };
        self.polling_word.store(word, Ordering::Release);
    }
}

/// Byte offsets of [`ThreadRecord`] fields, addressed from the thread register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLayout {
    pub state: u32,
    pub suspend_flags: u32,
    pub polling_word: u32,
    pub anchor_sp: u32,
    pub anchor_fp: u32,
    pub anchor_pc: u32,
    pub stack_guard_state: u32,
    pub size: u32,
}

impl ThreadLayout {
    /// Offsets of the host [`ThreadRecord`].
    #[must_use]
    pub const fn host() -> Self {
        Self {
            state: offset_of!(ThreadRecord, state) as u32,
            suspend_flags: offset_of!(ThreadRecord, suspend_flags) as u32,
            polling_word: offset_of!(ThreadRecord, polling_word) as u32,
            anchor_sp: offset_of!(ThreadRecord, anchor.sp) as u32,
            anchor_fp: offset_of!(ThreadRecord, anchor.fp) as u32,
            anchor_pc: offset_of!(ThreadRecord, anchor.pc) as u32,
            stack_guard_state: offset_of!(ThreadRecord, stack_guard_state) as u32,
            size: size_of::<ThreadRecord>() as u32,
        }
    }
}
