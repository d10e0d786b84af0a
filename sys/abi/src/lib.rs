// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and tasks.
//!
//! Everything in here crosses the privilege boundary in one direction or the
//! other: trap numbers and arguments go in, response codes and wake reasons
//! come out, and the fault record is read by the scheduler task after the
//! hardware fault handler fills it in.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Names a slot in the scheduler table.
///
/// Slot 0 is always the scheduler task itself. Unlike a pointer, a `TaskId`
/// stays meaningful across the kernel/task boundary, but it does not detect
/// reuse of a slot after reclamation: callers that need that must arrange it
/// themselves.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// The scheduler task, which owns the main loop and the fault reporter.
    pub const SCHEDULER: Self = Self(0);

    /// Extracts the table index named by this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

/// Scheduling priority.
///
/// Numerically *greater* priorities are more urgent. Priorities are signed so
/// that the configured floor can sit below zero if an application wants it
/// to.
///
/// Like the kernel's other ordering-sensitive types, this deliberately does
/// not implement `PartialOrd`/`Ord`; use `is_more_urgent_than` so there's no
/// question which way the comparison goes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Priority(pub i8);

impl Priority {
    /// Checks if `self` is strictly more urgent than `other`.
    pub fn is_more_urgent_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Returns whichever of `self` and `other` is more urgent.
    pub fn max(self, other: Self) -> Self {
        if other.is_more_urgent_than(self) {
            other
        } else {
            self
        }
    }

    /// Checks whether `self` lies in the inclusive range `[lowest, highest]`.
    pub fn is_within(self, lowest: Self, highest: Self) -> bool {
        !lowest.is_more_urgent_than(self) && !self.is_more_urgent_than(highest)
    }

    /// Encodes this priority into a register-sized word.
    pub fn to_word(self) -> u32 {
        u32::from(self.0 as u8)
    }

    /// Decodes a priority from a register-sized word, as encoded by
    /// `to_word`. Words with anything set above the low byte don't name a
    /// priority.
    pub fn from_word(word: u32) -> Option<Self> {
        u8::try_from(word).ok().map(|b| Self(b as i8))
    }
}

/// Sentinel used in `ret1` to mean "no value" (no task, no priority).
pub const NONE_WORD: u32 = !0;

/// Encodes an optional priority for a return register.
pub fn encode_priority(p: Option<Priority>) -> u32 {
    p.map_or(NONE_WORD, Priority::to_word)
}

/// Decodes an optional priority from a return register.
pub fn decode_priority(word: u32) -> Option<Priority> {
    if word == NONE_WORD {
        None
    } else {
        Priority::from_word(word)
    }
}

/// Encodes an optional task ID for a return register.
pub fn encode_task(id: Option<TaskId>) -> u32 {
    id.map_or(NONE_WORD, |id| u32::from(id.0))
}

/// Decodes an optional task ID from a return register.
pub fn decode_task(word: u32) -> Option<TaskId> {
    if word == NONE_WORD {
        None
    } else {
        Some(TaskId(word as u16))
    }
}

/// Opaque handle naming a synchronization object that tasks can wait on.
///
/// The kernel only ever compares these for equality. In practice the value is
/// the address of the mutex, semaphore, queue, or condition variable in the
/// owning task's memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlockObject(pub usize);

impl BlockObject {
    /// Block object that a task's joiners wait on. These live at the very
    /// top of the 32-bit address space, where no synchronization object can
    /// be placed, and so still fit in a trap argument register.
    pub const fn for_task(id: TaskId) -> Self {
        Self((u32::MAX - id.0 as u32) as usize)
    }

    /// The task whose joiners wait on this object, if it is one made by
    /// `for_task`.
    pub fn joined_task(self) -> Option<TaskId> {
        let word = u32::try_from(self.0).ok()?;
        u16::try_from(u32::MAX - word).ok().map(TaskId)
    }
}

/// Why a blocked or sleeping task was made active again. Written into the
/// task's `ret1` when it resumes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum WakeReason {
    /// The task has not been woken since it was created.
    None = 0,
    /// Single-waiter handoff, e.g. a mutex passed to the highest-priority
    /// waiter.
    Granted = 1,
    /// A semaphore post released every waiter.
    Semaphore = 2,
    /// A queue became non-empty or non-full.
    Queue = 3,
    /// A condition variable broadcast.
    Condition = 4,
    /// An I/O transfer completed.
    Transfer = 5,
    /// A signal was delivered.
    Signal = 6,
    /// A sleep deadline expired.
    Sleep = 7,
    /// A bounded block gave up.
    Timeout = 8,
    /// A task being joined has been reclaimed.
    Joined = 9,
}

impl core::convert::TryFrom<u32> for WakeReason {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::None),
            1 => Ok(Self::Granted),
            2 => Ok(Self::Semaphore),
            3 => Ok(Self::Queue),
            4 => Ok(Self::Condition),
            5 => Ok(Self::Transfer),
            6 => Ok(Self::Signal),
            7 => Ok(Self::Sleep),
            8 => Ok(Self::Timeout),
            9 => Ok(Self::Joined),
            _ => Err(()),
        }
    }
}

/// Enumeration of trap numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Yield = 0,
    Sleep = 1,
    Block = 2,
    Wake = 3,
    UnblockAll = 4,
    Grant = 5,
    SetPriority = 6,
    RestorePriority = 7,
    Stop = 8,
    Resume = 9,
    Cancel = 10,
    CheckCancel = 11,
    Exit = 12,
    FaultLogged = 13,
    GetCurrent = 14,
    ExecCount = 15,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits`.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Yield),
            1 => Ok(Self::Sleep),
            2 => Ok(Self::Block),
            3 => Ok(Self::Wake),
            4 => Ok(Self::UnblockAll),
            5 => Ok(Self::Grant),
            6 => Ok(Self::SetPriority),
            7 => Ok(Self::RestorePriority),
            8 => Ok(Self::Stop),
            9 => Ok(Self::Resume),
            10 => Ok(Self::Cancel),
            11 => Ok(Self::CheckCancel),
            12 => Ok(Self::Exit),
            13 => Ok(Self::FaultLogged),
            14 => Ok(Self::GetCurrent),
            15 => Ok(Self::ExecCount),
            _ => Err(()),
        }
    }
}

/// Response code written to `ret0` by every trap.
///
/// Zero is success; every other value is a `UsageError`.
pub type ResponseCode = u32;

/// The success response code.
pub const SUCCESS: ResponseCode = 0;

/// A contract violation committed by the caller of a trap. None of these
/// change any kernel state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[repr(u32)]
pub enum UsageError {
    /// A program used an undefined trap number.
    BadSyscallNumber = 1,
    /// A program named a task ID that will never be valid, as it's out of
    /// range.
    TaskOutOfRange = 2,
    /// A program named a slot that is not in use.
    TaskDisabled = 3,
    /// A program asked for an operation that is not allowed on the scheduler
    /// task (stopping it, cancelling it, making it block...).
    SchedulerTask = 4,
    /// A priority outside the configured range.
    PriorityOutOfRange = 5,
    /// An undefined wake reason.
    BadWakeReason = 6,
    /// The slot can't be reclaimed because it still waits on a block object.
    BlockObjectHeld = 7,
    /// A program tried to join a detached task.
    NotJoinable = 8,
}

impl From<UsageError> for ResponseCode {
    fn from(e: UsageError) -> Self {
        e as u32
    }
}

impl core::convert::TryFrom<ResponseCode> for UsageError {
    type Error = ();

    fn try_from(x: ResponseCode) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::BadSyscallNumber),
            2 => Ok(Self::TaskOutOfRange),
            3 => Ok(Self::TaskDisabled),
            4 => Ok(Self::SchedulerTask),
            5 => Ok(Self::PriorityOutOfRange),
            6 => Ok(Self::BadWakeReason),
            7 => Ok(Self::BlockObjectHeld),
            8 => Ok(Self::NotJoinable),
            _ => Err(()),
        }
    }
}

/// The most recent unreported processor fault.
///
/// This is a single-slot mailbox: `num` doubles as the pending flag, so a
/// record with `num == 0` is idle. The layout is fixed because debuggers read
/// it straight out of memory.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct FaultRecord {
    /// Fault number (exception number on Cortex-M). Zero when idle.
    pub num: u32,
    /// Faulting program counter.
    pub pc: u32,
    /// Faulting data address, when the processor reports one.
    pub addr: u32,
    /// Link register of the faulting code.
    pub caller: u32,
    /// Program counter of privileged code, for faults taken in the kernel.
    pub handler_pc: u32,
    /// Link register of privileged code, for faults taken in the kernel.
    pub handler_caller: u32,
    /// Index of the faulting task.
    pub tid: u32,
    /// Bytes left between the task's stack pointer and its stack base.
    pub free_stack_size: u32,
    /// Bytes of free heap, if the platform tracks it.
    pub free_heap_size: u32,
}

impl FaultRecord {
    pub fn is_pending(&self) -> bool {
        self.num != 0
    }
}

/// Severity tag on a trace record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TraceKind {
    Fatal,
    Message,
}

/// Kernel lifecycle events reported to the platform.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KernelEvent {
    /// The kernel could not set up privileged state. Context is a 4-byte
    /// ASCII tag.
    RootFatal,
    /// A bootstrap step failed. Context is a 4-byte ASCII tag.
    Fatal,
    /// Isolation is up and the debug transport may attach.
    DebugInitialized,
    /// The first application task exists. Context is its index.
    TaskInitialized,
}

/// Scheduling policy within a priority level.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SchedPolicy {
    /// Yield to equal-priority peers when the quantum runs out.
    RoundRobin,
    /// Run until blocking or yielding.
    Fifo,
}

/// Whether a task can be joined after it exits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DetachState {
    Joinable,
    Detached,
}

/// Attributes supplied at task creation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskAttributes {
    pub priority: Priority,
    pub policy: SchedPolicy,
    pub detach: DetachState,
    /// Bytes at the stack base reserved as a guard region.
    pub guard_size: u32,
}

/// Memory bounds of a task's isolation region (its stack, for our purposes).
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Serialize,
    Deserialize,
)]
#[repr(C)]
pub struct RegionDesc {
    pub base: u32,
    pub size: u32,
}

impl RegionDesc {
    /// Address one past the end of the region, saturating.
    pub fn end_addr(&self) -> u32 {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end_addr()
    }
}
