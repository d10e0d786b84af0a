// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel operations report failure through `Result` and these plain enums.
//! Contract violations by task code are `abi::UsageError` and go back to the
//! caller as a response code; the rest are for the kernel's own callers.

use core::fmt;

use abi::UsageError;

/// Failure to create a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CreateError {
    /// Every slot after the scheduler's is in use.
    TableFull,
    /// The requested priority is outside the configured range.
    PriorityOutOfRange,
    /// The stack doesn't leave any room above its guard.
    StackTooSmall,
}

impl From<CreateError> for UsageError {
    fn from(e: CreateError) -> Self {
        match e {
            CreateError::PriorityOutOfRange => UsageError::PriorityOutOfRange,
            // The trap interface has no creation call, so these don't reach
            // tasks; map them onto the nearest thing.
            CreateError::TableFull | CreateError::StackTooSmall => {
                UsageError::TaskOutOfRange
            }
        }
    }
}

/// The platform couldn't set up memory isolation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IsolationError;

/// The platform couldn't emit a trace record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceError;

/// Conditions the kernel can't continue from. These end up in `fail::die`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernError {
    /// Isolation setup failed during preparation.
    Isolation,
    /// No stack could be allocated for the first task.
    NoStack,
    /// The first task could not be created.
    FirstTask(CreateError),
    /// The scheduler task itself faulted.
    SchedulerFault { num: u32, pc: u32 },
}

impl fmt::Display for KernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isolation => write!(f, "isolation setup failed"),
            Self::NoStack => write!(f, "no stack for first task"),
            Self::FirstTask(e) => write!(f, "first task: {e:?}"),
            Self::SchedulerFault { num, pc } => {
                write!(f, "scheduler fault {num} at {pc:#010x}")
            }
        }
    }
}

impl From<CreateError> for KernError {
    fn from(e: CreateError) -> Self {
        Self::FirstTask(e)
    }
}

impl From<IsolationError> for KernError {
    fn from(_: IsolationError) -> Self {
        Self::Isolation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_cause() {
        let mut s = heapless::String::<64>::new();
        core::fmt::write(&mut s, format_args!("{}", KernError::NoStack))
            .unwrap();
        assert_eq!(s.as_str(), "no stack for first task");

        let e: KernError = CreateError::TableFull.into();
        assert_eq!(e, KernError::FirstTask(CreateError::TableFull));
    }
}
