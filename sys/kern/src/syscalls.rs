// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent trap implementation.
//!
//! This builds on architecture-specific parts defined in the `arch::*` modules.
//!
//! # Trap implementations
//!
//! Traps are implemented by functions with the signature:
//!
//! ```ignore
//! fn trap(
//!     table: &mut TaskTable<'_>,
//!     caller: usize,
//! ) -> Result<u32, UsageError>;
//! ```
//!
//! `table` is the task table, and `caller` is the index of the task within it
//! that trapped. On return, `Ok` carries the value for the caller's second
//! return register, while a `UsageError` is returned to the caller as a
//! response code. Either way nothing else happens on error. A common wrapper
//! writes the response and then performs any context switch the trap asked
//! for.
//!
//! Arguments are read from the caller's saved registers through the argument
//! proxies on `task::ArchState`, e.g. `task.save().as_wake_args()`.

use core::convert::TryFrom;

use abi::{
    encode_priority, encode_task, Sysnum, TaskId, UsageError, WakeReason,
    SUCCESS,
};

use crate::arch;
use crate::fault::FAULT_RECORD;
use crate::klog::KernEvent;
use crate::mailbox::MAILBOX;
use crate::startup::with_task_table;
use crate::task::{ArchState, Task, TaskTable};

/// Entry point accessed by arch-specific trap entry sequence.
///
/// Before calling this, task volatile state (e.g. callee-save registers on ARM)
/// must be stored safely into the `SavedState` struct of the `Task`.
///
/// `nr` is the trap number passed from user code.
///
/// `task` is a pointer to the current Task.
///
/// # Safety
///
/// `task` must point into the installed task table.
#[no_mangle]
pub unsafe extern "C" fn syscall_entry(nr: u32, task: *mut Task) {
    crate::profiling::event_trap_enter(nr);

    // The task pointer is about to alias our task table, at which point it
    // could not be dereferenced -- so we'll shed our ability to dereference it.
    let task = task as usize;

    with_task_table(|table| {
        MAILBOX.drain(table);

        // Work out the task index based on the pointer into the task table
        // slice.
        let idx = (task - table.tasks().as_ptr() as usize)
            / core::mem::size_of::<Task>();

        let next = safe_syscall_entry(nr, idx, table);
        // Safety: next comes from the task table and we don't use it again
        // until next kernel entry, so we meet set_current_task's requirements.
        unsafe {
            arch::set_current_task(&table.tasks()[next]);
        }
    });

    crate::profiling::event_trap_exit();
}

/// Factored out of `syscall_entry` to encapsulate the bits that don't need
/// unsafe. Returns the index of the task to resume.
pub fn safe_syscall_entry(
    nr: u32,
    caller: usize,
    table: &mut TaskTable<'_>,
) -> usize {
    let res = match Sysnum::try_from(nr) {
        Ok(Sysnum::Yield) => sched_yield(table),
        Ok(Sysnum::Sleep) => sleep(table, caller),
        Ok(Sysnum::Block) => block(table, caller),
        Ok(Sysnum::Wake) => wake(table, caller),
        Ok(Sysnum::UnblockAll) => unblock_all(table, caller),
        Ok(Sysnum::Grant) => grant(table, caller),
        Ok(Sysnum::SetPriority) => set_priority(table, caller),
        Ok(Sysnum::RestorePriority) => restore_priority(table, caller),
        Ok(Sysnum::Stop) => stop(table, caller),
        Ok(Sysnum::Resume) => resume(table, caller),
        Ok(Sysnum::Cancel) => cancel(table, caller),
        Ok(Sysnum::CheckCancel) => check_cancel(table, caller),
        Ok(Sysnum::Exit) => exit(table, caller),
        Ok(Sysnum::FaultLogged) => fault_logged(table),
        Ok(Sysnum::GetCurrent) => get_current(table, caller),
        Ok(Sysnum::ExecCount) => Ok(table.exec_count() as u32),
        Err(_) => Err(UsageError::BadSyscallNumber),
    };

    let save = table.tasks[caller].save_mut();
    match res {
        Ok(value) => save.set_response(SUCCESS, value),
        Err(error) => {
            klog!(KernEvent::TrapRejected { nr, error });
            save.set_error_response(error);
        }
    }

    table.reschedule()
}

/// Refuses traps that would put the scheduler task to sleep; the main loop
/// has to keep running.
fn not_scheduler(caller: usize) -> Result<(), UsageError> {
    if caller == 0 {
        Err(UsageError::SchedulerTask)
    } else {
        Ok(())
    }
}

fn sched_yield(table: &mut TaskTable<'_>) -> Result<u32, UsageError> {
    table.request_context_switch();
    Ok(0)
}

fn sleep(table: &mut TaskTable<'_>, caller: usize) -> Result<u32, UsageError> {
    not_scheduler(caller)?;
    let args = table.tasks[caller].save().as_sleep_args();
    table.sleep(caller, arch::now().after(args.ticks));
    Ok(WakeReason::None as u32)
}

/// The caller's response is overwritten with its wake reason when it is
/// released.
fn block(table: &mut TaskTable<'_>, caller: usize) -> Result<u32, UsageError> {
    not_scheduler(caller)?;
    let args = table.tasks[caller].save().as_block_args();
    table.check_block_object(args.object)?;
    let deadline = args.timeout.map(|t| arch::now().after(t));
    table.block(caller, args.object, deadline);
    Ok(WakeReason::None as u32)
}

fn wake(table: &mut TaskTable<'_>, caller: usize) -> Result<u32, UsageError> {
    let args = table.tasks[caller].save().as_wake_args();
    let index = table.check_thread_id(args.task)?;
    let p = args.priority.ok_or(UsageError::PriorityOutOfRange)?;
    table.config().check_priority(p)?;
    table.wake(Some(index), p);
    Ok(0)
}

/// Returns the most urgent priority released, if any.
fn unblock_all(
    table: &mut TaskTable<'_>,
    caller: usize,
) -> Result<u32, UsageError> {
    let args = table.tasks[caller].save().as_unblock_args();
    let reason = WakeReason::try_from(args.reason)
        .map_err(|_| UsageError::BadWakeReason)?;
    let highest = table.unblock_all(args.object, reason);
    if let Some(p) = highest {
        table.wake(None, p);
    }
    Ok(encode_priority(highest))
}

/// Returns the task that received the object, if any.
fn grant(table: &mut TaskTable<'_>, caller: usize) -> Result<u32, UsageError> {
    let args = table.tasks[caller].save().as_unblock_args();
    let granted = table.grant(args.object);
    Ok(encode_task(granted.map(|i| TaskId(i as u16))))
}

fn set_priority(
    table: &mut TaskTable<'_>,
    caller: usize,
) -> Result<u32, UsageError> {
    let args = table.tasks[caller].save().as_wake_args();
    let index = table.check_thread_id(args.task)?;
    let p = args.priority.ok_or(UsageError::PriorityOutOfRange)?;
    table.set_priority(index, p)?;
    Ok(0)
}

fn restore_priority(
    table: &mut TaskTable<'_>,
    caller: usize,
) -> Result<u32, UsageError> {
    let id = table.tasks[caller].save().as_task_args();
    let index = table.check_thread_id(id)?;
    table.restore_priority(index);
    Ok(0)
}

fn stop(table: &mut TaskTable<'_>, caller: usize) -> Result<u32, UsageError> {
    let id = table.tasks[caller].save().as_task_args();
    let index = table.check_thread_id(id)?;
    table.stop(index);
    Ok(0)
}

fn resume(table: &mut TaskTable<'_>, caller: usize) -> Result<u32, UsageError> {
    let id = table.tasks[caller].save().as_task_args();
    let index = table.check_thread_id(id)?;
    table.resume(index);
    Ok(0)
}

fn cancel(table: &mut TaskTable<'_>, caller: usize) -> Result<u32, UsageError> {
    let id = table.tasks[caller].save().as_task_args();
    let index = table.check_thread_id(id)?;
    table.cancel(index)?;
    Ok(0)
}

/// Returns 1 if the caller was cancelled (in which case nobody reads it).
fn check_cancel(
    table: &mut TaskTable<'_>,
    caller: usize,
) -> Result<u32, UsageError> {
    Ok(table.check_cancellation_point(caller)?.into())
}

fn exit(table: &mut TaskTable<'_>, caller: usize) -> Result<u32, UsageError> {
    not_scheduler(caller)?;
    table.reclaim(caller)?;
    Ok(0)
}

/// Clears the fault record and reclaims whatever the fault isolated. Returns
/// how many tasks were reclaimed.
fn fault_logged(table: &mut TaskTable<'_>) -> Result<u32, UsageError> {
    FAULT_RECORD.acknowledge();
    Ok(table.reclaim_faulted() as u32)
}

/// Packs the caller's ID into the low half and its effective priority into
/// the high half.
fn get_current(
    table: &mut TaskTable<'_>,
    caller: usize,
) -> Result<u32, UsageError> {
    let task = &table.tasks[caller];
    Ok(u32::from(task.id().0) | task.priority().to_word() << 16)
}
