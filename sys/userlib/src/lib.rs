// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User application support library for Ember.
//!
//! This contains trap stubs and types, and re-exports the contents of the
//! `abi` crate that gets shared with the kernel.
//!
//! # Trap stub implementation
//!
//! Every trap goes through one stub. The trap number travels in `r11` and up
//! to four arguments in `r4`-`r7`; the kernel answers in `r4` (a response
//! code) and `r5` (a value). Those registers are awkward to name from `asm!`,
//! so the stub is plain assembly that takes the number and a pointer to the
//! argument words, and writes the two results back over the first two.
//!
//! On a host build there is no kernel to trap into. Instead a test harness
//! installs a `TrapVector` that gets the same number and arguments.

#![cfg_attr(target_os = "none", no_std)]

pub use abi::*;

use core::convert::TryFrom;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        core::arch::global_asm! {"
            .section .text.ember_trap
            .globl ember_trap
            .type ember_trap,function
            .thumb_func
            ember_trap:
                @ Spill the registers we're about to use to pass stuff. The
                @ pop sequence at the end needs to match!
                push {{r4-r7, r11, lr}}

                @ Trap number, then argument words, into place.
                mov r11, r0
                mov r12, r1
                ldm r12, {{r4-r7}}

                @ To the kernel! r12 is part of the exception frame, so it
                @ survives.
                svc #0

                @ Results over the first two argument words.
                stm r12, {{r4, r5}}

                @ Restore the registers we used and return.
                pop {{r4-r7, r11, pc}}
            ",
        }

        extern "C" {
            fn ember_trap(nr: u32, regs: *mut [u32; 4]);
        }

        fn trap(nr: Sysnum, args: [u32; 4]) -> [u32; 2] {
            let mut regs = args;
            // Safety: the stub only touches `regs` and registers it restores.
            unsafe { ember_trap(nr as u32, &mut regs) };
            [regs[0], regs[1]]
        }
    } else {
        use core::sync::atomic::{AtomicPtr, Ordering};

        /// Stand-in for the kernel on a host build.
        pub struct TrapVector {
            /// Handles trap `nr` with `args`, returning the result registers.
            pub trap: fn(nr: u32, args: [u32; 4]) -> [u32; 2],
        }

        /// Null until `configure_trap_vector` is called. Any non-null value
        /// came from a `&'static`.
        static TRAP_VECTOR: AtomicPtr<TrapVector> =
            AtomicPtr::new(core::ptr::null_mut());

        /// Routes this process's traps to `vector`.
        pub fn configure_trap_vector(vector: &'static TrapVector) {
            TRAP_VECTOR.store(vector as *const _ as *mut _, Ordering::Relaxed);
        }

        fn trap(nr: Sysnum, args: [u32; 4]) -> [u32; 2] {
            let p = TRAP_VECTOR.load(Ordering::Relaxed);
            if p.is_null() {
                panic!("trap {nr:?} with no trap vector configured");
            }
            // Safety: only ever written from a valid `&'static TrapVector`.
            let vector = unsafe { &*p };
            (vector.trap)(nr as u32, args)
        }
    }
}

/// Splits a trap's result registers into the value or the error.
fn response(rets: [u32; 2]) -> Result<u32, UsageError> {
    if rets[0] == SUCCESS {
        Ok(rets[1])
    } else {
        // Codes we don't know can only come from a newer kernel; the closest
        // meaning is that we asked for something it doesn't do.
        Err(UsageError::try_from(rets[0])
            .unwrap_or(UsageError::BadSyscallNumber))
    }
}

fn wake_reason(word: u32) -> WakeReason {
    WakeReason::try_from(word).unwrap_or(WakeReason::None)
}

/// Gives up the processor to an equal-priority peer, if there is one.
pub fn sys_yield() {
    trap(Sysnum::Yield, [0; 4]);
}

/// Sleeps for `ticks` kernel ticks. Returns why the task was woken, which is
/// normally `WakeReason::Sleep`.
pub fn sys_sleep(ticks: u32) -> Result<WakeReason, UsageError> {
    response(trap(Sysnum::Sleep, [ticks, 0, 0, 0])).map(wake_reason)
}

/// Waits on `object` until somebody releases it, or for at most `timeout`
/// ticks.
pub fn sys_block(
    object: BlockObject,
    timeout: Option<u32>,
) -> Result<WakeReason, UsageError> {
    let args = [object.0 as u32, timeout.unwrap_or(0), 0, 0];
    response(trap(Sysnum::Block, args)).map(wake_reason)
}

/// Waits for `task` to exit. Detached tasks can't be joined.
pub fn sys_join(task: TaskId) -> Result<WakeReason, UsageError> {
    sys_block(BlockObject::for_task(task), None)
}

/// Makes `task` ready at `priority` (or above, if it's already higher).
pub fn sys_wake(task: TaskId, priority: Priority) -> Result<(), UsageError> {
    let args = [u32::from(task.0), priority.to_word(), 0, 0];
    response(trap(Sysnum::Wake, args)).map(drop)
}

/// Releases everything waiting on `object`. Returns the most urgent priority
/// released, if any waiter could run.
pub fn sys_unblock_all(
    object: BlockObject,
    reason: WakeReason,
) -> Result<Option<Priority>, UsageError> {
    let args = [object.0 as u32, reason as u32, 0, 0];
    response(trap(Sysnum::UnblockAll, args)).map(decode_priority)
}

/// Hands `object` to its most urgent waiter. Returns who got it.
pub fn sys_grant(object: BlockObject) -> Result<Option<TaskId>, UsageError> {
    let args = [object.0 as u32, 0, 0, 0];
    response(trap(Sysnum::Grant, args)).map(decode_task)
}

/// Changes the priority `task` asked for.
pub fn sys_set_priority(
    task: TaskId,
    priority: Priority,
) -> Result<(), UsageError> {
    let args = [u32::from(task.0), priority.to_word(), 0, 0];
    response(trap(Sysnum::SetPriority, args)).map(drop)
}

/// Drops `task` back to the priority it asked for, undoing any boost.
pub fn sys_restore_priority(task: TaskId) -> Result<(), UsageError> {
    task_trap(Sysnum::RestorePriority, task)
}

/// Keeps `task` off the processor until `sys_resume`.
pub fn sys_stop(task: TaskId) -> Result<(), UsageError> {
    task_trap(Sysnum::Stop, task)
}

pub fn sys_resume(task: TaskId) -> Result<(), UsageError> {
    task_trap(Sysnum::Resume, task)
}

/// Asks `task` to end at its next cancellation point.
pub fn sys_cancel(task: TaskId) -> Result<(), UsageError> {
    task_trap(Sysnum::Cancel, task)
}

fn task_trap(nr: Sysnum, task: TaskId) -> Result<(), UsageError> {
    response(trap(nr, [u32::from(task.0), 0, 0, 0])).map(drop)
}

/// Cancellation point. If cancellation is pending this task is reclaimed
/// and, on hardware, the call doesn't return.
pub fn sys_check_cancellation() -> Result<bool, UsageError> {
    response(trap(Sysnum::CheckCancel, [0; 4])).map(|v| v != 0)
}

/// Ends the calling task, releasing anyone joining it. On hardware a
/// successful exit doesn't return; the scheduler task gets an error.
pub fn sys_exit() -> Result<(), UsageError> {
    response(trap(Sysnum::Exit, [0; 4])).map(drop)
}

/// Tells the kernel the pending fault record has been reported.
pub fn sys_fault_logged() {
    trap(Sysnum::FaultLogged, [0; 4]);
}

/// Number of tasks at the current priority that are ready to run.
pub fn sys_exec_count() -> usize {
    trap(Sysnum::ExecCount, [0; 4])[1] as usize
}

fn get_current() -> (TaskId, Priority) {
    let word = trap(Sysnum::GetCurrent, [0; 4])[1];
    (
        TaskId(word as u16),
        Priority::from_word((word >> 16) & 0xFF).unwrap_or_default(),
    )
}

/// The calling task's ID.
pub fn sys_current_task_id() -> TaskId {
    get_current().0
}

/// The calling task's effective priority.
pub fn sys_current_priority() -> Priority {
    get_current().1
}
