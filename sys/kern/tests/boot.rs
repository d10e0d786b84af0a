// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boots a kernel on the host backend and runs tasks through the trap
//! interface.
//!
//! The kernel is global, so everything happens in one test.

mod common;

use kern::arch;
use kern::mailbox;
use kern::startup::{self, KERNEL};
use userlib::*;

static TRAPS: TrapVector = TrapVector { trap: arch::trap };

const B: BlockObject = BlockObject(0x2000_0400);

#[test]
fn boot_block_wake_and_exit() {
    let mut board = common::Board::default();
    let mut table = common::table(8, &board);
    let first = startup::bootstrap(&mut table, &mut board).unwrap();
    assert_eq!(
        board.notifications,
        [
            (KernelEvent::DebugInitialized, 0),
            (KernelEvent::TaskInitialized, u32::from(first.0)),
        ]
    );
    KERNEL.install(table);
    configure_trap_vector(&TRAPS);

    // The scheduler task's first trap hands over to the new task.
    assert_eq!(sys_current_task_id(), TaskId::SCHEDULER);
    assert_eq!(arch::current_task(), first.index());
    assert_eq!(sys_current_task_id(), first);
    assert_eq!(sys_current_priority(), Priority(21));
    assert_eq!(sys_exec_count(), 1);

    // A bounded block gives the processor back to the scheduler task until
    // the timeout.
    let start = arch::now();
    assert_eq!(sys_block(B, Some(3)), Ok(WakeReason::None));
    assert_eq!(arch::current_task(), 0);
    assert_eq!(sys_exec_count(), 0);
    arch::tick();
    arch::tick();
    assert_eq!(arch::current_task(), 0);
    assert_eq!(arch::tick(), start.after(3));
    assert_eq!(arch::current_task(), first.index());
    let reason = KERNEL.with(|t| t.task(first.index()).unwrap().wake_reason());
    assert_eq!(reason, WakeReason::Timeout);

    // Interrupt context releases a waiter through the mailbox.
    assert_eq!(sys_block(B, None), Ok(WakeReason::None));
    assert_eq!(arch::current_task(), 0);
    mailbox::request_unblock_all(B, WakeReason::Transfer).unwrap();
    assert_eq!(arch::current_task(), 0);
    assert_eq!(arch::switch_context(), first.index());
    let reason = KERNEL.with(|t| t.task(first.index()).unwrap().wake_reason());
    assert_eq!(reason, WakeReason::Transfer);

    // Contract violations come back as errors and change nothing.
    assert_eq!(
        sys_set_priority(first, Priority(40)),
        Err(UsageError::PriorityOutOfRange)
    );
    assert_eq!(sys_stop(TaskId(7)), Err(UsageError::TaskDisabled));
    assert_eq!(sys_current_task_id(), first);

    // Exiting frees the slot and leaves the scheduler task alone.
    assert_eq!(sys_exit(), Ok(()));
    assert_eq!(arch::current_task(), 0);
    assert!(KERNEL.with(|t| !t.task(first.index()).unwrap().is_enabled()));
    assert_eq!(sys_exit(), Err(UsageError::SchedulerTask));
}
