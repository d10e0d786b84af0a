// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host backend, for running the kernel's logic in tests and simulation.
//!
//! There is no privilege boundary here. "Tasks" are whatever code calls
//! `trap`, which runs the dispatcher on behalf of the current task exactly as
//! the SVCall handler would. Time only moves when `tick` is called.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::fault::FAULT_RECORD;
use crate::mailbox::MAILBOX;
use crate::startup::{with_task_table, DirectGate, KERNEL};
use crate::task::{self, Task};
use crate::time::Timestamp;

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// Registers as a trap sees them: a number, four arguments in, two results
/// out.
#[derive(Default, Debug)]
pub struct SavedState {
    nr: u32,
    args: [u32; 4],
    rets: [u32; 2],
    pc: u32,
    sp: u32,
}

impl task::ArchState for SavedState {
    fn stack_pointer(&self) -> u32 {
        self.sp
    }

    fn arg0(&self) -> u32 {
        self.args[0]
    }
    fn arg1(&self) -> u32 {
        self.args[1]
    }
    fn arg2(&self) -> u32 {
        self.args[2]
    }
    fn arg3(&self) -> u32 {
        self.args[3]
    }

    fn syscall_descriptor(&self) -> u32 {
        self.nr
    }

    fn ret0(&mut self, x: u32) {
        self.rets[0] = x
    }
    fn ret1(&mut self, x: u32) {
        self.rets[1] = x
    }
}

impl SavedState {
    /// Loads the registers a task would set up before trapping.
    pub fn set_trap(&mut self, nr: u32, args: [u32; 4]) {
        self.nr = nr;
        self.args = args;
    }

    /// Both result registers.
    pub fn rets(&self) -> [u32; 2] {
        self.rets
    }

    /// Where the task will start.
    pub fn pc(&self) -> u32 {
        self.pc
    }
}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}

/// Puts a task's registers into their initial state: at its entry point,
/// with its argument, at the top of its stack.
pub fn reinitialize(task: &mut Task) {
    let entry = task.entry();
    let sp = task.region().end_addr() & !0x7;
    *task.save_mut() = SavedState {
        pc: entry.pc,
        sp,
        args: [entry.arg, 0, 0, 0],
        ..SavedState::default()
    };
}

static CURRENT_TASK: AtomicUsize = AtomicUsize::new(0);

/// Records the task that will run next.
///
/// # Safety
///
/// Nothing unsafe happens here; the signature matches the hardware backends.
pub unsafe fn set_current_task(task: &Task) {
    CURRENT_TASK.store(task.id().index(), Ordering::Relaxed);
}

/// Index of the task most recently handed to `set_current_task`.
pub fn current_task() -> usize {
    CURRENT_TASK.load(Ordering::Relaxed)
}

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn now() -> Timestamp {
    Timestamp::from(TICKS.load(Ordering::Relaxed))
}

static PENDED_SWITCHES: AtomicU32 = AtomicU32::new(0);

/// Counts the request; the switch itself happens at the next `trap`, `tick`
/// or `switch_context`.
pub fn pend_context_switch() {
    PENDED_SWITCHES.fetch_add(1, Ordering::Relaxed);
}

/// How many times a context switch has been pended.
pub fn pended_switches() -> u32 {
    PENDED_SWITCHES.load(Ordering::Relaxed)
}

/// Traps into the kernel as the current task, returning its result
/// registers.
pub fn trap(nr: u32, args: [u32; 4]) -> [u32; 2] {
    let (index, task) = with_task_table(|t| {
        let index = t.current();
        let task = &mut t.tasks[index];
        task.save_mut().set_trap(nr, args);
        (index, task as *mut Task)
    });
    // Safety: `task` came from the installed table.
    unsafe { crate::syscalls::syscall_entry(nr, task) };
    with_task_table(|t| t.tasks[index].save().rets())
}

/// Advances the clock one tick and does the timer interrupt's work,
/// including any context switch it asks for.
pub fn tick() -> Timestamp {
    crate::profiling::event_timer_isr_enter();
    let now = Timestamp::from(TICKS.fetch_add(1, Ordering::Relaxed) + 1);
    with_task_table(|t| {
        MAILBOX.drain(t);
        t.tick(now);
        finish_switch(t);
    });
    crate::profiling::event_timer_isr_exit();
    now
}

/// Does the deferred context switch's work: applies queued requests and
/// switches if anything asked to.
pub fn switch_context() -> usize {
    with_task_table(|t| {
        MAILBOX.drain(t);
        finish_switch(t)
    })
}

fn finish_switch(t: &mut crate::task::TaskTable<'_>) -> usize {
    let next = t.reschedule();
    // Safety: see set_current_task.
    unsafe { set_current_task(&t.tasks[next]) };
    next
}

/// There's no userland to enter on a host.
///
/// # Safety
///
/// Always safe; it just panics.
pub unsafe fn start_first_task(_tick_divisor: u32) -> ! {
    panic!("entering userland");
}

/// The scheduler task shares our address space, so it can call straight in.
pub fn scheduler_gate() -> DirectGate<'static> {
    DirectGate {
        kernel: &KERNEL,
        faults: &FAULT_RECORD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ArchState;
    use crate::task::EntryPoint;
    use abi::RegionDesc;

    #[test]
    fn reinitialize_starts_at_entry_with_aligned_stack() {
        let mut task = Task::vacant(1);
        let mut t = crate::task::tests::table(2);
        let id = t
            .create(
                EntryPoint {
                    pc: 0x0800_0201,
                    arg: 77,
                },
                RegionDesc {
                    base: 0x2000_0000,
                    size: 0x3fd,
                },
                &crate::task::tests::attrs(4),
            )
            .unwrap();
        let save = t.task(id.index()).unwrap().save();
        assert_eq!(save.pc(), 0x0800_0201);
        assert_eq!(save.arg0(), 77);
        assert_eq!(save.stack_pointer(), 0x2000_03f8);

        reinitialize(&mut task);
        assert_eq!(task.save().stack_pointer(), 0);
    }
}
