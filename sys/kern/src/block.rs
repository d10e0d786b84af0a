// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting on block objects.
//!
//! A block object is a handle the kernel only compares. Tasks wait on one by
//! recording it and going inactive; whoever releases the object either hands
//! it to one waiter (`grant`) or lets them all go (`unblock_all`).
//!
//! The two releases scan differently. Single handoff starts just after the
//! current task and wraps, so that as the current task moves, so does which
//! of several equal waiters wins, and nobody waits forever. Broadcast goes in
//! plain index order since everyone is released anyway.

use abi::{BlockObject, Priority, WakeReason};

use crate::klog::KernEvent;
use crate::task::{priority_scan, TaskTable};
use crate::time::Timestamp;

impl TaskTable<'_> {
    /// Makes a task wait on `object`, optionally giving up at `deadline`.
    pub fn block(
        &mut self,
        index: usize,
        object: BlockObject,
        deadline: Option<Timestamp>,
    ) {
        self.tasks[index].deactivate(Some(object), deadline);
        klog!(KernEvent::Blocked {
            index: index as u16,
            object
        });
        self.recompute_current_priority();
    }

    /// Makes a task active, recording why. Its block object and deadline, if
    /// any, are dropped.
    ///
    /// This does not touch the current priority; the caller decides whether
    /// the released task raises it.
    pub fn assert_active(&mut self, index: usize, reason: WakeReason) {
        self.tasks[index].activate(reason);
    }

    /// Finds the waiter on `object` that should receive it next: the most
    /// urgent non-stopped waiter, ties going to whichever comes first after
    /// the current task.
    pub fn find_highest_priority_waiter(
        &self,
        object: BlockObject,
    ) -> Option<usize> {
        priority_scan(self.current, 1, self.tasks, |t| {
            t.is_waiting_on(object) && !t.is_stopped()
        })
    }

    /// Releases every waiter on `object` with `reason`.
    ///
    /// Returns the most urgent priority released, not counting stopped tasks
    /// (which are released but can't run), or `None` if nothing that can run
    /// was released. Pass the result to `wake`.
    pub fn unblock_all(
        &mut self,
        object: BlockObject,
        reason: WakeReason,
    ) -> Option<Priority> {
        let mut highest: Option<Priority> = None;
        let mut count = 0u16;
        for index in 1..self.tasks.len() {
            let t = &self.tasks[index];
            if !t.is_waiting_on(object) {
                continue;
            }
            let counts = !t.is_stopped();
            let p = t.priority();
            self.assert_active(index, reason);
            count = count.wrapping_add(1);
            if counts {
                highest = Some(highest.map_or(p, |h| h.max(p)));
            }
        }
        if count != 0 {
            klog!(KernEvent::Unblocked { object, count });
        }
        highest
    }

    /// Hands `object` to a single waiter, making it active with
    /// `WakeReason::Granted`. Returns the waiter, if there was one.
    pub fn grant(&mut self, object: BlockObject) -> Option<usize> {
        let index = self.find_highest_priority_waiter(object)?;
        self.assert_active(index, WakeReason::Granted);
        klog!(KernEvent::Granted(index as u16));
        let p = self.tasks[index].priority();
        self.wake(Some(index), p);
        Some(index)
    }
}
