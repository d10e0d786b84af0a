// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority and readiness.
//!
//! The kernel keeps one register, the current priority, equal to the most
//! urgent effective priority among tasks that demand the processor (enabled,
//! active, not stopped), not counting the scheduler task. When nothing
//! qualifies it sits at the configured floor.
//!
//! Keeping it right is asymmetric. Anything that can only *lower* the
//! ceiling (a task blocks, sleeps, stops, or drops priority) calls
//! `recompute_current_priority`, which rescans the table. Anything that can
//! only *raise* it goes through `wake`, which needs no scan. Either way the
//! actual switch is deferred: we request one and the arch layer performs it
//! on the way out of the kernel.

use abi::{Priority, SchedPolicy, UsageError, WakeReason};

use crate::klog::KernEvent;
use crate::task::{TaskFlags, TaskTable};
use crate::time::Timestamp;

impl TaskTable<'_> {
    /// Rescans the table and resets the current priority register, then
    /// requests a context switch.
    pub fn recompute_current_priority(&mut self) {
        let floor = self.config.lowest_priority;
        let p = self.tasks[1..]
            .iter()
            .filter(|t| t.is_ready())
            .fold(floor, |acc, t| acc.max(t.priority()));
        self.current_priority = p;
        klog!(KernEvent::CurrentPriority(p));
        self.request_context_switch();
    }

    /// Raises the ceiling to `p`, and `target`'s effective priority with it.
    ///
    /// Does nothing unless `p` is more urgent than the current priority. A
    /// named target that doesn't demand the processor (vacant, inactive, or
    /// stopped) is ignored entirely. With no target the register alone is
    /// raised; that's the broadcast path, where the caller has just made
    /// tasks of priority `p` active.
    ///
    /// Returns whether anything changed.
    pub fn wake(&mut self, target: Option<usize>, p: Priority) -> bool {
        if !p.is_more_urgent_than(self.current_priority) {
            return false;
        }
        if let Some(index) = target {
            // The scheduler task's priority isn't part of the ceiling.
            if index == 0 {
                return false;
            }
            let Some(task) = self.tasks.get_mut(index) else {
                return false;
            };
            if !task.is_ready() {
                return false;
            }
            task.set_priority(task.priority().max(p));
            klog!(KernEvent::Woke {
                index: index as u16,
                priority: p
            });
        }
        self.current_priority = p;
        self.request_context_switch();
        true
    }

    /// Puts a task to sleep until `deadline`.
    pub fn sleep(&mut self, index: usize, deadline: Timestamp) {
        self.tasks[index].deactivate(None, Some(deadline));
        klog!(KernEvent::Slept(index as u16));
        self.recompute_current_priority();
    }

    /// Sets both the base and effective priority of a task.
    pub fn set_priority(
        &mut self,
        index: usize,
        p: Priority,
    ) -> Result<(), UsageError> {
        self.config.check_priority(p)?;
        let task = &mut self.tasks[index];
        let raising = p.is_more_urgent_than(task.priority());
        task.set_base_priority(p);
        task.set_priority(p);
        if raising {
            self.wake(Some(index), p);
        } else {
            self.recompute_current_priority();
        }
        Ok(())
    }

    /// Drops an elevated effective priority back to the base priority.
    pub fn restore_priority(&mut self, index: usize) {
        let task = &mut self.tasks[index];
        let base = task.base_priority();
        if task.priority() == base {
            return;
        }
        task.set_priority(base);
        self.recompute_current_priority();
    }

    /// Suspends a task independently of whether it is active.
    pub fn stop(&mut self, index: usize) {
        self.tasks[index].flags_mut().insert(TaskFlags::STOPPED);
        klog!(KernEvent::Stopped(index as u16));
        self.recompute_current_priority();
    }

    /// Lifts a stop. If the task was otherwise runnable it competes again
    /// at its own priority.
    pub fn resume(&mut self, index: usize) {
        let task = &mut self.tasks[index];
        task.flags_mut().remove(TaskFlags::STOPPED);
        let p = task.priority();
        klog!(KernEvent::Resumed(index as u16));
        self.wake(Some(index), p);
    }

    /// Picks the task to run after `previous`.
    ///
    /// The scheduler task takes part in the round robin at every priority,
    /// sitting after the last slot: the next ready task at the current
    /// priority is chosen from the slots after `previous`, and if the scan
    /// would wrap, the scheduler task gets a turn instead. So its main loop
    /// runs at least once per round even when some task never blocks.
    pub fn select(&self, previous: usize) -> usize {
        let ceiling = self.current_priority;
        self.tasks
            .iter()
            .enumerate()
            .skip(previous + 1)
            .find(|(_, t)| t.is_ready() && t.priority() == ceiling)
            .map_or(0, |(i, _)| i)
    }

    /// Number of tasks demanding the processor at the current priority. When
    /// this is zero the scheduler task idles.
    pub fn exec_count(&self) -> usize {
        let ceiling = self.current_priority;
        self.tasks[1..]
            .iter()
            .filter(|t| t.is_ready() && t.priority() == ceiling)
            .count()
    }

    /// Timer processing for the tick ending at `now`.
    ///
    /// Tasks whose deadline has passed are activated: sleepers with
    /// `WakeReason::Sleep`, bounded blocks with `WakeReason::Timeout`. Then
    /// the current task's round-robin quantum is charged.
    pub fn tick(&mut self, now: Timestamp) {
        let mut released: Option<Priority> = None;
        for index in 1..self.tasks.len() {
            let t = &self.tasks[index];
            let expired = t.is_enabled()
                && !t.is_active()
                && !t.flags().contains(TaskFlags::FAULTED)
                && t.deadline().is_some_and(|d| d <= now);
            if !expired {
                continue;
            }
            let reason = if t.block_object().is_some() {
                WakeReason::Timeout
            } else {
                WakeReason::Sleep
            };
            let counts = !t.is_stopped();
            let p = t.priority();
            self.assert_active(index, reason);
            if counts {
                released = Some(released.map_or(p, |r| r.max(p)));
            }
        }
        if let Some(p) = released {
            self.wake(None, p);
        }

        self.charge_quantum();
    }

    fn charge_quantum(&mut self) {
        let current = self.current;
        if current == 0 {
            return;
        }
        let limit = self.config.rr_quantum;
        let task = &mut self.tasks[current];
        if !task.is_ready() || task.policy() != SchedPolicy::RoundRobin {
            return;
        }
        let used = task.quantum().saturating_add(1);
        if used < limit {
            task.set_quantum(used);
            return;
        }
        // The scheduler task is always a peer, so the quantum running out
        // always moves the round robin along.
        task.set_quantum(0);
        self.request_context_switch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::{attrs, spawn, stack, table};
    use crate::task::EntryPoint;
    use abi::{BlockObject, TaskAttributes};
    use proptest::prelude::*;

    /// The quantity the register is supposed to track.
    fn expected_priority(t: &TaskTable<'_>) -> Priority {
        t.tasks()[1..]
            .iter()
            .filter(|t| t.is_ready())
            .fold(t.config().lowest_priority, |acc, t| acc.max(t.priority()))
    }

    #[test]
    fn empty_table_sits_at_floor() {
        let mut t = table(4);
        t.recompute_current_priority();
        assert_eq!(t.current_priority(), t.config().lowest_priority);
        assert_eq!(t.exec_count(), 0);
        assert_eq!(t.select(0), 0);
    }

    #[test]
    fn wake_at_or_below_ceiling_changes_nothing() {
        let mut t = table(4);
        let i = spawn(&mut t, 10);
        t.take_switch_request();

        assert!(!t.wake(Some(i), Priority(10)));
        assert!(!t.wake(None, Priority(3)));
        assert_eq!(t.current_priority(), Priority(10));
        assert_eq!(t.task(i).unwrap().priority(), Priority(10));
        assert!(!t.switch_pending());
    }

    #[test]
    fn wake_raises_but_never_lowers() {
        let mut t = table(4);
        let low = spawn(&mut t, 3);
        let high = spawn(&mut t, 12);
        t.take_switch_request();

        assert!(t.wake(Some(low), Priority(15)));
        assert_eq!(t.task(low).unwrap().priority(), Priority(15));
        assert_eq!(t.task(low).unwrap().base_priority(), Priority(3));
        assert_eq!(t.current_priority(), Priority(15));
        assert!(t.switch_pending());
        assert_eq!(t.task(high).unwrap().priority(), Priority(12));
    }

    #[test]
    fn wake_ignores_stopped_target() {
        let mut t = table(4);
        let i = spawn(&mut t, 3);
        t.block(i, BlockObject(0x2000_0040), None);
        t.stop(i);
        let active_before = t.task(i).unwrap().is_active();

        assert!(!t.wake(Some(i), Priority(20)));
        assert_eq!(t.task(i).unwrap().is_active(), active_before);
        assert_eq!(t.task(i).unwrap().priority(), Priority(3));
        assert_eq!(t.current_priority(), t.config().lowest_priority);
    }

    #[test]
    fn wake_ignores_active_but_stopped_target() {
        let mut t = table(4);
        let i = spawn(&mut t, 3);
        t.stop(i);
        assert!(t.task(i).unwrap().is_active());
        t.take_switch_request();

        assert!(!t.wake(Some(i), Priority(20)));
        let task = t.task(i).unwrap();
        assert!(task.is_active());
        assert!(task.is_stopped());
        assert_eq!(task.priority(), Priority(3));
        assert_eq!(t.current_priority(), t.config().lowest_priority);
        assert!(!t.switch_pending());
    }

    #[test]
    fn stop_and_resume_move_the_ceiling() {
        let mut t = table(4);
        let low = spawn(&mut t, 3);
        let high = spawn(&mut t, 9);
        t.stop(high);
        assert_eq!(t.current_priority(), Priority(3));
        assert_eq!(t.select(0), low);
        t.resume(high);
        assert_eq!(t.current_priority(), Priority(9));
        assert_eq!(t.select(0), high);
    }

    #[test]
    fn priority_changes_recompute_or_wake() {
        let mut t = table(4);
        let a = spawn(&mut t, 4);
        let b = spawn(&mut t, 6);

        t.set_priority(a, Priority(8)).unwrap();
        assert_eq!(t.current_priority(), Priority(8));
        t.set_priority(a, Priority(1)).unwrap();
        assert_eq!(t.current_priority(), Priority(6));
        assert_eq!(
            t.set_priority(b, Priority(-1)),
            Err(UsageError::PriorityOutOfRange)
        );
        assert_eq!(t.task(b).unwrap().priority(), Priority(6));

        // An elevation by wake drops back on restore.
        t.wake(Some(a), Priority(20));
        assert_eq!(t.current_priority(), Priority(20));
        t.restore_priority(a);
        assert_eq!(t.task(a).unwrap().priority(), Priority(1));
        assert_eq!(t.current_priority(), Priority(6));
    }

    #[test]
    fn select_round_robins_among_equals() {
        let mut t = table(5);
        let a = spawn(&mut t, 5);
        let b = spawn(&mut t, 5);
        let c = spawn(&mut t, 2);
        assert_eq!(t.select(0), a);
        assert_eq!(t.select(a), b);
        // The scheduler task's turn comes at the end of each round.
        assert_eq!(t.select(b), 0);
        assert_ne!(t.select(a), c);
        assert_eq!(t.exec_count(), 2);
    }

    #[test]
    fn scheduler_turn_comes_when_scan_wraps() {
        let mut t = table(5);
        let a = spawn(&mut t, 5);
        let b = spawn(&mut t, 9);
        let c = spawn(&mut t, 9);
        assert_eq!(t.select(0), b);
        assert_eq!(t.select(b), c);
        assert_eq!(t.select(c), 0);
        assert_eq!(t.select(a), b);
    }

    #[test]
    fn sleep_expires_on_tick() {
        let mut t = table(4);
        let i = spawn(&mut t, 5);
        t.sleep(i, Timestamp::from(10));
        assert!(!t.task(i).unwrap().is_active());
        assert_eq!(t.current_priority(), t.config().lowest_priority);

        t.tick(Timestamp::from(9));
        assert!(!t.task(i).unwrap().is_active());
        t.tick(Timestamp::from(10));
        let task = t.task(i).unwrap();
        assert!(task.is_active());
        assert_eq!(task.wake_reason(), WakeReason::Sleep);
        assert_eq!(task.deadline(), None);
        assert_eq!(t.current_priority(), Priority(5));
    }

    #[test]
    fn bounded_block_times_out() {
        let mut t = table(4);
        let i = spawn(&mut t, 5);
        t.block(i, BlockObject(0x2000_0080), Some(Timestamp::from(3)));
        t.tick(Timestamp::from(3));
        let task = t.task(i).unwrap();
        assert!(task.is_active());
        assert_eq!(task.wake_reason(), WakeReason::Timeout);
        assert_eq!(task.block_object(), None);
    }

    #[test]
    fn quantum_expiry_rotates_through_the_scheduler_task() {
        let mut t = table(4);
        let a = spawn(&mut t, 5);
        t.reschedule();
        assert_eq!(t.current(), a);

        let quantum = t.config().rr_quantum;
        for n in 1..quantum {
            t.tick(Timestamp::from(u64::from(n)));
        }
        assert!(!t.switch_pending());
        // Even alone at its priority, the task gives the scheduler task a
        // turn when its quantum runs out.
        t.tick(Timestamp::from(u64::from(quantum)));
        assert!(t.switch_pending());
        assert_eq!(t.reschedule(), 0);
        assert_eq!(t.task(a).unwrap().quantum(), 0);

        let b = spawn(&mut t, 5);
        t.request_context_switch();
        assert_eq!(t.reschedule(), a);
        for n in 0..quantum {
            t.tick(Timestamp::from(u64::from(n)));
        }
        assert_eq!(t.reschedule(), b);
    }

    #[test]
    fn fifo_task_keeps_the_processor() {
        let mut t = table(4);
        let attr = TaskAttributes {
            policy: SchedPolicy::Fifo,
            ..attrs(5)
        };
        let entry = EntryPoint { pc: 0x0800_0101, arg: 0 };
        let a = t.create(entry, stack(1), &attr).unwrap().index();
        assert_eq!(t.reschedule(), a);
        for n in 0..t.config().rr_quantum * 3 {
            t.tick(Timestamp::from(u64::from(n)));
        }
        assert!(!t.switch_pending());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Create(i8),
        Block(usize, usize),
        Sleep(usize, u8),
        UnblockAll(usize),
        Grant(usize),
        Wake(usize, i8),
        Stop(usize),
        Resume(usize),
        SetPriority(usize, i8),
        Restore(usize),
        Reclaim(usize),
        Tick(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        let idx = 1usize..6;
        let obj = 0usize..3;
        let prio = 0i8..=31;
        prop_oneof![
            prio.clone().prop_map(Op::Create),
            (idx.clone(), obj.clone()).prop_map(|(i, o)| Op::Block(i, o)),
            (idx.clone(), any::<u8>()).prop_map(|(i, d)| Op::Sleep(i, d)),
            obj.clone().prop_map(Op::UnblockAll),
            obj.prop_map(Op::Grant),
            (idx.clone(), prio.clone()).prop_map(|(i, p)| Op::Wake(i, p)),
            idx.clone().prop_map(Op::Stop),
            idx.clone().prop_map(Op::Resume),
            (idx.clone(), prio).prop_map(|(i, p)| Op::SetPriority(i, p)),
            idx.clone().prop_map(Op::Restore),
            idx.prop_map(Op::Reclaim),
            any::<u8>().prop_map(Op::Tick),
        ]
    }

    fn ready(t: &TaskTable<'_>, i: usize) -> bool {
        t.task(i).is_some_and(|task| task.is_ready())
    }

    fn enabled(t: &TaskTable<'_>, i: usize) -> bool {
        t.task(i).is_some_and(|task| task.is_enabled())
    }

    fn apply(t: &mut TaskTable<'_>, now: &mut u64, op: Op) {
        let objects = [
            BlockObject(0x2000_0000),
            BlockObject(0x2000_0010),
            BlockObject(0x2000_0020),
        ];
        match op {
            Op::Create(p) => {
                if t.tasks().iter().skip(1).any(|task| !task.is_enabled()) {
                    spawn(t, p);
                }
            }
            // Only a running task can block or sleep itself.
            Op::Block(i, o) if ready(t, i) => t.block(i, objects[o], None),
            Op::Sleep(i, d) if ready(t, i) => {
                t.sleep(i, Timestamp::from(*now).after(u32::from(d)))
            }
            Op::UnblockAll(o) => {
                if let Some(p) =
                    t.unblock_all(objects[o], WakeReason::Semaphore)
                {
                    t.wake(None, p);
                }
            }
            Op::Grant(o) => {
                t.grant(objects[o]);
            }
            Op::Wake(i, p) => {
                t.wake(Some(i), Priority(p));
            }
            Op::Stop(i) if enabled(t, i) => t.stop(i),
            Op::Resume(i) if enabled(t, i) => t.resume(i),
            Op::SetPriority(i, p) if enabled(t, i) => {
                t.set_priority(i, Priority(p)).unwrap();
            }
            Op::Restore(i) if enabled(t, i) => t.restore_priority(i),
            Op::Reclaim(i) => {
                t.reclaim(i).ok();
            }
            Op::Tick(n) => {
                *now += u64::from(n);
                t.tick(Timestamp::from(*now));
            }
            _ => (),
        }
    }

    proptest! {
        #[test]
        fn current_priority_tracks_most_urgent_ready_task(
            ops in proptest::collection::vec(op(), 0..64),
        ) {
            let mut t = table(6);
            let mut now = 0;
            for op in ops {
                apply(&mut t, &mut now, op);
                prop_assert_eq!(t.current_priority(), expected_priority(&t));
                for task in t.tasks() {
                    // Active tasks never sit on a block object.
                    prop_assert!(
                        !(task.is_active() && task.block_object().is_some())
                    );
                    let base = task.base_priority();
                    prop_assert!(!base.is_more_urgent_than(task.priority()));
                }
                prop_assert!(t.task(0).unwrap().is_enabled());
            }
        }

        #[test]
        fn wake_at_or_below_ceiling_is_inert(
            ops in proptest::collection::vec(op(), 0..32),
            target in 1usize..6,
            below in 0i8..=31,
        ) {
            let mut t = table(6);
            let mut now = 0;
            for op in ops {
                apply(&mut t, &mut now, op);
            }
            let ceiling = t.current_priority();
            let p = Priority(below.min(ceiling.0));
            t.take_switch_request();
            let before = t.task(target).map(|task| task.priority());

            prop_assert!(!t.wake(Some(target), p));
            prop_assert_eq!(t.current_priority(), ceiling);
            prop_assert!(!t.switch_pending());
            prop_assert_eq!(t.task(target).map(|task| task.priority()), before);
        }
    }
}
