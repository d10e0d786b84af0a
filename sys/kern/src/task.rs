// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks and the scheduler table.
//!
//! The table is a fixed slice of `Task` records indexed by task ID. Slot 0 is
//! the scheduler task, which runs the main loop; it is always enabled and
//! never reclaimed. The other slots are created and reclaimed as tasks come
//! and go.
//!
//! `Task` fields are private to this module so task invariants can be kept
//! here. The scheduling rules themselves live in `sched` (priority/readiness)
//! and `block` (waiting on block objects) as further `impl TaskTable` blocks.

use abi::{
    BlockObject, DetachState, Priority, RegionDesc, SchedPolicy,
    TaskAttributes, TaskId, UsageError, WakeReason, NONE_WORD, SUCCESS,
};

use crate::config::KernelConfig;
use crate::err::CreateError;
use crate::klog::KernEvent;
use crate::time::Timestamp;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TaskFlags: u8 {
        /// The slot is in use.
        const ENABLED = 1 << 0;
        /// Eligible to run: not sleeping, not blocked, not faulted.
        const ACTIVE = 1 << 1;
        /// Suspended by a stop signal, independent of `ACTIVE`.
        const STOPPED = 1 << 2;
        /// A thread that can be cancelled. The scheduler task isn't one.
        const THREAD = 1 << 3;
        /// Cancellation has been requested.
        const CANCEL = 1 << 4;
        /// Took a hardware fault; inactive until reclaimed.
        const FAULTED = 1 << 5;
        /// Nobody will join this task.
        const DETACHED = 1 << 6;
    }
}

/// Where a task starts executing.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EntryPoint {
    /// Address of the entry function.
    pub pc: u32,
    /// Value passed as the entry function's argument.
    pub arg: u32,
}

/// Internal representation of a task.
#[repr(C)] // so location of SavedState is predictable
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the user program.
    save: crate::arch::SavedState,
    // NOTE: it is critical that the above field appear first!
    id: TaskId,
    /// Effective priority. Never below `base_priority`.
    priority: Priority,
    /// Priority the task asked for; `priority` drops back here on restore.
    base_priority: Priority,
    flags: TaskFlags,
    policy: SchedPolicy,
    /// What the task is waiting on, when blocked.
    block_object: Option<BlockObject>,
    /// Why the task was last made active.
    wake_reason: WakeReason,
    /// When a sleep or bounded block expires.
    deadline: Option<Timestamp>,
    /// Ticks used since the task last got the processor.
    quantum: u32,
    entry: EntryPoint,
    region: RegionDesc,
}

impl Task {
    /// An unused slot.
    pub fn vacant(index: usize) -> Self {
        Task {
            save: crate::arch::SavedState::default(),
            id: TaskId(index as u16),
            priority: Priority::default(),
            base_priority: Priority::default(),
            flags: TaskFlags::empty(),
            policy: SchedPolicy::RoundRobin,
            block_object: None,
            wake_reason: WakeReason::None,
            deadline: None,
            quantum: 0,
            entry: EntryPoint::default(),
            region: RegionDesc::default(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current (possibly elevated) priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    pub fn block_object(&self) -> Option<BlockObject> {
        self.block_object
    }

    pub fn wake_reason(&self) -> WakeReason {
        self.wake_reason
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    pub fn entry(&self) -> EntryPoint {
        self.entry
    }

    pub fn region(&self) -> &RegionDesc {
        &self.region
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.contains(TaskFlags::ENABLED)
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(TaskFlags::ACTIVE)
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.contains(TaskFlags::STOPPED)
    }

    /// Demands the processor: enabled, active, and not stopped.
    pub fn is_ready(&self) -> bool {
        self.flags.contains(TaskFlags::ENABLED | TaskFlags::ACTIVE)
            && !self.is_stopped()
    }

    /// Blocked on `object` and not yet released.
    pub fn is_waiting_on(&self, object: BlockObject) -> bool {
        self.is_enabled()
            && !self.is_active()
            && self.block_object == Some(object)
    }

    /// Returns a reference to the saved machine state for the task.
    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    /// Returns a mutable reference to the saved machine state for the task.
    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }

    pub(crate) fn flags_mut(&mut self) -> &mut TaskFlags {
        &mut self.flags
    }

    pub(crate) fn set_priority(&mut self, p: Priority) {
        self.priority = p;
    }

    pub(crate) fn set_base_priority(&mut self, p: Priority) {
        self.base_priority = p;
    }

    pub(crate) fn set_quantum(&mut self, ticks: u32) {
        self.quantum = ticks;
    }

    /// Takes the task off the processor until a wake: records what it waits
    /// on and until when.
    pub(crate) fn deactivate(
        &mut self,
        object: Option<BlockObject>,
        deadline: Option<Timestamp>,
    ) {
        self.flags.remove(TaskFlags::ACTIVE);
        self.block_object = object;
        self.deadline = deadline;
        self.wake_reason = WakeReason::None;
    }

    /// Makes the task active again, dropping whatever it waited on, and
    /// tells it why through its return registers.
    pub(crate) fn activate(&mut self, reason: WakeReason) {
        self.flags.insert(TaskFlags::ACTIVE);
        self.block_object = None;
        self.deadline = None;
        self.wake_reason = reason;
        self.save.set_response(SUCCESS, reason as u32);
    }
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to task state for the rest of the
/// kernel.
///
/// Trap arguments arrive in four registers; results go back in two. `ret0`
/// always carries a response code.
pub trait ArchState: Default {
    /// Reads the task's stack pointer.
    fn stack_pointer(&self) -> u32;

    /// Reads trap argument register 0.
    fn arg0(&self) -> u32;
    /// Reads trap argument register 1.
    fn arg1(&self) -> u32;
    /// Reads trap argument register 2.
    fn arg2(&self) -> u32;
    /// Reads trap argument register 3.
    fn arg3(&self) -> u32;

    /// Reads the trap number.
    fn syscall_descriptor(&self) -> u32;

    /// Writes return register 0.
    fn ret0(&mut self, _: u32);
    /// Writes return register 1.
    fn ret1(&mut self, _: u32);

    /// Interprets arguments as for traps that name a single task.
    fn as_task_args(&self) -> TaskId {
        task_from_word(self.arg0())
    }

    /// Interprets arguments as for `Wake` and `SetPriority`.
    fn as_wake_args(&self) -> WakeArgs {
        WakeArgs {
            task: task_from_word(self.arg0()),
            priority: Priority::from_word(self.arg1()),
        }
    }

    /// Interprets arguments as for `Sleep`.
    fn as_sleep_args(&self) -> SleepArgs {
        SleepArgs {
            ticks: self.arg0(),
        }
    }

    /// Interprets arguments as for `Block`. A zero timeout means wait
    /// indefinitely.
    fn as_block_args(&self) -> BlockArgs {
        BlockArgs {
            object: BlockObject(self.arg0() as usize),
            timeout: match self.arg1() {
                0 => None,
                t => Some(t),
            },
        }
    }

    /// Interprets arguments as for `UnblockAll` and `Grant`. The reason is
    /// left raw so the dispatcher can reject bad values.
    fn as_unblock_args(&self) -> UnblockArgs {
        UnblockArgs {
            object: BlockObject(self.arg0() as usize),
            reason: self.arg1(),
        }
    }

    /// Sets a response code and value.
    fn set_response(&mut self, code: u32, value: u32) {
        self.ret0(code);
        self.ret1(value);
    }

    /// Sets an error response with no value.
    fn set_error_response(&mut self, e: UsageError) {
        self.set_response(e.into(), NONE_WORD);
    }
}

/// Out-of-range words become an ID that will fail the range check rather
/// than wrapping onto a real slot.
fn task_from_word(word: u32) -> TaskId {
    TaskId(u16::try_from(word).unwrap_or(u16::MAX))
}

/// Decoded arguments for `Wake` and `SetPriority`.
#[derive(Clone, Debug)]
pub struct WakeArgs {
    pub task: TaskId,
    /// `None` if the word doesn't encode a priority at all.
    pub priority: Option<Priority>,
}

/// Decoded arguments for `Sleep`.
#[derive(Clone, Debug)]
pub struct SleepArgs {
    pub ticks: u32,
}

/// Decoded arguments for `Block`.
#[derive(Clone, Debug)]
pub struct BlockArgs {
    pub object: BlockObject,
    pub timeout: Option<u32>,
}

/// Decoded arguments for `UnblockAll` and `Grant`.
#[derive(Clone, Debug)]
pub struct UnblockArgs {
    pub object: BlockObject,
    pub reason: u32,
}

/// The scheduler table plus the system-wide scheduling registers.
///
/// All mutation of task state goes through methods on this type, and in a
/// running system the only `TaskTable` lives behind `startup::KERNEL`.
#[derive(Debug)]
pub struct TaskTable<'t> {
    pub(crate) tasks: &'t mut [Task],
    /// Index of the task on the processor.
    pub(crate) current: usize,
    /// Highest priority among tasks that demand the processor, or the floor.
    pub(crate) current_priority: Priority,
    /// A context switch has been requested but not yet performed.
    pub(crate) switch_pending: bool,
    pub(crate) config: KernelConfig,
}

impl<'t> TaskTable<'t> {
    /// Takes over `tasks`, resetting every slot, and brings up the scheduler
    /// task in slot 0 as the current task.
    pub fn new(tasks: &'t mut [Task], config: KernelConfig) -> Self {
        uassert!(!tasks.is_empty());
        uassert!(tasks.len() <= usize::from(u16::MAX));
        uassert!(tasks.len() == config.task_total);

        for (i, task) in tasks.iter_mut().enumerate() {
            *task = Task::vacant(i);
        }
        let scheduler = &mut tasks[0];
        scheduler.flags = TaskFlags::ENABLED | TaskFlags::ACTIVE;
        scheduler.priority = config.lowest_priority;
        scheduler.base_priority = config.lowest_priority;
        scheduler.policy = SchedPolicy::RoundRobin;

        TaskTable {
            tasks,
            current: 0,
            current_priority: config.lowest_priority,
            switch_pending: false,
            config,
        }
    }

    /// Sets where the scheduler task starts and what memory it owns. Used
    /// once at boot, before the scheduler first runs.
    pub fn init_scheduler(&mut self, entry: EntryPoint, region: RegionDesc) {
        let scheduler = &mut self.tasks[0];
        scheduler.entry = entry;
        scheduler.region = region;
        crate::arch::reinitialize(scheduler);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn task_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.tasks.get_mut(index)
    }

    pub fn tasks(&self) -> &[Task] {
        self.tasks
    }

    /// Index of the task on the processor.
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn current_task_id(&self) -> TaskId {
        self.tasks[self.current].id
    }

    /// The system-wide current priority register.
    pub fn current_priority(&self) -> Priority {
        self.current_priority
    }

    /// Checks a task ID against the table, returning its index if it names
    /// an enabled slot.
    pub fn check_task_id(&self, id: TaskId) -> Result<usize, UsageError> {
        let index = id.index();
        match self.tasks.get(index) {
            None => Err(UsageError::TaskOutOfRange),
            Some(t) if !t.is_enabled() => Err(UsageError::TaskDisabled),
            Some(_) => Ok(index),
        }
    }

    /// The task in slot `index`, provided the slot is in use.
    fn enabled_mut(&mut self, index: usize) -> Result<&mut Task, UsageError> {
        match self.tasks.get_mut(index) {
            None => Err(UsageError::TaskOutOfRange),
            Some(t) if !t.is_enabled() => Err(UsageError::TaskDisabled),
            Some(t) => Ok(t),
        }
    }

    /// Like `check_task_id`, but also refuses the scheduler task.
    pub fn check_thread_id(&self, id: TaskId) -> Result<usize, UsageError> {
        match self.check_task_id(id)? {
            0 => Err(UsageError::SchedulerTask),
            index => Ok(index),
        }
    }

    /// Checks that a task may wait on `object`. Most objects are opaque, but
    /// join objects have to name a task that can be joined: an enabled
    /// thread that isn't detached.
    pub fn check_block_object(
        &self,
        object: BlockObject,
    ) -> Result<(), UsageError> {
        let Some(id) = object.joined_task() else {
            return Ok(());
        };
        let index = self.check_thread_id(id)?;
        if self.tasks[index].flags.contains(TaskFlags::DETACHED) {
            return Err(UsageError::NotJoinable);
        }
        Ok(())
    }

    /// Creates a task in the first free slot after the scheduler's.
    ///
    /// The new task starts enabled and active at `attr.priority`, running
    /// `entry` on the stack described by `stack`. On failure the table is
    /// untouched.
    pub fn create(
        &mut self,
        entry: EntryPoint,
        stack: RegionDesc,
        attr: &TaskAttributes,
    ) -> Result<TaskId, CreateError> {
        self.config
            .check_priority(attr.priority)
            .map_err(|_| CreateError::PriorityOutOfRange)?;
        if stack.size <= attr.guard_size {
            return Err(CreateError::StackTooSmall);
        }
        let index = self
            .tasks
            .iter()
            .skip(1)
            .position(|t| !t.is_enabled())
            .map(|i| i + 1)
            .ok_or(CreateError::TableFull)?;

        let task = &mut self.tasks[index];
        *task = Task::vacant(index);
        task.priority = attr.priority;
        task.base_priority = attr.priority;
        task.policy = attr.policy;
        task.flags = TaskFlags::ENABLED | TaskFlags::ACTIVE | TaskFlags::THREAD;
        if attr.detach == DetachState::Detached {
            task.flags.insert(TaskFlags::DETACHED);
        }
        task.entry = entry;
        task.region = stack;
        crate::arch::reinitialize(task);

        klog!(KernEvent::TaskCreated {
            index: index as u16,
            priority: attr.priority
        });

        // A new task may outrank everything that's running.
        self.wake(Some(index), attr.priority);
        Ok(TaskId(index as u16))
    }

    /// Frees a task's slot.
    ///
    /// Anyone joining the task (blocked on `BlockObject::for_task`) is
    /// released with `WakeReason::Joined`. A task still holding a block
    /// object can't be reclaimed.
    pub fn reclaim(&mut self, index: usize) -> Result<(), UsageError> {
        if index == 0 {
            return Err(UsageError::SchedulerTask);
        }
        let task = self.enabled_mut(index)?;
        if task.block_object.is_some() {
            return Err(UsageError::BlockObjectHeld);
        }
        let id = task.id;
        *task = Task::vacant(index);
        klog!(KernEvent::TaskReclaimed(index as u16));

        if let Some(p) =
            self.unblock_all(BlockObject::for_task(id), WakeReason::Joined)
        {
            self.wake(None, p);
        }
        self.recompute_current_priority();
        Ok(())
    }

    /// Marks a task for cancellation. Nothing else happens until the task
    /// reaches a cancellation point.
    pub fn cancel(&mut self, index: usize) -> Result<(), UsageError> {
        if index == 0 {
            return Err(UsageError::SchedulerTask);
        }
        let task = self.enabled_mut(index)?;
        task.flags.insert(TaskFlags::CANCEL);
        klog!(KernEvent::CancelRequested(index as u16));
        Ok(())
    }

    /// Cancellation point: if `index` is a thread with cancellation pending,
    /// reclaims it and returns `true`.
    pub fn check_cancellation_point(
        &mut self,
        index: usize,
    ) -> Result<bool, UsageError> {
        let task = self.tasks.get(index).ok_or(UsageError::TaskOutOfRange)?;
        if task.flags.contains(TaskFlags::CANCEL | TaskFlags::THREAD) {
            self.reclaim(index)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Takes a task that faulted off the processor for good. It stays in
    /// its slot, inactive, until `reclaim_faulted`. Refuses the scheduler
    /// task, whose fault the caller has to treat as fatal.
    pub fn isolate_faulted(&mut self, index: usize) -> Result<(), UsageError> {
        if index == 0 {
            return Err(UsageError::SchedulerTask);
        }
        let task = self.enabled_mut(index)?;
        task.deactivate(None, None);
        task.flags.insert(TaskFlags::FAULTED);
        klog!(KernEvent::FaultIsolated(index as u16));
        self.recompute_current_priority();
        Ok(())
    }

    /// Reclaims every task isolated by a fault. Returns how many.
    pub fn reclaim_faulted(&mut self) -> usize {
        let mut count = 0;
        for index in 1..self.tasks.len() {
            let t = &self.tasks[index];
            if t.is_enabled()
                && t.flags.contains(TaskFlags::FAULTED)
                && self.reclaim(index).is_ok()
            {
                count += 1;
            }
        }
        count
    }

    /// Asks for a context switch at the next opportunity.
    pub fn request_context_switch(&mut self) {
        self.switch_pending = true;
        crate::arch::pend_context_switch();
    }

    pub fn switch_pending(&self) -> bool {
        self.switch_pending
    }

    /// Consumes a pending switch request, returning whether there was one.
    pub fn take_switch_request(&mut self) -> bool {
        core::mem::take(&mut self.switch_pending)
    }

    /// Makes `next` the current task and starts its quantum afresh.
    pub fn switch_to(&mut self, next: usize) {
        self.current = next;
        self.tasks[next].quantum = 0;
        crate::profiling::event_context_switch(next);
    }

    /// Performs a requested context switch, if any. Returns the index of the
    /// task that should run.
    pub fn reschedule(&mut self) -> usize {
        if self.take_switch_request() {
            let next = self.select(self.current);
            self.switch_to(next);
        }
        self.current
    }
}

/// Scans `tasks` in round-robin order starting just after `previous`,
/// ignoring indices below `first`, and returns the index of the most urgent
/// task matching `pred`. Ties go to the first one found.
///
/// Every index in `first..tasks.len()` is visited exactly once, so moving
/// `previous` along moves which of several equals wins.
pub fn priority_scan(
    previous: usize,
    first: usize,
    tasks: &[Task],
    pred: impl Fn(&Task) -> bool,
) -> Option<usize> {
    let mut pos = previous;
    let mut choice: Option<(usize, Priority)> = None;
    for _step_no in first..tasks.len() {
        pos = pos.wrapping_add(1);
        if pos >= tasks.len() || pos < first {
            pos = first;
        }
        let t = &tasks[pos];
        if !pred(t) {
            continue;
        }

        if let Some((_, best)) = choice {
            if !t.priority.is_more_urgent_than(best) {
                continue;
            }
        }

        choice = Some((pos, t.priority));
    }

    choice.map(|(i, _)| i)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use abi::{DetachState, SchedPolicy};

    /// Leaks a table of `n` slots with the default configuration. Tests each
    /// get their own, so nothing here touches the kernel global.
    pub(crate) fn table(n: usize) -> TaskTable<'static> {
        let tasks: Vec<Task> = (0..n).map(Task::vacant).collect();
        TaskTable::new(
            Box::leak(tasks.into_boxed_slice()),
            KernelConfig::default().with_task_total(n),
        )
    }

    pub(crate) fn attrs(p: i8) -> TaskAttributes {
        TaskAttributes {
            priority: Priority(p),
            policy: SchedPolicy::RoundRobin,
            detach: DetachState::Joinable,
            guard_size: 32,
        }
    }

    pub(crate) fn stack(n: u32) -> RegionDesc {
        RegionDesc {
            base: 0x2000_0000 + n * 0x1000,
            size: 0x1000,
        }
    }

    /// Creates a task at priority `p`, returning its index.
    pub(crate) fn spawn(t: &mut TaskTable<'_>, p: i8) -> usize {
        let n = t.len() as u32;
        t.create(EntryPoint { pc: 0x0800_0101, arg: 0 }, stack(n), &attrs(p))
            .map(|id| id.index())
            .unwrap()
    }

    #[test]
    #[should_panic]
    fn table_must_match_configured_size() {
        let tasks: Vec<Task> = (0..3).map(Task::vacant).collect();
        TaskTable::new(
            Box::leak(tasks.into_boxed_slice()),
            KernelConfig::default().with_task_total(4),
        );
    }

    #[test]
    fn new_table_has_only_the_scheduler() {
        let t = table(4);
        assert!(t.tasks[0].is_enabled());
        assert!(t.tasks[0].is_active());
        assert!(!t.tasks[0].flags().contains(TaskFlags::THREAD));
        assert!(t.tasks[1..].iter().all(|t| !t.is_enabled()));
        assert_eq!(t.current(), 0);
        assert_eq!(t.current_priority(), t.config().lowest_priority);
    }

    #[test]
    fn fourth_creation_exhausts_a_table_of_four() {
        let mut t = table(4);
        let ids: Vec<usize> = (0..3).map(|_| spawn(&mut t, 5)).collect();
        assert_eq!(ids, [1, 2, 3]);

        let before: Vec<(TaskFlags, Priority)> =
            t.tasks.iter().map(|t| (t.flags(), t.priority())).collect();
        let current_priority = t.current_priority();

        let r = t.create(EntryPoint::default(), stack(9), &attrs(5));
        assert_eq!(r, Err(CreateError::TableFull));

        let after: Vec<(TaskFlags, Priority)> =
            t.tasks.iter().map(|t| (t.flags(), t.priority())).collect();
        assert_eq!(before, after);
        assert_eq!(t.current_priority(), current_priority);
    }

    #[test]
    fn create_validates_before_touching_anything() {
        let mut t = table(4);
        assert_eq!(
            t.create(EntryPoint::default(), stack(1), &attrs(100)),
            Err(CreateError::PriorityOutOfRange)
        );
        let tiny = RegionDesc {
            base: 0x2000_0000,
            size: 16,
        };
        assert_eq!(
            t.create(EntryPoint::default(), tiny, &attrs(5)),
            Err(CreateError::StackTooSmall)
        );
        assert!(t.tasks[1..].iter().all(|t| !t.is_enabled()));
    }

    #[test]
    fn created_task_is_enabled_active_thread() {
        let mut t = table(4);
        let i = spawn(&mut t, 7);
        let task = t.task(i).unwrap();
        assert!(task.is_ready());
        assert!(task.flags().contains(TaskFlags::THREAD));
        assert_eq!(task.priority(), Priority(7));
        assert_eq!(task.base_priority(), Priority(7));
        assert_eq!(task.block_object(), None);
        assert_eq!(t.current_priority(), Priority(7));
        assert!(t.switch_pending());
    }

    #[test]
    fn only_joinable_threads_can_be_joined() {
        let mut t = table(5);
        let a = TaskAttributes {
            detach: DetachState::Detached,
            ..attrs(3)
        };
        let detached = t.create(EntryPoint::default(), stack(1), &a).unwrap();
        let joinable = TaskId(spawn(&mut t, 3) as u16);

        let join = BlockObject::for_task;
        assert_eq!(t.check_block_object(join(joinable)), Ok(()));
        assert_eq!(
            t.check_block_object(join(detached)),
            Err(UsageError::NotJoinable)
        );
        assert_eq!(
            t.check_block_object(join(TaskId::SCHEDULER)),
            Err(UsageError::SchedulerTask)
        );
        assert_eq!(
            t.check_block_object(join(TaskId(3))),
            Err(UsageError::TaskDisabled)
        );
        assert_eq!(
            t.check_block_object(join(TaskId(40))),
            Err(UsageError::TaskOutOfRange)
        );
        assert_eq!(t.check_block_object(BlockObject(0x2000_0000)), Ok(()));
    }

    #[test]
    fn check_task_id_distinguishes_range_and_vacancy() {
        let mut t = table(4);
        spawn(&mut t, 5);
        assert_eq!(t.check_task_id(TaskId(0)), Ok(0));
        assert_eq!(t.check_task_id(TaskId(1)), Ok(1));
        assert_eq!(t.check_task_id(TaskId(2)), Err(UsageError::TaskDisabled));
        assert_eq!(t.check_task_id(TaskId(4)), Err(UsageError::TaskOutOfRange));
        assert_eq!(
            t.check_thread_id(TaskId(0)),
            Err(UsageError::SchedulerTask)
        );
    }

    #[test]
    fn reclaim_frees_slot_and_releases_joiners() {
        let mut t = table(4);
        let worker = spawn(&mut t, 5);
        let joiner = spawn(&mut t, 9);
        t.block(joiner, BlockObject::for_task(TaskId(worker as u16)), None);
        assert!(!t.task(joiner).unwrap().is_active());

        t.reclaim(worker).unwrap();
        assert!(!t.task(worker).unwrap().is_enabled());
        let j = t.task(joiner).unwrap();
        assert!(j.is_active());
        assert_eq!(j.wake_reason(), WakeReason::Joined);
        assert_eq!(t.current_priority(), Priority(9));

        // The slot is reusable.
        assert_eq!(spawn(&mut t, 1), worker);
    }

    #[test]
    fn reclaim_refuses_scheduler_and_blocked_tasks() {
        let mut t = table(4);
        let i = spawn(&mut t, 5);
        assert_eq!(t.reclaim(0), Err(UsageError::SchedulerTask));
        t.block(i, BlockObject(0x2000_0100), None);
        assert_eq!(t.reclaim(i), Err(UsageError::BlockObjectHeld));
        assert!(t.task(i).unwrap().is_enabled());
        assert_eq!(t.reclaim(3), Err(UsageError::TaskDisabled));
    }

    #[test]
    fn cancellation_is_deferred_to_the_checkpoint() {
        let mut t = table(4);
        let i = spawn(&mut t, 5);
        assert_eq!(t.check_cancellation_point(i), Ok(false));
        t.cancel(i).unwrap();
        assert!(t.task(i).unwrap().is_enabled());
        assert_eq!(t.check_cancellation_point(i), Ok(true));
        assert!(!t.task(i).unwrap().is_enabled());
        assert_eq!(t.cancel(0), Err(UsageError::SchedulerTask));
    }

    #[test]
    fn vacant_slots_refuse_cancel_and_isolation() {
        let mut t = table(4);
        spawn(&mut t, 5);
        t.take_switch_request();
        let before = t.current_priority();

        assert_eq!(t.cancel(2), Err(UsageError::TaskDisabled));
        assert_eq!(t.isolate_faulted(2), Err(UsageError::TaskDisabled));
        assert_eq!(t.cancel(9), Err(UsageError::TaskOutOfRange));
        assert_eq!(t.isolate_faulted(9), Err(UsageError::TaskOutOfRange));

        assert!(t.task(2).unwrap().flags().is_empty());
        assert_eq!(t.current_priority(), before);
        assert!(!t.switch_pending());
        assert_eq!(t.reclaim_faulted(), 0);
    }

    #[test]
    fn scheduler_is_never_cancelled_at_checkpoint() {
        let mut t = table(2);
        // Even if the flag were somehow set, task 0 is not a thread.
        t.tasks[0].flags.insert(TaskFlags::CANCEL);
        assert_eq!(t.check_cancellation_point(0), Ok(false));
        assert!(t.tasks[0].is_enabled());
    }

    #[test]
    fn faulted_task_is_isolated_then_reclaimed() {
        let mut t = table(4);
        let low = spawn(&mut t, 2);
        let high = spawn(&mut t, 8);
        t.isolate_faulted(high).unwrap();
        let h = t.task(high).unwrap();
        assert!(h.is_enabled() && !h.is_active());
        assert_eq!(t.current_priority(), Priority(2));

        // Wakes don't bring it back.
        t.wake(Some(high), Priority(20));
        assert!(!t.task(high).unwrap().is_active());

        assert_eq!(t.reclaim_faulted(), 1);
        assert!(!t.task(high).unwrap().is_enabled());
        assert!(t.task(low).unwrap().is_enabled());
        assert_eq!(t.isolate_faulted(0), Err(UsageError::SchedulerTask));
    }

    #[test]
    fn reschedule_only_acts_on_requests() {
        let mut t = table(4);
        let i = spawn(&mut t, 5);
        assert_eq!(t.reschedule(), i);
        assert!(!t.switch_pending());
        // No request, no movement.
        assert_eq!(t.reschedule(), i);
    }

    #[test]
    fn priority_scan_visits_each_index_once() {
        let mut t = table(5);
        for _ in 0..4 {
            spawn(&mut t, 5);
        }
        for previous in 0..5 {
            let seen = core::cell::RefCell::new(Vec::new());
            priority_scan(previous, 1, t.tasks(), |task| {
                seen.borrow_mut().push(task.id().index());
                false
            });
            let mut seen = seen.into_inner();
            assert_eq!(seen.len(), 4);
            assert_ne!(seen[0], 0);
            seen.sort();
            assert_eq!(seen, [1, 2, 3, 4]);
        }
    }
}
