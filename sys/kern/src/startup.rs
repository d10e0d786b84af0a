// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the scheduler task's main loop.
//!
//! The board calls `start_kernel` once, from privileged mode, with its
//! `Platform`. We build the task table, bring up isolation, create the first
//! application task, and drop into the scheduler task, which runs
//! `Scheduler::run` for the lifetime of the system.

use core::cell::RefCell;
use core::mem::MaybeUninit;

use abi::{
    DetachState, KernelEvent, RegionDesc, SchedPolicy, TaskAttributes, TaskId,
    TraceKind,
};
use critical_section::Mutex;

use crate::config::{KernelConfig, TASK_TOTAL};
use crate::err::{IsolationError, KernError, TraceError};
use crate::fail::die;
use crate::fault::{check_faults, FaultMailbox, FAULT_RECORD};
use crate::task::{EntryPoint, Task, TaskTable};

/// Services the kernel needs from the board.
pub trait Platform {
    /// Allocates `size` bytes of stack, returning its base address.
    fn alloc_stack(&mut self, size: u32) -> Option<u32>;

    /// Restricts a task to `region`.
    fn enable_isolation(
        &mut self,
        region: RegionDesc,
    ) -> Result<(), IsolationError>;

    /// Sleeps until an interrupt arrives.
    fn enter_low_power_wait(&mut self);

    /// Reports a lifecycle milestone or fatal condition.
    fn notify(&mut self, event: KernelEvent, context: u32);

    /// Emits one diagnostic record. Best effort.
    fn emit_trace(
        &mut self,
        record: &TraceRecord<'_>,
    ) -> Result<(), TraceError>;

    /// Busy-waits for `us` microseconds.
    fn delay_us(&mut self, us: u32);

    /// Memory owned by the scheduler task.
    fn scheduler_region(&self) -> RegionDesc;

    /// Where the first application task starts.
    fn init_entry(&self) -> EntryPoint;
}

/// One diagnostic record, as handed to `Platform::emit_trace`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceRecord<'a> {
    pub kind: TraceKind,
    /// Task the record is about.
    pub tid: u32,
    pub address: u32,
    pub message: &'a str,
}

/// Tags passed as `notify` context for fatal events, so they can be told
/// apart on a logic analyzer.
const fn tag(name: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*name)
}

/// The task table, once installed, behind the kernel's critical section.
pub struct KernelCell {
    table: Mutex<RefCell<Option<TaskTable<'static>>>>,
}

impl KernelCell {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(None)),
        }
    }

    /// Hands `table` to the kernel. Any previous table is dropped.
    pub fn install(&self, table: TaskTable<'static>) {
        critical_section::with(|cs| {
            *self.table.borrow_ref_mut(cs) = Some(table);
        });
    }

    pub fn is_installed(&self) -> bool {
        critical_section::with(|cs| self.table.borrow_ref(cs).is_some())
    }

    /// Runs `body` with exclusive access to the task table.
    ///
    /// To preserve uniqueness of the `&mut` reference passed into `body`,
    /// this detects any attempt to call it recursively and dies.
    pub fn with<R>(
        &self,
        body: impl FnOnce(&mut TaskTable<'static>) -> R,
    ) -> R {
        critical_section::with(|cs| {
            let Ok(mut slot) = self.table.borrow(cs).try_borrow_mut() else {
                die("recursive use of task table");
            };
            match slot.as_mut() {
                Some(table) => body(table),
                None => die("task table not installed"),
            }
        })
    }
}

impl Default for KernelCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's task table.
pub static KERNEL: KernelCell = KernelCell::new();

/// Runs `body` with a reference to the kernel's task table.
pub fn with_task_table<R>(
    body: impl FnOnce(&mut TaskTable<'static>) -> R,
) -> R {
    KERNEL.with(body)
}

/// Brings up global isolation for the scheduler's region and announces that
/// debugging can begin.
pub fn prepare<P: Platform + ?Sized>(
    platform: &mut P,
) -> Result<(), KernError> {
    let region = platform.scheduler_region();
    if platform.enable_isolation(region).is_err() {
        platform.notify(KernelEvent::RootFatal, tag(b"tski"));
        return Err(KernError::Isolation);
    }
    platform.notify(KernelEvent::DebugInitialized, 0);
    Ok(())
}

/// Creates the first application task at the configured start priority, on a
/// freshly allocated stack.
pub fn start_first_task<P: Platform + ?Sized>(
    table: &mut TaskTable<'_>,
    platform: &mut P,
) -> Result<TaskId, KernError> {
    let config = *table.config();
    let Some(base) = platform.alloc_stack(config.start_stack_size) else {
        platform.notify(KernelEvent::Fatal, tag(b"stck"));
        return Err(KernError::NoStack);
    };
    let stack = RegionDesc {
        base,
        size: config.start_stack_size,
    };
    if let Err(e) = platform.enable_isolation(stack) {
        platform.notify(KernelEvent::Fatal, tag(b"isol"));
        return Err(e.into());
    }

    let attr = TaskAttributes {
        priority: config.start_priority,
        policy: SchedPolicy::RoundRobin,
        detach: DetachState::Detached,
        guard_size: config.guard_size,
    };
    match table.create(platform.init_entry(), stack, &attr) {
        Ok(id) => {
            platform.notify(KernelEvent::TaskInitialized, u32::from(id.0));
            Ok(id)
        }
        Err(e) => {
            platform.notify(KernelEvent::Fatal, tag(b"thrd"));
            Err(e.into())
        }
    }
}

/// Everything between building the table and running the first task.
pub fn bootstrap<P: Platform + ?Sized>(
    table: &mut TaskTable<'_>,
    platform: &mut P,
) -> Result<TaskId, KernError> {
    prepare(platform)?;
    start_first_task(table, platform)
}

/// How the scheduler task reaches privileged state.
pub trait KernelGate {
    /// Number of tasks demanding the processor.
    fn exec_count(&mut self) -> usize;

    /// Lets the engine's choice of task run.
    fn sched_yield(&mut self);

    /// Acknowledges the pending fault record.
    fn fault_logged(&mut self);
}

/// Gate that calls straight into a kernel cell. Used where the scheduler
/// task already runs privileged, as on a host build.
pub struct DirectGate<'a> {
    pub kernel: &'a KernelCell,
    pub faults: &'a FaultMailbox,
}

impl KernelGate for DirectGate<'_> {
    fn exec_count(&mut self) -> usize {
        self.kernel.with(|t| t.exec_count())
    }

    fn sched_yield(&mut self) {
        self.kernel.with(|t| {
            t.request_context_switch();
            t.reschedule();
        });
    }

    fn fault_logged(&mut self) {
        self.faults.acknowledge();
        self.kernel.with(|t| {
            t.reclaim_faulted();
        });
    }
}

/// Which branch a main loop iteration took.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoopState {
    FaultDrain,
    Idle,
    Dispatch,
}

/// The scheduler task's main loop.
pub struct Scheduler<'a, P: Platform + ?Sized, G: KernelGate> {
    platform: &'a mut P,
    gate: G,
    faults: &'a FaultMailbox,
    config: KernelConfig,
}

impl<'a, P: Platform + ?Sized, G: KernelGate> Scheduler<'a, P, G> {
    pub fn new(
        platform: &'a mut P,
        gate: G,
        faults: &'a FaultMailbox,
        config: KernelConfig,
    ) -> Self {
        Self {
            platform,
            gate,
            faults,
            config,
        }
    }

    /// Runs one iteration. A pending fault is drained first and takes the
    /// whole iteration.
    pub fn step(&mut self) -> LoopState {
        let gate = &mut self.gate;
        if check_faults(self.faults, &mut *self.platform, &self.config, || {
            gate.fault_logged()
        }) {
            return LoopState::FaultDrain;
        }

        if self.gate.exec_count() == 0 {
            crate::profiling::event_idle_enter();
            self.platform.enter_low_power_wait();
            crate::profiling::event_idle_exit();
            LoopState::Idle
        } else {
            self.gate.sched_yield();
            LoopState::Dispatch
        }
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.step();
        }
    }

    pub fn platform(&self) -> &P {
        self.platform
    }
}

/// The main kernel entry point.
///
/// We currently expect an application to provide its own `main`-equivalent
/// function, which does basic hardware setup and then calls this function.
///
/// Parameters:
///
/// - `tick_divisor`: a platform-specific way of converting "machine ticks" into
///   "kernel ticks." On ARM M-profile, this is CPU cycles per tick, where a
///   tick is typically a millisecond.
/// - `platform`: the board's services. The kernel uses it during bootstrap,
///   then hands it to the scheduler task.
///
/// # Safety
///
/// This function has architecture-specific requirements for safe use -- on ARM,
/// for instance, it must be called from the main (interrupt) stack in
/// privileged mode.
///
/// This function may not be called reentrantly or from multiple cores.
pub unsafe fn start_kernel<P: Platform + 'static>(
    tick_divisor: u32,
    platform: &'static mut P,
) -> ! {
    static mut TASK_TABLE_SPACE: MaybeUninit<[Task; TASK_TOTAL]> =
        MaybeUninit::uninit();

    // Safety: this reference will remain unique so long as the "only called
    // once per boot" contract on this function is upheld.
    let space = unsafe { &mut *core::ptr::addr_of_mut!(TASK_TABLE_SPACE) };
    let tasks: &'static mut [Task] =
        space.write(core::array::from_fn(Task::vacant));

    let arg = &mut *platform as *mut P as usize as u32;
    let mut table = TaskTable::new(tasks, KernelConfig::default());
    table.init_scheduler(
        EntryPoint {
            pc: scheduler_main::<P> as usize as u32,
            arg,
        },
        platform.scheduler_region(),
    );
    if let Err(e) = bootstrap(&mut table, platform) {
        die(e);
    }

    KERNEL.install(table);
    // Safety: we're on the main stack in privileged mode, per our own
    // contract, and the table is installed.
    unsafe { crate::arch::start_first_task(tick_divisor) }
}

/// Body of the scheduler task. `arg` is the platform handed over by
/// `start_kernel`, which no longer touches it.
extern "C" fn scheduler_main<P: Platform + 'static>(arg: u32) -> ! {
    // Safety: start_kernel passed us a `&'static mut P` and dropped its own
    // use of it before the first task ran.
    let platform = unsafe { &mut *(arg as usize as *mut P) };
    Scheduler::new(
        platform,
        crate::arch::scheduler_gate(),
        &FAULT_RECORD,
        KernelConfig::default(),
    )
    .run()
}
