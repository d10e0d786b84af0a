// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M and ARMv8-M mainline.
//!
//! Tasks are assumed not to use the FPU; only the integer register file is
//! saved across context switches.
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the kernel timer, but it's only suitable for
//! producing periodic interrupts -- its counter is small and only counts down.
//! So, at each SysTick interrupt, we increment the `TICKS` global that contains
//! the real kernel timestamp.
//!
//! # Notes on ARM-M interrupts
//!
//! This implementation uses several different interrupt service routines:
//!
//! - `SVCall` implements the `SVC` instruction used to trap into the kernel.
//! - `SysTick` handles interrupts from the System Tick Timer.
//! - `PendSV` handles deferred context switches from interrupts.
//!
//! On any interrupt, the processor stacks a small subset of machine state and
//! then calls our ISR, which follows the normal (C) calling convention. That's
//! fine as long as the code we return to is the code that called us -- but in
//! the case of a context switch, it isn't. So around `SVCall` and `PendSV` we
//! carefully deposit all remaining user state into the current `Task`, and
//! read it back on the way out, possibly from a different `Task`.
//!
//! This is relatively costly, so `SysTick` and the fault handlers' callers in
//! interrupt context don't do it. If they discover that a context switch is
//! required they set `PendSV` pending, which runs after the ISR exits and does
//! the full save/restore around the switch.

use core::arch::{self, global_asm};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use abi::{FaultRecord, Sysnum};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::err::KernError;
use crate::fail::die;
use crate::fault::FAULT_RECORD;
use crate::mailbox::MAILBOX;
use crate::startup::{with_task_table, KernelGate};
use crate::task;
use crate::time::Timestamp;

macro_rules! uassert {
    ($cond : expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// On ARMvx-M we have to use a global to record the current task pointer, since
/// we don't have a scratch register.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<task::Task> =
    AtomicPtr::new(core::ptr::null_mut());

/// To allow our clock frequency to be easily determined from a debugger, we
/// store it in memory.
#[no_mangle]
static CLOCK_FREQ_KHZ: AtomicU32 = AtomicU32::new(0);

/// ARMvx-M volatile registers that must be saved across context switches.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous!
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    // NOTE: the above fields must be kept contiguous!
}

/// Map the volatile registers to (architecture-independent) trap argument
/// and return slots.
impl task::ArchState for SavedState {
    fn stack_pointer(&self) -> u32 {
        self.psp
    }

    fn arg0(&self) -> u32 {
        self.r4
    }
    fn arg1(&self) -> u32 {
        self.r5
    }
    fn arg2(&self) -> u32 {
        self.r6
    }
    fn arg3(&self) -> u32 {
        self.r7
    }

    fn syscall_descriptor(&self) -> u32 {
        self.r11
    }

    fn ret0(&mut self, x: u32) {
        self.r4 = x
    }
    fn ret1(&mut self, x: u32) {
        self.r5 = x
    }
}

/// Stuff placed on the stack at exception entry.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
pub struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// Return to Thread mode, on the process stack, with a basic (non-FPU)
/// frame.
const EXC_RETURN_CONST: u32 = 0xFFFF_FFFD;

// Because debuggers need to know the clock frequency to set the SWO clock
// scaler that enables ITM, and because ITM is particularly useful when
// debugging boot failures, this should be set as early in boot as it can
// be.
pub unsafe fn set_clock_freq(tick_divisor: u32) {
    CLOCK_FREQ_KHZ.store(tick_divisor, Ordering::Relaxed);
}

/// Puts a task's registers and initial exception frame into their starting
/// state, so that the first return into it lands on its entry point with
/// its argument in `r0`.
pub fn reinitialize(task: &mut task::Task) {
    *task.save_mut() = SavedState::default();
    let region = *task.region();
    if region.size == 0 {
        // Vacant slot; nothing to set up.
        return;
    }
    let entry = task.entry();

    // Modern ARMvX-M machines require 8-byte stack alignment.
    let initial_stack = region.end_addr() & !0x7;
    let frame_size = core::mem::size_of::<BaseExceptionFrame>() as u32;
    uassert!(initial_stack >= region.base + frame_size);
    let frame_addr = initial_stack - frame_size;

    // Zap the unused part of the stack with a distinct (and storied) pattern,
    // to make high-water marks visible to a debugger.
    //
    // Safety: the stack region was handed to us by the platform and belongs
    // to this task alone, which isn't running.
    unsafe {
        let words = ((frame_addr - region.base) / 4) as usize;
        let zap = core::slice::from_raw_parts_mut(
            region.base as usize as *mut u32,
            words,
        );
        for word in zap.iter_mut() {
            *word = 0xbaddcafe;
        }
    }

    let frame = BaseExceptionFrame {
        r0: entry.arg,
        pc: entry.pc | 1, // for thumb
        xpsr: INITIAL_PSR,
        lr: 0xFFFF_FFFF, // trap on return from main
        ..BaseExceptionFrame::default()
    };
    // Safety: as above, and we checked the frame fits in the region.
    unsafe {
        let dest = core::slice::from_raw_parts_mut(
            frame_addr as usize as *mut u8,
            frame_size as usize,
        );
        dest.copy_from_slice(frame.as_bytes());
    }

    let save = task.save_mut();
    save.psp = frame_addr;
    save.exc_return = EXC_RETURN_CONST;
}

/// Hands the processor to the task the table says is current. Does not
/// return.
///
/// # Safety
///
/// Call once, from the main stack in privileged mode, after the task table
/// is installed.
pub unsafe fn start_first_task(tick_divisor: u32) -> ! {
    // Enable faults and set fault/exception priorities to reasonable settings.
    // Our goal here is to keep the kernel non-preemptive, which means the
    // kernel entry points (SVCall, PendSV, SysTick) must be at one priority
    // level. Fault handlers need to be higher priority, however, so that we
    // can detect faults in the kernel.
    //
    // Safety: we're purely lowering priorities from their defaults, so it
    // can't cause any surprise preemption. But these operations are `unsafe`
    // in the `cortex_m` crate.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // Faults on: MEMFAULT, BUSFAULT, USGFAULT.
        scb.shcsr.modify(|x| x | 0b111 << 16);

        // Set priority of Usage, Bus, MemManage to 0 (highest configurable).
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // Set priority of SVCall to 0xFF (lowest configurable).
        scb.shpr[7].write(0xFF);
        // SysTick and PendSV also to 0xFF
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // Trap on divide by zero rather than quietly returning 0.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);
    }

    // Safety: this, too, is safe in practice but unsafe in API.
    unsafe {
        set_clock_freq(tick_divisor);
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(tick_divisor - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt.
        syst.csr.modify(|v| v | 0b111);
    }

    let task = with_task_table(|t| {
        let next = t.current();
        &t.tasks()[next] as *const task::Task
    });
    CURRENT_TASK_PTR.store(task as *mut _, Ordering::Relaxed);

    // Safety: this is setting the Process (task) stack pointer, which has no
    // effect _assuming_ this code is running on the Main (kernel) stack.
    let r4 = unsafe {
        cortex_m::register::psp::write((*task).save().psp);
        &(*task).save().r4 as *const u32
    };

    // Flip into Handler mode by trapping, so that we can switch Thread mode
    // to unprivileged and running off the Process Stack Pointer. The SVC
    // entry sequence detects this case and does startup rather than treating
    // it as a trap.
    unsafe {
        arch::asm!("
            @ Restore callee-save registers.
            ldm {task}, {{r4-r11}}
            @ Trap into the kernel.
            svc #0xFF
            @ noreturn generates a UDF here in case that should return.
            ",
            task = in(reg) r4,
            options(noreturn),
        )
    }
}

// Handler that gets linked into the vector table for the Supervisor Call (SVC)
// instruction. (Name is dictated by the `cortex_m` crate.)
//
// First, we inspect LR, which on exception entry contains bits describing the
// _previous_ (interrupted) processor state. We can use this to detect if the
// SVC came from the Main (interrupt) stack. This only happens once, during
// startup, so we vector to a different routine in this case.
//
// We then store the calling task's context into the TCB, call into
// `syscall_entry`, and restore task context (possibly for a different task!).
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the kernel startup routine?
        cmp r0, #0x8
        @ If so, this is startup; jump ahead.
        beq 1f

        @ store volatile state.
        @ first, get a pointer to the current task.
        movw r0, #:lower16:CURRENT_TASK_PTR
        movt r0, #:upper16:CURRENT_TASK_PTR
        ldr r1, [r0]
        movs r2, r1
        @ fetching PSP into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r2!, {{r4-r12, lr}}

        @ trap number is passed in r11. Move it into r0 to pass it as
        @ an argument to the handler, then call the handler.
        movs r0, r11
        bl syscall_entry

        @ we're returning back to *some* task, maybe not the same one.
        movw r0, #:lower16:CURRENT_TASK_PTR
        movt r0, #:upper16:CURRENT_TASK_PTR
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        msr PSP, r12

        @ resume
        bx lr

    1:  @ starting up the first task.
        movs r0, #1         @ get bitmask to...
        msr CONTROL, r0     @ ...shed privs from thread mode.

        mov lr, {exc_return}    @ materialize EXC_RETURN value to
                                @ return into thread mode, PSP

        bx lr                   @ branch into user mode
    ",
    exc_return = const EXC_RETURN_CONST,
}

/// Records the address of `task` as the current user task.
///
/// # Safety
///
/// This records a pointer that aliases `task`. As long as you don't read that
/// pointer while you have access to `task`, and as long as the `task` being
/// stored is actually in the task table, you'll be okay.
pub unsafe fn set_current_task(task: &task::Task) {
    CURRENT_TASK_PTR.store(task as *const _ as *mut _, Ordering::Relaxed);
}

/// Reads the tick counter.
pub fn now() -> Timestamp {
    // Recall that we expect the systick interrupt cannot preempt kernel code,
    // so we're safe to read this in two nonatomic parts here.
    Timestamp::from([
        TICKS[0].load(Ordering::Relaxed),
        TICKS[1].load(Ordering::Relaxed),
    ])
}

/// Kernel global for tracking the current timestamp, measured in ticks.
///
/// This is a pair of `AtomicU32` because ARMv7-M doesn't have any 64-bit
/// atomic operations. We access this only from contexts where we can't be
/// preempted, so the fact that it's split across two words is ok.
///
/// `TICKS[0]` is the least significant part, `TICKS[1]` the most significant.
static TICKS: [AtomicU32; 2] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 2]
};

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::profiling::event_timer_isr_enter();
    with_task_table(|tasks| {
        // Load the time before this tick event.
        let t0 = TICKS[0].load(Ordering::Relaxed);
        let t1 = TICKS[1].load(Ordering::Relaxed);

        // Advance the kernel's notion of time by adding 1. Laboriously.
        let (t0, t1) = if let Some(t0p) = t0.checked_add(1) {
            TICKS[0].store(t0p, Ordering::Relaxed);
            (t0p, t1)
        } else {
            TICKS[0].store(0, Ordering::Relaxed);
            TICKS[1].store(t1 + 1, Ordering::Relaxed);
            (0, t1 + 1)
        };

        MAILBOX.drain(tasks);
        tasks.tick(Timestamp::from([t0, t1]));

        // The entry sequence to this ISR doesn't save state for a switch, so
        // leave it to PendSV.
        if tasks.switch_pending() {
            pend_context_switch();
        }
    });
    crate::profiling::event_timer_isr_exit();
}

/// Sets PendSV pending. PendSV will happen after the current ISR (and any
/// chained ISRs) returns, and perform the context switch.
pub fn pend_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        @ store volatile state.
        @ first, get a pointer to the current task.
        movw r0, #:lower16:CURRENT_TASK_PTR
        movt r0, #:upper16:CURRENT_TASK_PTR
        ldr r1, [r0]
        @ fetching PSP into r12 means the order in the stm below is right.
        mrs r12, PSP
        @ now, store volatile registers, plus the PSP in r12, plus LR.
        stm r1!, {{r4-r12, lr}}

        bl pendsv_entry

        @ we're returning back to *some* task, maybe not the same one.
        movw r0, #:lower16:CURRENT_TASK_PTR
        movt r0, #:upper16:CURRENT_TASK_PTR
        ldr r0, [r0]
        @ restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        msr PSP, r12

        @ resume
        bx lr
    ",
}

/// The Rust side of the PendSV handler, after all volatile registers have been
/// saved somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    crate::profiling::event_switch_enter();

    let current = CURRENT_TASK_PTR.load(Ordering::Relaxed);
    uassert!(!current.is_null()); // irq before kernel started?

    with_task_table(|tasks| {
        MAILBOX.drain(tasks);
        let next = tasks.reschedule();
        // Safety: next comes from the task table and we don't use it again
        // until next kernel entry, so we meet set_current_task's requirements.
        unsafe {
            set_current_task(&tasks.tasks()[next]);
        }
    });
    crate::profiling::event_switch_exit();
}

#[repr(u8)]
#[derive(Copy, Clone)]
enum FaultType {
    MemoryManagement = 4,
    BusFault = 5,
    UsageFault = 6,
}

global_asm! {"
    .section .text.im_dead
    .globl im_dead
    .type im_dead,function
    im_dead:
        @ lie down try not to cry cry a lot
        movw r0, #0xed0c
        movt r0, #0xe000
        movw r1, #0x0004
        movt r1, #0x05fa
        str.w  r1, [r0]
    1:
        b 1b

    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    configurable_fault:
        @ Read the current task pointer.
        movw r0, #:lower16:CURRENT_TASK_PTR
        movt r0, #:upper16:CURRENT_TASK_PTR
        ldr r0, [r0]
        mrs r12, PSP

        @ Save our remaining registers, plus the PSP (now in r12), plus
        @ exc_return (now in LR) into the save region in the current task.
        mov r2, r0
        stm r2!, {{r4-r12, lr}}

        @ Pull our fault number out of IPSR. This handler is only used for
        @ exceptions numbered below 16.
        mrs r1, IPSR
        and r1, r1, #0xf
        bl handle_fault

        @ Our task has changed; reload it.
        movw r0, #:lower16:CURRENT_TASK_PTR
        movt r0, #:upper16:CURRENT_TASK_PTR
        ldr r0, [r0]

        @ Restore volatile registers, plus load PSP into r12
        ldm r0!, {{r4-r12, lr}}
        msr PSP, r12

        @ resume
        bx lr

    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    UsageFault:
        b configurable_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    HardFault:
        b im_dead
    ",
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << 8;
        const PRECISERR = 1 << 9;
        const IMPRECISERR = 1 << 10;
        const UNSTKERR = 1 << 11;
        const STKERR = 1 << 12;
        const LSPERR = 1 << 13;
        const BFARVALID = 1 << 15;

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << 16;
        const INVSTATE = 1 << 17;
        const INVPC = 1 << 18;
        const NOCP = 1 << 19;
        const UNALIGNED = 1 << 24;
        const DIVBYZERO = 1 << 25;
    }
}

/// Reads the exception frame the hardware stacked on a task's stack, if the
/// stack pointer still lies within the task's region.
fn stacked_frame(
    psp: u32,
    region: &abi::RegionDesc,
) -> Option<BaseExceptionFrame> {
    let size = core::mem::size_of::<BaseExceptionFrame>() as u32;
    let end = psp.checked_add(size)?;
    if !region.contains(psp) || end > region.end_addr() {
        return None;
    }
    // Safety: the range lies within the task's stack region, which is
    // readable from privileged mode.
    let bytes = unsafe {
        core::slice::from_raw_parts(psp as usize as *const u8, size as usize)
    };
    BaseExceptionFrame::read_from_bytes(bytes).ok()
}

/// Rust entry point for fault.
///
/// # Safety
///
/// In brief: don't call this. This is an implementation factor of the fault
/// handler assembly code and should not be used for other purposes. `task`
/// must point to an initialized, aligned Task in the task table.
#[no_mangle]
unsafe extern "C" fn handle_fault(
    task: *mut task::Task,
    fault_type: FaultType,
) {
    // Safety: this is dereferencing the raw pointer produced by SCB::PTR,
    // which is valid and static.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());

    // Who faulted? We immediately throw away the reference, as it would
    // otherwise alias the task table obtained later.
    let (exc_return, psp, idx, region) = unsafe {
        let t = &(*task);
        (
            t.save().exc_return,
            t.save().psp,
            t.id().index(),
            *t.region(),
        )
    };
    let from_thread_mode = exc_return & 0b1000 != 0;
    let frame = stacked_frame(psp, &region);
    let pc = frame.as_ref().map_or(0, |f| f.pc);

    if !from_thread_mode || idx == 0 {
        // Either the kernel or the scheduler task itself. Neither can be
        // isolated and carried on without.
        die(KernError::SchedulerFault {
            num: fault_type as u32,
            pc,
        });
    }

    // Clear any architectural exceptions the fault left pending (SHCSR bits
    // 15:12), or returning would deliver them on behalf of the wrong task.
    //
    // Safety: SVC is not higher priority than this handler.
    unsafe {
        scb.shcsr.modify(|bits| bits & !(0b1111 << 12));
    }

    let addr = if cfsr.contains(Cfsr::MMARVALID) {
        scb.mmfar.read()
    } else if cfsr.contains(Cfsr::BFARVALID) {
        scb.bfar.read()
    } else {
        0
    };

    // Write-one-to-clear.
    //
    // Safety: clearing recorded fault state has no memory safety impact.
    unsafe {
        scb.cfsr.write(cfsr.bits());
    }

    FAULT_RECORD.record(FaultRecord {
        num: fault_type as u32,
        pc,
        addr,
        caller: frame.as_ref().map_or(0, |f| f.lr),
        handler_pc: exc_return,
        handler_caller: cfsr.bits(),
        tid: idx as u32,
        free_stack_size: psp.saturating_sub(region.base),
        free_heap_size: 0,
    });

    // Switch away directly. PendSV won't do here: returning to a task whose
    // stack pointer faults would fault again before it ran.
    with_task_table(|tasks| {
        if tasks.isolate_faulted(idx).is_err() {
            die("cannot isolate faulted task");
        }
        tasks.request_context_switch();
        let next = tasks.reschedule();
        if next == idx {
            panic!("attempt to return to Task #{idx} after fault");
        }
        // Safety: this leaks a pointer aliasing next into static scope, but
        // we're not going to read it back until the next kernel entry.
        unsafe {
            set_current_task(&tasks.tasks()[next]);
        }
    });
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

// Trap stub for kernel-side callers running in Thread mode, namely the
// scheduler task. Arguments go in r4-r7 and the trap number in r11; results
// come back in r4 and r5 and are written over the first two argument words.
global_asm! {"
    .section .text.ember_kern_trap
    .globl ember_kern_trap
    .type ember_kern_trap,function
    .thumb_func
    ember_kern_trap:
        push {{r4-r7, r11, lr}}
        mov r11, r0
        mov r12, r1
        ldm r12, {{r4-r7}}
        svc #0
        stm r12, {{r4, r5}}
        pop {{r4-r7, r11, pc}}
    ",
}

extern "C" {
    fn ember_kern_trap(nr: u32, regs: *mut [u32; 4]);
}

fn trap(nr: Sysnum, args: [u32; 4]) -> [u32; 2] {
    let mut regs = args;
    // Safety: the stub only touches `regs` and callee-saved registers it
    // restores.
    unsafe { ember_kern_trap(nr as u32, &mut regs) };
    [regs[0], regs[1]]
}

/// The scheduler task runs unprivileged, so it reaches the task table by
/// trapping like anyone else.
pub struct TrapGate;

impl KernelGate for TrapGate {
    fn exec_count(&mut self) -> usize {
        trap(Sysnum::ExecCount, [0; 4])[1] as usize
    }

    fn sched_yield(&mut self) {
        trap(Sysnum::Yield, [0; 4]);
    }

    fn fault_logged(&mut self) {
        trap(Sysnum::FaultLogged, [0; 4]);
    }
}

pub fn scheduler_gate() -> TrapGate {
    TrapGate
}
