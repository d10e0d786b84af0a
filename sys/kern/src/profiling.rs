// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event hooks for timing measurements.
//!
//! The kernel doesn't know how a board wants to observe it. A board that does
//! fills in an `EventsTable` and hands it to `configure_events_table` during
//! startup; typical hooks toggle GPIOs for a logic analyzer. Hooks run inside
//! the kernel critical section, so keep them short.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks supplied by the board.
///
/// Every hook must be provided; stub the ones you don't care about with
/// `|| ()`.
pub struct EventsTable {
    /// Entry to the trap dispatcher, with the trap number.
    pub trap_enter: fn(u32),
    /// Exit from the trap dispatcher.
    pub trap_exit: fn(),
    /// Entry to the deferred context switch handler.
    pub switch_enter: fn(),
    /// Exit from the deferred context switch handler.
    pub switch_exit: fn(),
    /// Entry to the kernel's timer ISR.
    pub timer_isr_enter: fn(),
    /// Exit from the kernel's timer ISR.
    pub timer_isr_exit: fn(),
    /// The current task changed, with the new task's index.
    pub context_switch: fn(usize),
    /// The main loop is about to enter the low-power wait.
    pub idle_enter: fn(),
    /// The main loop came back from the low-power wait.
    pub idle_exit: fn(),
    /// The fault reporter started draining a record for this task index.
    pub fault_drain: fn(u32),
}

/// Supplies the kernel with an events table.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Null until `configure_events_table` is called. Any non-null value came
/// from a `&'static`.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // Safety: only ever written from a valid `&'static EventsTable`.
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_trap_enter(nr: u32) {
    if let Some(t) = table() {
        (t.trap_enter)(nr)
    }
}

pub(crate) fn event_trap_exit() {
    if let Some(t) = table() {
        (t.trap_exit)()
    }
}

#[cfg_attr(not(target_arch = "arm"), allow(dead_code))]
pub(crate) fn event_switch_enter() {
    if let Some(t) = table() {
        (t.switch_enter)()
    }
}

#[cfg_attr(not(target_arch = "arm"), allow(dead_code))]
pub(crate) fn event_switch_exit() {
    if let Some(t) = table() {
        (t.switch_exit)()
    }
}

pub(crate) fn event_timer_isr_enter() {
    if let Some(t) = table() {
        (t.timer_isr_enter)()
    }
}

pub(crate) fn event_timer_isr_exit() {
    if let Some(t) = table() {
        (t.timer_isr_exit)()
    }
}

pub(crate) fn event_context_switch(idx: usize) {
    if let Some(t) = table() {
        (t.context_switch)(idx)
    }
}

pub(crate) fn event_idle_enter() {
    if let Some(t) = table() {
        (t.idle_enter)()
    }
}

pub(crate) fn event_idle_exit() {
    if let Some(t) = table() {
        (t.idle_exit)()
    }
}

pub(crate) fn event_fault_drain(tid: u32) {
    if let Some(t) = table() {
        (t.fault_drain)(tid)
    }
}
