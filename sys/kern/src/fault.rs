// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fault capture and reporting.
//!
//! The hardware fault handler can't do much: it runs in handler mode with a
//! possibly-corrupt task underneath it. So it fills in the single
//! `FaultRecord` slot and isolates the task, and the scheduler task's main
//! loop reports the record later through the platform's trace channel.
//!
//! The record's `num` is the pending flag. While a record is pending, further
//! faults are dropped and counted rather than overwriting it.

use core::cell::Cell;
use core::fmt::Write;
use core::sync::atomic::{AtomicU32, Ordering};

use abi::{FaultRecord, TraceKind};
use critical_section::Mutex;

use crate::config::KernelConfig;
use crate::klog::KernEvent;
use crate::startup::{Platform, TraceRecord};

/// Number of trace records emitted per fault.
pub const RECORDS_PER_FAULT: usize = 7;

const IDLE: FaultRecord = FaultRecord {
    num: 0,
    pc: 0,
    addr: 0,
    caller: 0,
    handler_pc: 0,
    handler_caller: 0,
    tid: 0,
    free_stack_size: 0,
    free_heap_size: 0,
};

/// Single-slot mailbox between the fault handler and the reporter.
pub struct FaultMailbox {
    record: Mutex<Cell<FaultRecord>>,
    lost: AtomicU32,
}

impl FaultMailbox {
    pub const fn new() -> Self {
        Self {
            record: Mutex::new(Cell::new(IDLE)),
            lost: AtomicU32::new(0),
        }
    }

    /// Deposits `rec`. Returns `false`, and counts the fault as lost, if a
    /// record is already pending. A record with `num == 0` is meaningless
    /// and ignored.
    pub fn record(&self, rec: FaultRecord) -> bool {
        if !rec.is_pending() {
            return false;
        }
        let stored = critical_section::with(|cs| {
            let slot = self.record.borrow(cs);
            if slot.get().is_pending() {
                false
            } else {
                slot.set(rec);
                true
            }
        });
        if !stored {
            self.lost.fetch_add(1, Ordering::Relaxed);
            klog!(KernEvent::FaultLost);
        }
        stored
    }

    /// Returns the pending record, if there is one.
    pub fn pending(&self) -> Option<FaultRecord> {
        let rec = critical_section::with(|cs| self.record.borrow(cs).get());
        rec.is_pending().then_some(rec)
    }

    /// Clears the pending flag. This is what the `FaultLogged` trap does.
    pub fn acknowledge(&self) {
        critical_section::with(|cs| {
            let slot = self.record.borrow(cs);
            let mut rec = slot.get();
            rec.num = 0;
            slot.set(rec);
        });
    }

    /// Faults dropped because another was pending.
    pub fn lost(&self) -> u32 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl Default for FaultMailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's fault slot, written by the arch fault handler.
#[used]
pub static FAULT_RECORD: FaultMailbox = FaultMailbox::new();

/// Emits the pending fault, if any, as seven trace records, then calls
/// `acknowledge` to clear it. Returns whether there was anything to report.
///
/// Emission failures are counted and logged but never stop the sequence or
/// the acknowledgment; a fault that can't be reported still has to be
/// cleared or the slot stays jammed.
pub fn check_faults<P: Platform + ?Sized>(
    faults: &FaultMailbox,
    platform: &mut P,
    config: &KernelConfig,
    acknowledge: impl FnOnce(),
) -> bool {
    let Some(rec) = faults.pending() else {
        return false;
    };
    crate::profiling::event_fault_drain(rec.tid);

    let mut failed = 0u8;
    for step in 0..RECORDS_PER_FAULT {
        let mut text = heapless::String::<MESSAGE_MAX>::new();
        let (kind, address) = describe(&rec, step, &mut Truncating(&mut text));
        let record = TraceRecord {
            kind,
            tid: rec.tid,
            address,
            message: truncate(&text, config.trace_data_size),
        };
        if platform.emit_trace(&record).is_err() {
            failed = failed.saturating_add(1);
        }
        platform.delay_us(config.fault_pacing_us);
    }

    klog!(KernEvent::FaultDrained {
        tid: rec.tid,
        failed
    });
    acknowledge();
    true
}

/// Formats trace record number `step` of `rec` into `out`, returning its
/// severity and the address it is tagged with.
fn describe(
    rec: &FaultRecord,
    step: usize,
    out: &mut impl Write,
) -> (TraceKind, u32) {
    // Overflowing `out` just truncates, so the results are ignored.
    match step {
        0 => {
            write!(out, "fault:{}", rec.num).ok();
            (TraceKind::Fatal, rec.pc.wrapping_add(1))
        }
        1 => {
            write!(out, "addr:{:#x}", rec.addr).ok();
            (TraceKind::Fatal, rec.pc.wrapping_add(1))
        }
        2 => {
            out.write_str("caller").ok();
            (TraceKind::Message, rec.caller)
        }
        3 => {
            write!(out, "stack:{}", rec.free_stack_size).ok();
            (TraceKind::Message, rec.pc.wrapping_add(1))
        }
        4 => {
            write!(out, "heap:{}", rec.free_heap_size).ok();
            (TraceKind::Message, rec.pc.wrapping_add(1))
        }
        5 => {
            out.write_str("root pc").ok();
            (TraceKind::Message, rec.handler_pc.wrapping_add(1))
        }
        _ => {
            out.write_str("root caller").ok();
            (TraceKind::Message, rec.handler_caller)
        }
    }
}

/// Longest message we ever format, before truncation to the configured trace
/// size.
const MESSAGE_MAX: usize = 32;

/// Cuts `s` to at most `limit` bytes. Our messages are ASCII, but stay on a
/// character boundary regardless.
fn truncate(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `fmt::Write` adapter that drops whatever doesn't fit instead of failing
/// the whole write.
struct Truncating<'a, const N: usize>(&'a mut heapless::String<N>);

impl<const N: usize> Write for Truncating<'_, N> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}
