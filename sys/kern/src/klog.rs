// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-kernel event log.
//!
//! The kernel has no console. Instead it records notable events into a small
//! ring buffer in RAM, `KLOG`, where a debugger can find it. Each entry holds
//! the source line that recorded it, a generation number (bumped each time
//! the slot is overwritten, so a reader can tell old entries from new), a
//! repeat count, and the event itself. Recording the same event from the same
//! line twice in a row bumps the count instead of using a new slot, which
//! keeps a chatty event from flushing the interesting history.
//!
//! Use the `klog!` macro, which fills in the line number.

use core::cell::RefCell;

use abi::{BlockObject, Priority, UsageError};
use critical_section::Mutex;

use crate::config::KLOG_DEPTH;

/// Something the kernel thought worth remembering.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernEvent {
    None,
    TaskCreated { index: u16, priority: Priority },
    TaskReclaimed(u16),
    CurrentPriority(Priority),
    Blocked { index: u16, object: BlockObject },
    Slept(u16),
    Woke { index: u16, priority: Priority },
    Unblocked { object: BlockObject, count: u16 },
    Granted(u16),
    Stopped(u16),
    Resumed(u16),
    CancelRequested(u16),
    TrapRejected { nr: u32, error: UsageError },
    MailboxFull,
    FaultIsolated(u16),
    FaultLost,
    FaultDrained { tid: u32, failed: u8 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KlogEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// Fixed-size ring of log entries.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [KlogEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    /// Creates an empty ring with every slot holding `blank`.
    pub const fn new(blank: T) -> Self {
        Self {
            last: None,
            buffer: [KlogEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: blank,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // None behaves as an out-of-range index, so the first entry lands in
        // slot 0 and never merges with a blank slot.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let next = last.wrapping_add(1);
            if next >= self.buffer.len() {
                0
            } else {
                next
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = KlogEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// The most recently recorded entry, if any.
    pub fn latest(&self) -> Option<&KlogEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }

    /// Iterates over recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &KlogEntry<T>> + '_ {
        let start = self.last.map_or(0, |l| l + 1);
        let (newer, older) = self.buffer.split_at(start.min(N));
        older.iter().chain(newer).filter(|e| e.count != 0)
    }
}

#[used]
pub static KLOG: Mutex<RefCell<Ringbuf<KernEvent, KLOG_DEPTH>>> =
    Mutex::new(RefCell::new(Ringbuf::new(KernEvent::None)));

/// Records `event` as coming from `line`. Prefer the `klog!` macro.
pub fn record(line: u16, event: KernEvent) {
    critical_section::with(|cs| {
        KLOG.borrow_ref_mut(cs).entry(line, event);
    });
}

/// Runs `body` with a read-only view of the kernel log.
pub fn inspect<R>(
    body: impl FnOnce(&Ringbuf<KernEvent, KLOG_DEPTH>) -> R,
) -> R {
    critical_section::with(|cs| body(&KLOG.borrow_ref(cs)))
}

macro_rules! klog {
    ($event:expr) => {
        $crate::klog::record(line!() as u16, $event)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_counted_not_stored() {
        let mut rb = Ringbuf::<u8, 4>::new(0);
        rb.entry(10, 1);
        rb.entry(10, 1);
        rb.entry(10, 1);
        assert_eq!(rb.last, Some(0));
        assert_eq!(rb.buffer[0].count, 3);

        // Same payload from another line is a new entry.
        rb.entry(11, 1);
        assert_eq!(rb.last, Some(1));
        assert_eq!(rb.latest().map(|e| e.line), Some(11));
    }

    #[test]
    fn wraps_and_bumps_generation() {
        let mut rb = Ringbuf::<u8, 2>::new(0);
        rb.entry(1, 1);
        rb.entry(1, 2);
        rb.entry(1, 3);
        assert_eq!(rb.last, Some(0));
        assert_eq!(rb.buffer[0].payload, 3);
        assert_eq!(rb.buffer[0].generation, 2);
        let order: Vec<u8> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(order, [2, 3]);
    }

    #[test]
    fn iter_skips_blank_slots() {
        let mut rb = Ringbuf::<u8, 4>::new(0);
        assert_eq!(rb.iter().count(), 0);
        rb.entry(1, 7);
        let all: Vec<u8> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(all, [7]);
    }

    #[test]
    fn global_log_accepts_events() {
        record(1, KernEvent::MailboxFull);
        inspect(|rb| assert!(rb.latest().is_some()));
    }
}
