// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requests from interrupt context.
//!
//! Interrupt handlers outside the kernel (I/O completion, mostly) need to
//! wake tasks, but they can't touch the task table: they may have preempted
//! the kernel halfway through changing it. Instead they post a `Request` to
//! `MAILBOX`, a lock-free queue, and pend a context switch. The kernel drains
//! the queue whenever it next holds the table (trap entry, tick, or the
//! context switch itself) and applies the requests in order.

use abi::{BlockObject, Priority, TaskId, WakeReason};
use heapless::mpmc::MpMcQueue;

use crate::config::MAILBOX_DEPTH;
use crate::klog::KernEvent;
use crate::task::TaskTable;

/// A deferred change to the task table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// `wake` the named task at `priority`.
    Wake { task: TaskId, priority: Priority },
    /// Release everyone waiting on `object`, then raise the ceiling to the
    /// most urgent of them.
    UnblockAll {
        object: BlockObject,
        reason: WakeReason,
    },
    /// Hand `object` to its most urgent waiter.
    Grant { object: BlockObject },
    /// Reconsider which task should run.
    ContextSwitch,
}

pub struct Mailbox {
    queue: MpMcQueue<Request, MAILBOX_DEPTH>,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self {
            queue: MpMcQueue::new(),
        }
    }

    /// Queues `req` and pends a context switch so the kernel gets around to
    /// it. If the queue is full the request is handed back.
    pub fn post(&self, req: Request) -> Result<(), Request> {
        if let Err(req) = self.queue.enqueue(req) {
            klog!(KernEvent::MailboxFull);
            return Err(req);
        }
        crate::arch::pend_context_switch();
        Ok(())
    }

    /// Applies every queued request to `table`, oldest first. Returns how
    /// many there were.
    pub fn drain(&self, table: &mut TaskTable<'_>) -> usize {
        let mut n = 0;
        while let Some(req) = self.queue.dequeue() {
            table.apply(req);
            n += 1;
        }
        n
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel's mailbox, drained by the arch entry points.
pub static MAILBOX: Mailbox = Mailbox::new();

/// Asks the kernel to `wake` a task from interrupt context.
pub fn request_wake(task: TaskId, priority: Priority) -> Result<(), Request> {
    MAILBOX.post(Request::Wake { task, priority })
}

/// Asks the kernel to release everyone waiting on `object` from interrupt
/// context. The released priority is applied directly when the request is
/// drained, since there is nobody to hand it back to.
pub fn request_unblock_all(
    object: BlockObject,
    reason: WakeReason,
) -> Result<(), Request> {
    MAILBOX.post(Request::UnblockAll { object, reason })
}

/// Asks the kernel to reconsider which task runs.
pub fn request_context_switch() -> Result<(), Request> {
    MAILBOX.post(Request::ContextSwitch)
}

impl TaskTable<'_> {
    /// Applies one deferred request. Requests naming tasks that don't exist
    /// are dropped, as the same trap would have been refused.
    pub fn apply(&mut self, req: Request) {
        match req {
            Request::Wake { task, priority } => {
                if let Ok(index) = self.check_thread_id(task) {
                    self.wake(Some(index), priority);
                }
            }
            Request::UnblockAll { object, reason } => {
                if let Some(p) = self.unblock_all(object, reason) {
                    self.wake(None, p);
                }
            }
            Request::Grant { object } => {
                self.grant(object);
            }
            Request::ContextSwitch => self.request_context_switch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::{spawn, table};

    const B: BlockObject = BlockObject(0x2000_0400);

    #[test]
    fn requests_apply_in_order_on_drain() {
        let mailbox = Mailbox::new();
        let mut t = table(4);
        let a = spawn(&mut t, 3);
        let b = spawn(&mut t, 6);
        t.block(a, B, None);
        t.block(b, B, None);
        t.take_switch_request();

        mailbox
            .post(Request::UnblockAll {
                object: B,
                reason: WakeReason::Transfer,
            })
            .unwrap();
        mailbox
            .post(Request::Wake {
                task: TaskId(a as u16),
                priority: Priority(12),
            })
            .unwrap();

        // Nothing happens until the kernel drains.
        assert!(!t.task(a).unwrap().is_active());

        assert_eq!(mailbox.drain(&mut t), 2);
        assert_eq!(t.task(b).unwrap().wake_reason(), WakeReason::Transfer);
        assert_eq!(t.task(a).unwrap().priority(), Priority(12));
        assert_eq!(t.current_priority(), Priority(12));
        assert!(t.switch_pending());
        assert_eq!(mailbox.drain(&mut t), 0);
    }

    #[test]
    fn full_mailbox_hands_request_back() {
        let mailbox = Mailbox::new();
        let req = Request::Grant { object: B };
        let mut accepted = 0;
        while mailbox.post(req).is_ok() {
            accepted += 1;
            assert!(accepted <= MAILBOX_DEPTH);
        }
        assert!(accepted >= MAILBOX_DEPTH - 1);
        assert_eq!(mailbox.post(req), Err(req));

        // Draining makes room again.
        let mut t = table(2);
        assert_eq!(mailbox.drain(&mut t), accepted);
        assert_eq!(mailbox.post(req), Ok(()));
    }

    #[test]
    fn bogus_targets_are_dropped() {
        let mailbox = Mailbox::new();
        let mut t = table(4);
        let before = t.current_priority();
        for task in [TaskId(0), TaskId(2), TaskId(99)] {
            mailbox
                .post(Request::Wake {
                    task,
                    priority: Priority(20),
                })
                .unwrap();
        }
        assert_eq!(mailbox.drain(&mut t), 3);
        assert_eq!(t.current_priority(), before);
        assert_eq!(t.task(0).unwrap().priority(), before);
    }

    #[test]
    fn grant_request_picks_one_waiter() {
        let mailbox = Mailbox::new();
        let mut t = table(4);
        let a = spawn(&mut t, 3);
        let b = spawn(&mut t, 6);
        t.block(a, B, None);
        t.block(b, B, None);
        mailbox.post(Request::Grant { object: B }).unwrap();
        mailbox.drain(&mut t);
        assert!(t.task(b).unwrap().is_active());
        assert!(!t.task(a).unwrap().is_active());
    }
}
