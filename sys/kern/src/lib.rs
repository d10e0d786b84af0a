// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ember kernel.
//!
//! This is the scheduling core of a small preemptive RTOS: a fixed table of
//! tasks, a priority engine deciding which of them runs, a block/wake
//! protocol for waiting on objects, the trap dispatcher through which tasks
//! ask for all of this, and a fault reporter.
//!
//! Slot 0 of the table belongs to the scheduler task, a privileged-by-role
//! (though not by hardware) task. It doesn't count toward the current
//! priority, but it takes a turn in every round of the round robin. Its main
//! loop reports faults, idles the processor when nothing else is ready, and
//! otherwise yields to whoever should run.
//!
//! Code outside the `arch` module is portable. On a host build `arch` is a
//! simulation backend, which is what the tests run against.
//!
//! # Design principles
//!
//! 1. Static configuration. Table size and priority range are fixed at build
//!    time from the kernel config.
//! 2. A strong preference for safe code where reasonable.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    algorithms. The task table is small; linear scans are fine.
//! 4. Interrupt handlers never touch the task table. They post requests to
//!    the mailbox, which the kernel applies at its next entry.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod klog;

#[macro_use]
pub mod arch;

pub mod block;
pub mod config;
pub mod err;
pub mod fail;
pub mod fault;
pub mod mailbox;
pub mod profiling;
pub mod sched;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod time;
