// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A board for driving the kernel from integration tests.

use abi::{KernelEvent, RegionDesc};
use kern::config::KernelConfig;
use kern::err::{IsolationError, TraceError};
use kern::startup::{Platform, TraceRecord};
use kern::task::{EntryPoint, Task, TaskTable};

#[derive(Default)]
pub struct Board {
    pub notifications: Vec<(KernelEvent, u32)>,
    pub traces: Vec<String>,
    pub delays: u32,
    pub idles: usize,
    next_stack: u32,
}

impl Platform for Board {
    fn alloc_stack(&mut self, size: u32) -> Option<u32> {
        let base = 0x2001_0000 + self.next_stack;
        self.next_stack += size;
        Some(base)
    }

    fn enable_isolation(
        &mut self,
        _region: RegionDesc,
    ) -> Result<(), IsolationError> {
        Ok(())
    }

    fn enter_low_power_wait(&mut self) {
        self.idles += 1;
    }

    fn notify(&mut self, event: KernelEvent, context: u32) {
        self.notifications.push((event, context));
    }

    fn emit_trace(
        &mut self,
        record: &TraceRecord<'_>,
    ) -> Result<(), TraceError> {
        self.traces.push(record.message.to_string());
        Ok(())
    }

    fn delay_us(&mut self, us: u32) {
        self.delays += us;
    }

    fn scheduler_region(&self) -> RegionDesc {
        RegionDesc {
            base: 0x2000_0000,
            size: 0x800,
        }
    }

    fn init_entry(&self) -> EntryPoint {
        EntryPoint {
            pc: 0x0800_1001,
            arg: 0,
        }
    }
}

/// A table of `n` slots with the scheduler task set up, as `start_kernel`
/// builds it.
pub fn table(n: usize, board: &Board) -> TaskTable<'static> {
    let tasks: Vec<Task> = (0..n).map(Task::vacant).collect();
    let mut table = TaskTable::new(
        Box::leak(tasks.into_boxed_slice()),
        KernelConfig::default().with_task_total(n),
    );
    table.init_scheduler(
        EntryPoint {
            pc: 0x0800_0001,
            arg: 0,
        },
        board.scheduler_region(),
    );
    table
}
