// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel configuration.
//!
//! The boot values are generated by `build.rs` from `EMBER_KCONFIG` and end up
//! as the constants below. At runtime the kernel works from a `KernelConfig`
//! so the same code can be driven with other table sizes or priority ranges
//! (which is mostly useful in tests).

use abi::Priority;
use serde::{Deserialize, Serialize};

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

/// Runtime kernel configuration. It reads from the same RON as the build
/// script, with any field left out taking its boot value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of slots in the scheduler table, including the scheduler task.
    pub task_total: usize,
    /// Floor of the priority range; also the current priority when nothing
    /// else is ready.
    pub lowest_priority: Priority,
    pub highest_priority: Priority,
    /// Priority of the first application task.
    pub start_priority: Priority,
    /// Stack bytes allocated for the first application task.
    pub start_stack_size: u32,
    /// Default stack guard size.
    pub guard_size: u32,
    /// Ticks a round-robin task may run before an equal-priority peer gets a
    /// turn.
    pub rr_quantum: u32,
    /// Delay between fault trace records, in microseconds.
    pub fault_pacing_us: u32,
    /// Longest trace message, in bytes.
    pub trace_data_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            task_total: TASK_TOTAL,
            lowest_priority: Priority(LOWEST_PRIORITY),
            highest_priority: Priority(HIGHEST_PRIORITY),
            start_priority: Priority(START_PRIORITY),
            start_stack_size: START_STACK_SIZE,
            guard_size: GUARD_SIZE,
            rr_quantum: RR_QUANTUM,
            fault_pacing_us: FAULT_PACING_US,
            trace_data_size: TRACE_DATA_SIZE,
        }
    }
}

impl KernelConfig {
    /// Checks that `p` lies within the configured priority range.
    pub fn check_priority(&self, p: Priority) -> Result<(), abi::UsageError> {
        if p.is_within(self.lowest_priority, self.highest_priority) {
            Ok(())
        } else {
            Err(abi::UsageError::PriorityOutOfRange)
        }
    }

    /// Returns a copy of this configuration sized for `task_total` slots.
    pub fn with_task_total(self, task_total: usize) -> Self {
        Self { task_total, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_generated() {
        let c = KernelConfig::default();
        assert_eq!(c.task_total, TASK_TOTAL);
        assert!(c
            .start_priority
            .is_within(c.lowest_priority, c.highest_priority));
        assert!(c.start_stack_size > c.guard_size);
    }

    #[test]
    fn reads_partial_ron() {
        let c: KernelConfig =
            ron::from_str("(task_total: 8, rr_quantum: 5)").unwrap();
        assert_eq!(c.task_total, 8);
        assert_eq!(c.rr_quantum, 5);
        assert_eq!(c.start_priority, Priority(START_PRIORITY));

        let text = ron::to_string(&c).unwrap();
        assert_eq!(ron::from_str::<KernelConfig>(&text).unwrap(), c);
    }

    #[test]
    fn priority_range_is_inclusive() {
        let c = KernelConfig::default();
        assert!(c.check_priority(c.lowest_priority).is_ok());
        assert!(c.check_priority(c.highest_priority).is_ok());
        assert_eq!(
            c.check_priority(Priority(c.highest_priority.0 + 1)),
            Err(abi::UsageError::PriorityOutOfRange)
        );
    }
}
