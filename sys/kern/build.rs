// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=EMBER_KCONFIG");

    let kconfig: KernelConfig = match env::var("EMBER_KCONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(env::VarError::NotPresent) => KernelConfig::default(),
        Err(e) => return Err(e.into()),
    };
    kconfig.validate()?;

    generate_consts(&kconfig)
}

fn generate_consts(
    kconfig: &KernelConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let out = &PathBuf::from(
        env::var_os("OUT_DIR").ok_or("OUT_DIR not set by cargo")?,
    );
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(file, "pub const TASK_TOTAL: usize = {};", kconfig.task_total)?;
    writeln!(
        file,
        "pub const LOWEST_PRIORITY: i8 = {};",
        kconfig.lowest_priority
    )?;
    writeln!(
        file,
        "pub const HIGHEST_PRIORITY: i8 = {};",
        kconfig.highest_priority
    )?;
    writeln!(
        file,
        "pub const START_PRIORITY: i8 = {};",
        kconfig.start_priority
    )?;
    writeln!(
        file,
        "pub const START_STACK_SIZE: u32 = {};",
        kconfig.start_stack_size
    )?;
    writeln!(file, "pub const GUARD_SIZE: u32 = {};", kconfig.guard_size)?;
    writeln!(file, "pub const RR_QUANTUM: u32 = {};", kconfig.rr_quantum)?;
    writeln!(
        file,
        "pub const FAULT_PACING_US: u32 = {};",
        kconfig.fault_pacing_us
    )?;
    writeln!(
        file,
        "pub const TRACE_DATA_SIZE: usize = {};",
        kconfig.trace_data_size
    )?;
    writeln!(
        file,
        "pub const MAILBOX_DEPTH: usize = {};",
        kconfig.mailbox_depth
    )?;
    writeln!(file, "pub const KLOG_DEPTH: usize = {};", kconfig.klog_depth)?;

    Ok(())
}

/// Build-time kernel configuration, normally supplied by the application's
/// build tooling as RON in `EMBER_KCONFIG`. Any field left out takes the
/// default below.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct KernelConfig {
    task_total: usize,
    lowest_priority: i8,
    highest_priority: i8,
    start_priority: i8,
    start_stack_size: u32,
    guard_size: u32,
    rr_quantum: u32,
    fault_pacing_us: u32,
    trace_data_size: usize,
    mailbox_depth: usize,
    klog_depth: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            task_total: 16,
            lowest_priority: 0,
            highest_priority: 31,
            start_priority: 21,
            start_stack_size: 4096,
            guard_size: 32,
            rr_quantum: 10,
            fault_pacing_us: 2000,
            trace_data_size: 32,
            mailbox_depth: 8,
            klog_depth: 64,
        }
    }
}

impl KernelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.task_total < 2 {
            return Err(format!(
                "task_total must leave room for the scheduler and at least \
                 one task, got {}",
                self.task_total
            ));
        }
        // Task IDs are u16 and the top of the range is used for sentinels.
        if self.task_total > usize::from(u16::MAX >> 1) {
            return Err(format!("task_total {} too large", self.task_total));
        }
        if self.lowest_priority > self.highest_priority {
            return Err(format!(
                "priority range [{}, {}] is empty",
                self.lowest_priority, self.highest_priority
            ));
        }
        if self.start_priority < self.lowest_priority
            || self.start_priority > self.highest_priority
        {
            return Err(format!(
                "start_priority {} outside [{}, {}]",
                self.start_priority,
                self.lowest_priority,
                self.highest_priority
            ));
        }
        if self.start_stack_size <= self.guard_size {
            return Err("start_stack_size must exceed guard_size".into());
        }
        if self.rr_quantum == 0 {
            return Err("rr_quantum must be at least one tick".into());
        }
        if self.mailbox_depth < 2 || !self.mailbox_depth.is_power_of_two() {
            return Err(format!(
                "mailbox_depth must be a power of two >= 2, got {}",
                self.mailbox_depth
            ));
        }
        if self.klog_depth == 0 {
            return Err("klog_depth must be nonzero".into());
        }
        Ok(())
    }
}
