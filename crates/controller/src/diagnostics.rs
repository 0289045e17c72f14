//! Periodic host health snapshot for the audit trail.

use std::fmt;

use sysinfo::System;

#[derive(Debug, Clone, Copy)]
pub struct Diagnostics {
    pub used_memory_kb: u64,
    pub total_memory_kb: u64,
    pub host_uptime_secs: u64,
    pub process_uptime_secs: u64,
    pub load_one: f64,
}

impl Diagnostics {
    pub fn free_memory_kb(&self) -> u64 {
        self.total_memory_kb.saturating_sub(self.used_memory_kb)
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory {}/{} kB used ({} kB free), load {:.2}, host up {}s, controller up {}s",
            self.used_memory_kb,
            self.total_memory_kb,
            self.free_memory_kb(),
            self.load_one,
            self.host_uptime_secs,
            self.process_uptime_secs
        )
    }
}

/// Reuses one `System` so refreshes stay cheap.
pub struct Probe {
    sys: System,
}

impl Probe {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    pub fn sample(&mut self, process_uptime_secs: u64) -> Diagnostics {
        self.sys.refresh_memory();
        Diagnostics {
            used_memory_kb: self.sys.used_memory() / 1024,
            total_memory_kb: self.sys.total_memory() / 1024,
            host_uptime_secs: System::uptime(),
            process_uptime_secs,
            load_one: System::load_average().one,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
