//! Host resource probing

use std::sync::Mutex;
use sysinfo::System;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of the host's currently available memory
pub trait SystemProbe: Send + Sync {
    fn available_memory_gb(&self) -> f64;
}

/// Probe backed by `sysinfo`, refreshed on every query
pub struct SysinfoProbe {
    sys: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn available_memory_gb(&self) -> f64 {
        let mut sys = match self.sys.lock() {
            Ok(sys) => sys,
            Err(poisoned) => poisoned.into_inner(),
        };
        sys.refresh_memory();
        sys.available_memory() as f64 / BYTES_PER_GB
    }
}

/// Probe reporting a fixed value
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub f64);

impl SystemProbe for FixedProbe {
    fn available_memory_gb(&self) -> f64 {
        self.0
    }
}
