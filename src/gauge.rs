//! Peak memory observation for job progress

/// Source of the process's peak memory use
pub trait MemoryGauge {
    /// High-water mark in bytes, 0 if unknown
    fn peak_bytes(&self) -> u64;
}

/// Reads the resident-set high-water mark of the current process
///
/// Uses `VmHWM` from `/proc/self/status`; other platforms report 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl MemoryGauge for ProcessMemory {
    fn peak_bytes(&self) -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_vm_hwm(&status))
            .unwrap_or(0)
    }
}

fn parse_vm_hwm(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmHWM:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Gauge that always reports the same value
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedGauge(pub u64);

impl MemoryGauge for FixedGauge {
    fn peak_bytes(&self) -> u64 {
        self.0
    }
}
