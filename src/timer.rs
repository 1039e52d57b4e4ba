//! Monotone wall-clock with the best precision available on the platform
//!
//! The default source is `clock_gettime(CLOCK_MONOTONIC)`, which is monotone
//! within a process and comparable between processes on the same node (both
//! properties the shell-mode record hand-off depends on). Building with the
//! `tsc` feature on x86-64 switches to the hardware cycle counter scaled by
//! `seconds_per_cycle`, probed once from `/proc/cpuinfo` at startup.

use anyhow::{Context, Result};

/// Process-local clock. Cheap to copy; create once at monitor initialization.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// Seconds per CPU cycle when the cycle-counter source is active.
    #[cfg_attr(not(all(feature = "tsc", target_arch = "x86_64")), allow(dead_code))]
    seconds_per_cycle: f64,
}

impl Clock {
    pub fn new() -> Self {
        let freq = cpu_clock_hz().unwrap_or(0.0);
        let seconds_per_cycle = if freq > 0.0 { 1.0 / freq } else { 0.0 };
        Clock { seconds_per_cycle }
    }

    /// Current time in seconds. Monotone within this process.
    #[inline]
    pub fn now(&self) -> f64 {
        #[cfg(all(feature = "tsc", target_arch = "x86_64"))]
        {
            if self.seconds_per_cycle > 0.0 {
                let tsc = unsafe { core::arch::x86_64::_rdtsc() };
                return tsc as f64 * self.seconds_per_cycle;
            }
        }
        monotonic_seconds()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[inline]
fn monotonic_seconds() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1.0e-9
}

/// Read the CPU clock frequency in Hz from `/proc/cpuinfo`, once.
///
/// Also feeds the per-core peak-flops constant used by the FLOPS report.
/// Returns an error on platforms without `/proc/cpuinfo` or without a
/// recognizable `cpu MHz` line; callers fall back to a generic constant.
pub fn cpu_clock_hz() -> Result<f64> {
    let info = std::fs::read_to_string("/proc/cpuinfo").context("cannot open /proc/cpuinfo")?;
    parse_cpu_mhz(&info)
        .map(|mhz| mhz * 1.0e6)
        .context("no cpu MHz line in /proc/cpuinfo")
}

fn parse_cpu_mhz(cpuinfo: &str) -> Option<f64> {
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("cpu MHz") {
            let value = rest.trim_start_matches([' ', '\t', ':']).trim();
            if let Ok(mhz) = value.parse::<f64>() {
                if mhz > 0.0 {
                    return Some(mhz);
                }
            }
        }
    }
    None
}
