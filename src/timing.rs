//! Cycle-counter timing for the session management plane.
//!
//! SM retransmission and timeout decisions are driven by the CPU cycle
//! counter, converted to milliseconds with a frequency estimate measured
//! once at Nexus construction.

use std::time::{Duration, Instant};

/// Read the CPU cycle counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        // Nanosecond-granularity stand-in, so the measured frequency comes
        // out near 1.0 GHz and all conversions stay consistent.
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the cycle-counter frequency in GHz.
///
/// Spins for a few milliseconds against the monotonic clock. Called once
/// per process; the result is cached by the Nexus.
pub fn measure_freq_ghz() -> f64 {
    let start = Instant::now();
    let start_cycles = rdtsc();

    std::thread::sleep(Duration::from_millis(10));

    let cycles = rdtsc().wrapping_sub(start_cycles);
    let nanos = start.elapsed().as_nanos() as u64;
    cycles as f64 / nanos.max(1) as f64
}

/// Convert a cycle count to milliseconds.
#[inline]
pub fn to_ms(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1_000_000.0)
}

/// Convert a cycle count to seconds.
#[inline]
pub fn to_sec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1_000_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_measure_freq_plausible() {
        let ghz = measure_freq_ghz();
        // Anything from embedded cores to server turbo clocks.
        assert!(ghz > 0.1 && ghz < 10.0, "implausible frequency: {ghz}");
    }

    #[test]
    fn test_to_ms() {
        // 2 GHz: 10M cycles is 5 ms.
        let ms = to_ms(10_000_000, 2.0);
        assert!((ms - 5.0).abs() < 1e-9);
        assert!((to_sec(10_000_000, 2.0) - 0.005).abs() < 1e-12);
    }
}
