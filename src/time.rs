//! Millisecond-resolution polling timeouts
//!
//! All "waits" in this driver are spin-with-stall loops bounded by a
//! wall-clock deadline; there is no interrupt-driven completion path.

#[cfg(target_arch = "x86_64")]
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_arch = "x86_64")]
static TSC_HZ_K: AtomicU64 = AtomicU64::new(0);

/// Record the TSC frequency (in kHz) once, at driver init.
///
/// Callers that never call this get a conservative fallback frequency so
/// `Timeout` still terminates, just with less accurate wall-clock timing.
#[cfg(target_arch = "x86_64")]
pub fn calibrate(tsc_khz: u64) {
    TSC_HZ_K.store(tsc_khz.max(1), Ordering::Relaxed);
}

#[cfg(target_arch = "x86_64")]
fn tsc_khz() -> u64 {
    let hz = TSC_HZ_K.load(Ordering::Relaxed);
    if hz == 0 { 1_000_000 } else { hz }
}

#[cfg(target_arch = "x86_64")]
fn now_ticks() -> u64 {
    crate::arch::x86_64::rdtsc()
}

#[cfg(not(target_arch = "x86_64"))]
fn now_ticks() -> u64 {
    0
}

#[cfg(not(target_arch = "x86_64"))]
fn tsc_khz() -> u64 {
    1
}

/// A deadline a fixed number of milliseconds in the future.
///
/// Construct with [`Timeout::from_ms`], then poll [`Timeout::is_expired`]
/// in a loop, calling [`core::hint::spin_loop`] between checks. Every
/// iteration of the polling loops in this crate counts as one logical
/// "stall" of approximately one millisecond.
pub struct Timeout {
    deadline_ticks: u64,
}

impl Timeout {
    /// Build a timeout that expires `ms` milliseconds from now.
    pub fn from_ms(ms: u64) -> Self {
        let ticks_per_ms = tsc_khz();
        Timeout {
            deadline_ticks: now_ticks().saturating_add(ticks_per_ms.saturating_mul(ms)),
        }
    }

    /// True once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        now_ticks() >= self.deadline_ticks
    }
}

/// Busy-wait for approximately one millisecond.
///
/// Used by polling loops that need to attribute one logical "stall" per
/// iteration (matching the firmware-supplied millisecond stall primitive
/// the source relies on), independent of whatever `Timeout` is also being
/// checked in the same loop.
pub fn stall_1ms() {
    let t = Timeout::from_ms(1);
    while !t.is_expired() {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ms_timeout_is_immediately_expired() {
        #[cfg(target_arch = "x86_64")]
        calibrate(1_000_000);
        let t = Timeout::from_ms(0);
        assert!(t.is_expired());
    }
}
