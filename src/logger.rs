//! Logging infrastructure
//!
//! This crate never owns a UART or console directly — bus and register
//! access is already borrowed through [`crate::hsm::dma::PciIo`], and a
//! log sink is borrowed the same way. The embedding firmware implements
//! [`LogSink`] against whatever serial port or debug console it has.

use crate::arch::x86_64::rdtsc;
use core::fmt::Arguments;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

/// Initial TSC value at boot (set during `init`), used to report relative
/// rather than absolute timestamps.
static BOOT_TSC: AtomicU64 = AtomicU64::new(0);

/// Get relative TSC ticks since boot, in thousands, for readability.
pub fn get_timestamp_k() -> u64 {
    let current = rdtsc();
    let boot = BOOT_TSC.load(Ordering::Relaxed);
    current.saturating_sub(boot) / 1000
}

/// Where log lines go. One call per enabled log record.
pub trait LogSink: Sync {
    fn write_line(&self, level: Level, timestamp_k: u64, args: &Arguments);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

struct GlobalLogger;

impl log::Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            sink.write_line(record.level(), get_timestamp_k(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: GlobalLogger = GlobalLogger;

/// Install `sink` as the global log destination and record the boot TSC
/// for relative timestamps. Must be called at most once.
pub fn init(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
    BOOT_TSC.store(rdtsc(), Ordering::Relaxed);

    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .expect("logger already initialized");
}

/// Raise or lower the global log level after `init`.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
