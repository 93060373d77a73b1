//! Kernel logger
//!
//! Backs the `log` facade with the kernel console, so subsystems log with
//! `log::info!`/`log::warn!` and everything lands in the ring and on the
//! serial line with a level tag.

use log::{Level, LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error => crate::println!("error: {}", record.args()),
            Level::Warn => crate::println!("warn: {}", record.args()),
            _ => crate::println!("{}", record.args()),
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once during early boot; a second call
/// is harmless.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
