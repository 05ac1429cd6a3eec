//! Wires the `log` crate's facade onto the console (spec.md §8):
//! `error!`/`warn!`/`info!`/`debug!`/`trace!` calls anywhere in the
//! kernel end up going through the same buffered line discipline as
//! `println!`, prefixed with level and, where known, hart id.

use crate::console::println;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let hart = unsafe { crate::proc::cpuid() };
        println!("[{:<5} hart{}] {}", record.level(), hart, record.args());
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. Called once, from hart 0's side of the
/// boot sequence, after the console is up.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Info))
        .ok();
}
