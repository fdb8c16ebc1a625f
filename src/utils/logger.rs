/*
 * Kernel Logging
 *
 * Adapter between the log crate facade and the serial console. Installed
 * once, first thing in boot, so every later subsystem can use the log
 * macros without caring where the bytes go.
 */

use log::{Level, LevelFilter, Metadata, Record};

use crate::serial_println;

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger. The serial console must already be up.
pub fn init() {
    match log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info)) {
        Ok(()) => serial_println!("logger initialized"),
        Err(err) => serial_println!("logger init failed: {}", err),
    }
}
