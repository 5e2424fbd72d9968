//! `log` facade backed by the serial console
//!
//! The core uses `log::info!`/`warn!`/`error!` for printk-style
//! diagnostics; the boot banner and the exception dump use the raw
//! `println!` macros directly so they work even if the logger is not up.

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial::_print(format_args!(
                "[{:5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger. Called once, right after `serial::init`.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
