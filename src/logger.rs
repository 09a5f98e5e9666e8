//! Logging infrastructure for the chainloader
//!
//! Records go through the `log` crate to a console sink installed once at
//! startup. On firmware the sink is ConOut (see
//! [`efi::ConOutSink`](crate::firmware::efi::ConOutSink)).

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

/// Somewhere to write log lines
pub trait LogSink: Sync {
    fn write_str(&self, s: &str);
}

/// Adapter so `write!` can target a sink
struct SinkWriter<'a>(&'a dyn LogSink);

impl Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Console logger implementation
struct ConsoleLogger {
    sink: &'static dyn LogSink,
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let level_str = match record.level() {
                Level::Error => "\x1b[31mERROR\x1b[0m",
                Level::Warn => "\x1b[33mWARN\x1b[0m ",
                Level::Info => "\x1b[32mINFO\x1b[0m ",
                Level::Debug => "\x1b[34mDEBUG\x1b[0m",
                Level::Trace => "\x1b[35mTRACE\x1b[0m",
            };

            // Format: [LEVEL] target: message
            let _ = write!(
                SinkWriter(self.sink),
                "[{}] {}: {}\r\n",
                level_str,
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: Once<ConsoleLogger> = Once::new();

/// Initialize the logging subsystem
///
/// Only the first call installs a sink; later calls just change the level.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) {
    let logger = LOGGER.call_once(|| ConsoleLogger { sink });
    if log::set_logger(logger).is_err() {
        log::debug!("Chainload: Logger already installed");
    }
    set_level(level);
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Raise the maximum log level to at least `level`
///
/// A host that already logs more than `level` keeps its setting.
pub fn raise_level(level: LevelFilter) {
    if level > log::max_level() {
        set_level(level);
    }
}
