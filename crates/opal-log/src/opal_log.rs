use chrono::Local;
use log::{Level, Log, Metadata, Record, SetLoggerError};

/// Simple stdout logger with wall-clock timestamps.
pub struct OpalLogger {
    max_level: Level,
}

impl OpalLogger {
    pub const fn new(max_level: Level) -> Self {
        Self { max_level }
    }
}

impl Log for OpalLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = Local::now();
            println!(
                "{} {:<5} [{}] {}",
                now.format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Installs the logger as the global `log` backend.
pub fn init(max_level: Level) -> Result<(), SetLoggerError> {
    let logger = Box::leak(Box::new(OpalLogger::new(max_level)));
    log::set_logger(logger)?;
    log::set_max_level(max_level.to_level_filter());
    Ok(())
}
