//! Process-wide `log` installation (AMBIENT).
//!
//! The teacher installs a single global logger once at boot and calls
//! `log::{debug,info,warn,error}!` everywhere downstream (see
//! `task/workqueue.rs`). There is no serial port here, so this writes to
//! stderr instead, with the same "install once, log freely" contract.

use conquer_once::spin::OnceCell;
use log::{Level, LevelFilter, Metadata, Record};

struct StderrLogger {
    level: LevelFilter,
}

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let marker = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        eprintln!("[{marker}] {}: {}", record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: OnceCell<StderrLogger> = OnceCell::uninit();

/// Install the crate's logger. Idempotent: later calls after the first
/// are no-ops, matching the teacher's one-shot boot-time init pattern.
pub fn init(level: LevelFilter) {
    let logger = LOGGER.get_or_init(|| StderrLogger { level });
    // `set_logger` fails if a logger (ours or a downstream crate's) is
    // already installed; that's fine, we only need one to be active.
    let _ = log::set_logger(logger).map(|()| log::set_max_level(level));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(LevelFilter::Debug);
        init(LevelFilter::Trace);
    }
}
