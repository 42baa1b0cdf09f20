//! Process wide logger that can be replaced at runtime.
//!
//! Sessions that forward diagnostics to the client swap the active backend
//! and restore the default one when they end.

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub static LOGGER_SWITCHER: Lazy<LoggerSwitcher> = Lazy::new(LoggerSwitcher::default);

#[derive(Default)]
pub struct LoggerSwitcher {
    inner: RwLock<Option<Box<dyn Log>>>,
}

impl LoggerSwitcher {
    /// Replace the active logger. The first call registers the switcher as the `log` backend.
    pub fn switch(&'static self, logger: impl Log + 'static, filter: LevelFilter) {
        *self.inner.write() = Some(Box::new(logger));
        // fails on every call except the first one, the switcher stays installed
        let _ = log::set_logger(self);
        log::set_max_level(filter);
    }

    /// Install a fresh `env_logger` configured from `RUST_LOG`.
    pub fn switch_to_default(&'static self) {
        let logger = env_logger::Logger::from_default_env();
        let filter = logger.filter();
        self.switch(logger, filter);
    }
}

impl Log for LoggerSwitcher {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner
            .read()
            .as_ref()
            .map(|logger| logger.enabled(metadata))
            .unwrap_or(false)
    }

    fn log(&self, record: &Record) {
        if let Some(logger) = self.inner.read().as_ref() {
            logger.log(record);
        }
    }

    fn flush(&self) {
        if let Some(logger) = self.inner.read().as_ref() {
            logger.flush();
        }
    }
}
