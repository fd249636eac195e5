//! Plugin logger capability (`require("log")`).

use rhai::Dynamic;
use tigerbalm_kernel::LogLevel;

use crate::logger::PluginLogger;

/// Script view of the owning plugin's logger.
#[derive(Clone, Debug)]
pub struct LogCapability {
    logger: PluginLogger,
}

impl LogCapability {
    pub fn new(logger: PluginLogger) -> Self {
        Self { logger }
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn write(&self, level: LogLevel, message: &Dynamic) {
        if self.logger.enabled(level) {
            self.logger.log(level, &message.to_string());
        }
    }

    /// `log.log("warn", msg)`; an unknown level name is logged at error.
    pub fn write_named(&self, level: &str, message: &Dynamic) {
        match level.parse::<LogLevel>() {
            Ok(level) => self.write(level, message),
            Err(e) => self.logger.log(LogLevel::Error, &format!("{e}: {message}")),
        }
    }
}
