//! Plugin-scoped log sinks.
//!
//! Every plugin gets its own level-gated [`PluginLogger`] writing into a
//! rotating file named after the plugin. Lines are mirrored to `tracing` with
//! a `plugin` field so the host log shows them too.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tigerbalm_kernel::LogLevel;
use tigerbalm_kernel::config::{PluginLogConfig, Rotation};
use tracing::{debug, error, info, trace, warn};
use tracing_appender::rolling::{self, RollingFileAppender};

use crate::error::{PluginError, PluginResult};

/// Level-gated writer bound to one plugin's sink.
#[derive(Clone)]
pub struct PluginLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    name: String,
    level: LogLevel,
    sink: Mutex<Option<RollingFileAppender>>,
}

impl std::fmt::Debug for PluginLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLogger")
            .field("name", &self.inner.name)
            .field("level", &self.inner.level)
            .finish()
    }
}

impl PluginLogger {
    fn with_sink(name: &str, level: LogLevel, sink: Option<RollingFileAppender>) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                name: name.to_string(),
                level,
                sink: Mutex::new(sink),
            }),
        }
    }

    /// Logger with no file sink; lines only reach `tracing`.
    pub fn detached(name: &str, level: LogLevel) -> Self {
        Self::with_sink(name, level, None)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn level(&self) -> LogLevel {
        self.inner.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.inner.level
    }

    /// Write one line at `level`. Lines under the configured level are
    /// dropped. `Fatal` is written like any other level.
    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }

        let plugin = self.inner.name.as_str();
        match level {
            LogLevel::Trace => trace!(plugin, "{message}"),
            LogLevel::Debug => debug!(plugin, "{message}"),
            LogLevel::Info => info!(plugin, "{message}"),
            LogLevel::Warn => warn!(plugin, "{message}"),
            LogLevel::Error => error!(plugin, "{message}"),
            LogLevel::Fatal => error!(plugin, fatal = true, "{message}"),
        }

        let mut sink = self.inner.sink.lock();
        if let Some(file) = sink.as_mut() {
            let line = format!(
                "{} {:<5} {}\n",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%z"),
                level,
                message
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(plugin, error = %e, "failed to write plugin log line");
            }
        }
    }

    /// Flush and drop the file sink. Later lines only reach `tracing`.
    pub fn close(&self) {
        if let Some(mut file) = self.inner.sink.lock().take() {
            let _ = file.flush();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sink.lock().is_none()
    }
}

/// Hands out one logger per plugin name and releases it on unload.
pub struct LoggerFactory {
    config: PluginLogConfig,
    loggers: Mutex<HashMap<String, PluginLogger>>,
}

impl LoggerFactory {
    pub fn new(config: PluginLogConfig) -> Self {
        Self {
            config,
            loggers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PluginLogConfig {
        &self.config
    }

    /// Logger for `name`, opening its sink on first use.
    pub fn get(&self, name: &str) -> PluginResult<PluginLogger> {
        let mut loggers = self.loggers.lock();
        if let Some(logger) = loggers.get(name) {
            return Ok(logger.clone());
        }
        let sink = self.open_sink(name)?;
        let logger = PluginLogger::with_sink(name, self.config.level, Some(sink));
        loggers.insert(name.to_string(), logger.clone());
        Ok(logger)
    }

    /// Close and forget the sink for `name`.
    pub fn release(&self, name: &str) {
        if let Some(logger) = self.loggers.lock().remove(name) {
            logger.close();
        }
    }

    /// Close every sink.
    pub fn release_all(&self) {
        for (_, logger) in self.loggers.lock().drain() {
            logger.close();
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.loggers.lock().contains_key(name)
    }

    fn open_sink(&self, name: &str) -> PluginResult<RollingFileAppender> {
        std::fs::create_dir_all(&self.config.path)?;

        let rotation = match self.config.rotation {
            Rotation::Minutely => rolling::Rotation::MINUTELY,
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        };

        let mut builder = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(name)
            .filename_suffix("log");
        if self.config.max_files > 0 {
            builder = builder.max_log_files(self.config.max_files);
        }
        builder
            .build(&self.config.path)
            .map_err(|e| PluginError::LogSink(format!("{name}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(dir: &std::path::Path, level: LogLevel) -> LoggerFactory {
        LoggerFactory::new(PluginLogConfig {
            path: dir.to_path_buf(),
            level,
            rotation: Rotation::Never,
            max_files: 0,
        })
    }

    fn read_logs(dir: &std::path::Path) -> String {
        let mut out = String::new();
        for entry in std::fs::read_dir(dir).unwrap().flatten() {
            out.push_str(&std::fs::read_to_string(entry.path()).unwrap());
        }
        out
    }

    #[test]
    fn test_level_gate_and_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let loggers = factory(dir.path(), LogLevel::Info);
        let logger = loggers.get("echo").unwrap();

        logger.log(LogLevel::Debug, "hidden");
        logger.log(LogLevel::Info, "shown");
        logger.log(LogLevel::Fatal, "still running");
        logger.close();

        let text = read_logs(dir.path());
        assert!(!text.contains("hidden"));
        assert!(text.contains("INFO  shown"));
        assert!(text.contains("FATAL still running"));
    }

    #[test]
    fn test_same_name_shares_logger_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let loggers = factory(dir.path(), LogLevel::Trace);

        let a = loggers.get("p").unwrap();
        let b = loggers.get("p").unwrap();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));

        loggers.release("p");
        assert!(a.is_closed());
        assert!(!loggers.contains("p"));

        let c = loggers.get("p").unwrap();
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
    }

    #[test]
    fn test_detached_logger_has_no_sink() {
        let logger = PluginLogger::detached("t", LogLevel::Warn);
        assert!(logger.is_closed());
        assert!(!logger.enabled(LogLevel::Info));
        logger.log(LogLevel::Error, "only tracing");
    }
}
