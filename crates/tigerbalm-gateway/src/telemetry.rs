//! Host log initialisation.
//!
//! Lines go to stdout, or to a rolling file when `log.file` is set. The
//! filter starts at `log.level`; `RUST_LOG` directives refine it.

use std::path::Path;

use tigerbalm_kernel::config::{LogConfig, LogFormat, Rotation};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{GatewayError, GatewayResult};

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(config: &LogConfig) -> GatewayResult<Option<WorkerGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level.as_tracing()).into())
        .from_env_lossy();

    let (writer, guard, ansi) = match &config.file {
        Some(path) => {
            let appender = file_appender(config, path)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), None, true),
    };

    let layer = match config.format {
        LogFormat::Text => fmt::layer().with_writer(writer).with_ansi(ansi).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| GatewayError::Telemetry(e.to_string()))?;
    Ok(guard)
}

fn file_appender(config: &LogConfig, path: &Path) -> GatewayResult<RollingFileAppender> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let prefix = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| GatewayError::Telemetry(format!("{} has no file name", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation(config.rotation))
        .filename_prefix(prefix);
    if config.max_files > 0 {
        builder = builder.max_log_files(config.max_files);
    }
    builder
        .build(dir)
        .map_err(|e| GatewayError::Telemetry(e.to_string()))
}

fn rotation(rotation: Rotation) -> rolling::Rotation {
    match rotation {
        Rotation::Minutely => rolling::Rotation::MINUTELY,
        Rotation::Hourly => rolling::Rotation::HOURLY,
        Rotation::Daily => rolling::Rotation::DAILY,
        Rotation::Never => rolling::Rotation::NEVER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_appender_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tigerbalm.log");
        let config = LogConfig {
            file: Some(path.clone()),
            rotation: Rotation::Never,
            ..LogConfig::default()
        };
        file_appender(&config, &path).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_file_appender_rejects_path_without_name() {
        let config = LogConfig::default();
        assert!(matches!(
            file_appender(&config, Path::new("/")),
            Err(GatewayError::Telemetry(_))
        ));
    }
}
