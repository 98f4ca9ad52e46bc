//! Logging for Model Serve
//!
//! This crate installs the process-wide `tracing` subscriber. `RUST_LOG`
//! takes precedence over the configured level; output goes to stdout or,
//! when a file is configured, through a non-blocking file writer.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use common::error::{Error, Result};
use config::LogConfig;

/// Builds the event filter: `RUST_LOG` if set, else the configured level
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| Error::Config(format!("invalid log level '{}': {}", level, e))),
    }
}

/// Initializes logging
///
/// Returns the file writer guard when logging to a file; keep it alive for
/// the life of the process or buffered lines are lost on exit. Calling this
/// twice returns an error instead of replacing the first subscriber.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(&config.level)?;

    let (writer, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            (writer, Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(config.file.is_none())
        .with_writer(writer);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| Error::Internal(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}

fn file_writer(path: &Path) -> Result<(BoxMakeWriter, WorkerGuard)> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("log file has no name: {}", path.display())))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    Ok((BoxMakeWriter::new(non_blocking), guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_directives() {
        assert!(build_filter("info").is_ok());
        assert!(build_filter("storage_adapter=debug,warn").is_ok());
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = LogConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_err());
    }
}
