//! `tracing` setup for binaries and tests
//!
//! Library code only emits `tracing` events. The CLI calls [`init`] once to
//! route them to a daily-rotated file at [`Config::log_path`]; a host that
//! embeds the crate may install its own subscriber instead.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

/// Flushes buffered log lines when dropped
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Install the global file subscriber. `RUST_LOG` overrides `config.level`.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let path = Config::log_path();
    let appender = rolling_appender(&path, config.max_files)?;

    // Dispatch paths must not block on disk
    let (writer, worker) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_names(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(path = %path.display(), level = %config.level, "Logging initialized");
    Ok(LoggingGuard { _worker: worker })
}

/// Daily appender writing `<file name>.<date>` next to `path`, keeping at
/// most `max_files` of them
fn rolling_appender(path: &Path, max_files: usize) -> Result<RollingFileAppender> {
    let (dir, prefix) = match (path.parent(), path.file_name().and_then(|n| n.to_str())) {
        (Some(dir), Some(prefix)) => (dir, prefix),
        _ => {
            return Err(Error::Config(format!(
                "log path {} has no file name",
                path.display()
            )))
        }
    };
    std::fs::create_dir_all(dir)?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))
}

/// Route events to the test harness's captured output; repeat calls are no-ops
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_appender_creates_directory_and_dated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/trackwire.log");

        let mut appender = rolling_appender(&path, 3).unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let files: Vec<String> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("trackwire.log."), "got {:?}", files);
    }

    #[test]
    fn test_appender_needs_a_file_name() {
        assert!(rolling_appender(Path::new("/"), 1).is_err());
    }
}
