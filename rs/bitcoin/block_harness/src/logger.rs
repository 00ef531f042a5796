use serde::{Deserialize, Serialize};
use slog::{o, Drain, Level, Logger};
use slog_async::{AsyncGuard, OverflowStrategy};
use slog_term::{CompactFormat, Decorator, FullFormat, PlainSyncDecorator, TermDecorator};
use std::{fs::OpenOptions, io, path::PathBuf};

const ASYNC_CHAN_SIZE: usize = 8192;

/// Represents the required log level defined in the `LoggerConfig`.
//
// `slog::Level` does not implement `Deserialize`, hence the remote derive.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(remote = "Level")]
#[serde(rename_all = "snake_case")]
pub enum LevelDef {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

/// The format of emitted log lines
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    TextFull,
    Compact,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogTarget {
    Stdout,
    Stderr,
    File(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    #[serde(with = "LevelDef")]
    pub level: Level,
    pub format: LogFormat,
    pub target: LogTarget,
    /// If set to `false`, log messages are dropped instead of blocking the harness when
    /// the queue is full.
    pub block_on_overflow: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: LogFormat::TextFull,
            target: LogTarget::Stdout,
            block_on_overflow: true,
        }
    }
}

/// Creates the root logger described by `config`. Messages are written by a background
/// thread; the returned guard flushes it when dropped.
pub fn new_logger(config: &LoggerConfig) -> io::Result<(Logger, AsyncGuard)> {
    Ok(match &config.target {
        LogTarget::Stdout => build(TermDecorator::new().stdout().build(), config),
        LogTarget::Stderr => build(TermDecorator::new().stderr().build(), config),
        LogTarget::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            build(PlainSyncDecorator::new(file), config)
        }
    })
}

fn build<D>(decorator: D, config: &LoggerConfig) -> (Logger, AsyncGuard)
where
    D: Decorator + Send + 'static,
{
    let overflow_strategy = if config.block_on_overflow {
        OverflowStrategy::Block
    } else {
        OverflowStrategy::Drop
    };
    let (drain, guard) = match config.format {
        LogFormat::TextFull => slog_async::Async::new(FullFormat::new(decorator).build().fuse())
            .chan_size(ASYNC_CHAN_SIZE)
            .overflow_strategy(overflow_strategy)
            .build_with_guard(),
        LogFormat::Compact => {
            slog_async::Async::new(CompactFormat::new(decorator).build().fuse())
                .chan_size(ASYNC_CHAN_SIZE)
                .overflow_strategy(overflow_strategy)
                .build_with_guard()
        }
    };
    let drain = slog::LevelFilter::new(drain, config.level).fuse();
    (Logger::root(drain, o!()), guard)
}

/// A logger that discards everything, for tests and library callers that do not care.
pub fn no_op_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[cfg(test)]
mod test {
    use super::*;
    use slog::info;

    #[test]
    fn test_default_config_deserializes_from_empty_object() {
        let config: LoggerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LoggerConfig::default());
    }

    #[test]
    fn test_level_and_format_are_snake_case() {
        let config: LoggerConfig =
            serde_json::from_str(r#"{"level": "trace", "format": "compact"}"#).unwrap();
        assert_eq!(config.level, Level::Trace);
        assert_eq!(config.format, LogFormat::Compact);
    }

    #[test]
    fn test_file_target_receives_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.log");
        let config = LoggerConfig {
            target: LogTarget::File(path.clone()),
            ..LoggerConfig::default()
        };
        {
            let (logger, _guard) = new_logger(&config).unwrap();
            info!(logger, "Submitting block {}", 42);
        }
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("Submitting block 42"));
    }
}
