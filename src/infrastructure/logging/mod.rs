//! Tracing initialization.

use anyhow::Result;
use std::io;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::config::LogSection;

/// Holds the appender guard so buffered log lines flush at exit.
pub struct Logger {
    _guard: Option<WorkerGuard>,
}

impl Logger {
    /// Initialize the global subscriber from configuration. Stdout format
    /// follows `log.format` (`json` or `pretty`); when `log.dir` is set, a
    /// daily-rolling JSON file layer is added.
    pub fn init(config: &LogSection) -> Result<Self> {
        let default_level = parse_log_level(&config.level)?;
        let env_filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();

        let guard = if config.dir.is_empty() {
            init_stdout_only(&config.format, env_filter)?;
            None
        } else {
            let file_appender = rolling::daily(&config.dir, "foreman.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_filter(EnvFilter::builder().with_default_directive(default_level.into()).from_env_lossy());

            if config.format == "json" {
                let stdout_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stdout)
                    .with_target(true)
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(file_layer).with(stdout_layer).try_init()?;
            } else {
                let stdout_layer = tracing_subscriber::fmt::layer()
                    .with_writer(io::stdout)
                    .with_target(false)
                    .with_filter(env_filter);
                tracing_subscriber::registry().with(file_layer).with(stdout_layer).try_init()?;
            }
            Some(guard)
        };

        Ok(Self { _guard: guard })
    }
}

fn init_stdout_only(format: &str, env_filter: EnvFilter) -> Result<()> {
    if format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stdout)
                    .with_target(true)
                    .with_filter(env_filter),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stdout)
                    .with_target(false)
                    .with_filter(env_filter),
            )
            .try_init()?;
    }
    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("Invalid log level: {other}"),
    }
}
