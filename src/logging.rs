//! Tracing subscriber setup.
//!
//! Local deployments (`local = true`) log to a daily-rolling `app.log` in
//! `logging.dir`; everything else logs human-readable lines to stderr.
//! `RUST_LOG` overrides `logging.level` when set.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;

pub const LOG_FILE_NAME: &str = "app.log";

fn filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process, or buffered file output is lost.
pub fn init(config: &Config) -> Result<Option<WorkerGuard>> {
    if config.local {
        std::fs::create_dir_all(&config.logging.dir).with_context(|| {
            format!(
                "Failed to create log directory: {}",
                config.logging.dir.display()
            )
        })?;
        let appender = tracing_appender::rolling::daily(&config.logging.dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(filter(config));
        tracing_subscriber::registry()
            .with(file_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        Ok(Some(guard))
    } else {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter(config));
        tracing_subscriber::registry()
            .with(stderr_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        Ok(None)
    }
}
