use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_LOG_FILE: &str = "sni-router.log";

/// Build the filter: `RUST_LOG` wins over the configured level.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::from_str(&level).unwrap_or_else(|_| EnvFilter::new("info")))
}

/// Initialize logging system based on configuration
///
/// The returned guard flushes the file writer and must be held by `main`.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = build_filter(config);

    let Some(log_file) = &config.file else {
        // Console logging only
        if config.json {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_timer(ChronoUtc::rfc_3339())
                .json()
                .with_env_filter(env_filter)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_env_filter(env_filter)
                .init();
        }
        return Ok(None);
    };

    let (writer, guard) = file_writer(log_file, config.rotation)?;
    let file_layer = file_layer(writer, config.json, env_filter.clone());

    // Console stays plain text even when the file is JSON
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(Some(guard))
}

fn file_writer(log_file: &str, rotation: bool) -> Result<(NonBlocking, WorkerGuard)> {
    let path = Path::new(log_file);
    if rotation {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_LOG_FILE);
        let appender = tracing_appender::rolling::daily(directory, file_name);
        Ok(tracing_appender::non_blocking(appender))
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", log_file))?;
        Ok(tracing_appender::non_blocking(file))
    }
}

fn file_layer<S>(
    writer: NonBlocking,
    json: bool,
    filter: EnvFilter,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339());
    if json {
        layer.json().with_filter(filter).boxed()
    } else {
        layer.with_filter(filter).boxed()
    }
}
