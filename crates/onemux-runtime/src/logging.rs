//! Logging setup on top of `tracing-subscriber`.
//!
//! The subscriber is built from [`LoggingConfig`]: base level plus
//! per-module directives, pretty/compact/json formatting, and stdout/stderr
//! or daily-rotated file output. `RUST_LOG` overrides the configured filter
//! when set.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogFormat, LogOutput, LoggingConfig};

/// Initializes logging. Returns the file writer guard when logging to a
/// file; keep it alive for the process lifetime or buffered lines are lost.
///
/// # Panics
///
/// Panics if a subscriber has already been set.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    try_init(config).expect("logging already initialized")
}

/// Like [`init`], but returns an error instead of panicking when a
/// subscriber is already installed.
pub fn try_init(
    config: &LoggingConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let filter = build_filter(config);

    let (writer, ansi, guard) = match config.output {
        LogOutput::Stdout => (BoxMakeWriter::new(std::io::stdout), true, None),
        LogOutput::Stderr => (BoxMakeWriter::new(std::io::stderr), true, None),
        LogOutput::File => {
            let path = config
                .file_path
                .clone()
                .unwrap_or_else(|| "logs/onemux.log".into());
            let directory = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => std::path::Path::new("."),
            };
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "onemux.log".to_string());
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), false, Some(guard))
        }
    };

    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry.with(layer).try_init()?,
        LogFormat::Compact => registry.with(layer.compact()).try_init()?,
        LogFormat::Json => registry.with(layer.json()).try_init()?,
    }

    Ok(guard)
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = EnvFilter::new(config.level.as_str());
        for (module, level) in &config.filters {
            if let Ok(directive) = format!("{module}={level}").parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    })
}
