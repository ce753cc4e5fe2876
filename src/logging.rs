//! Logging setup: human-readable console output plus a daily-rotated JSON
//! error file.

use std::path::Path;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::FilterFn;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    prelude::*,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Error log file name
pub const ERROR_LOG_FILE: &str = "errors";

/// Initialize the logging system with console and file outputs
///
/// # Errors
/// Fails if the log directory cannot be created.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Create log directory if it doesn't exist
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let error_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, ERROR_LOG_FILE);

    // Console output, human-readable
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // Errors from this crate go to the rotated file as JSON
    let error_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(error_file)
        .with_filter(FilterFn::new(|metadata| {
            metadata.target().starts_with("chorok_audio")
                && metadata.level() >= &tracing::Level::ERROR
        }));

    // Default to INFO unless RUST_LOG says otherwise
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(error_layer)
        .init();

    info!("Logging system initialized");
    Ok(())
}
