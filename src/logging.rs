//! # Structured Logging Module
//!
//! Environment-aware structured logging for debugging concurrent dispatch
//! cycles after the fact: human-readable console output plus a JSON log
//! file that keeps the structured fields queryable.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; only the first call installs a
/// subscriber. Respects `RUST_LOG` when set, otherwise derives the level
/// from the detected environment.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = crate::config::loader::detect_environment();
        let filter = env_filter_for(&environment);

        let log_dir = PathBuf::from("log");
        let _ = fs::create_dir_all(&log_dir);

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let file_appender = tracing_appender::rolling::never(
            &log_dir,
            format!("{environment}.{pid}.{timestamp}.log"),
        );
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(EnvFilter::new(filter.clone())),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(EnvFilter::new(filter)),
            );

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already installed, reusing it");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            "structured logging initialized"
        );

        // The writer guard must live for the process lifetime
        std::mem::forget(guard);
    });
}

fn env_filter_for(environment: &str) -> String {
    if let Ok(explicit) = std::env::var("RUST_LOG") {
        return explicit;
    }
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}
