//! Structured logging setup
//!
//! Human-readable or JSON output on stderr, with an optional copy appended
//! to a file. `RUST_LOG` overrides the configured level. Tokens never appear
//! in log fields; session types redact them in their `Debug` output.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::Result;

/// Builds the level filter, preferring `RUST_LOG` when set.
///
/// # Errors
///
/// Returns an error when `level` is not a valid filter directive.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(Into::into)
}

/// Initialize logging based on configuration.
///
/// # Arguments
///
/// * `config` - Logging configuration
///
/// # Errors
///
/// Returns an error if the filter is invalid, the log file cannot be
/// opened, or a global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use oidc_session::config::LoggingConfig;
/// use oidc_session::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     json: true,
///     file_path: None,
/// };
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(build_filter(&config.level)?);

    if config.json {
        let stderr_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr);

        if let Some(file_path) = &config.file_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            let file_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(Arc::new(file));
            registry.with(stderr_layer).with(file_layer).try_init()?;
        } else {
            registry.with(stderr_layer).try_init()?;
        }
    } else {
        let stderr_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);

        if let Some(file_path) = &config.file_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            registry.with(stderr_layer).with(file_layer).try_init()?;
        } else {
            registry.with(stderr_layer).try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_build_filter_accepts_directives() {
        std::env::remove_var("RUST_LOG");
        assert!(build_filter("info").is_ok());
        assert!(build_filter("oidc_session=debug,reqwest=warn").is_ok());
    }

    #[test]
    #[serial]
    fn test_build_filter_rejects_garbage() {
        std::env::remove_var("RUST_LOG");
        assert!(build_filter("oidc_session=loudest").is_err());
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides_configured_level() {
        std::env::set_var("RUST_LOG", "trace");
        let filter = build_filter("not a [valid directive");
        std::env::remove_var("RUST_LOG");
        assert!(filter.is_ok());
    }

    #[test]
    fn test_unwritable_log_file_is_an_error() {
        let config = LoggingConfig {
            level: "info".to_string(),
            json: false,
            file_path: Some("/nonexistent-dir/sub/oidc.log".into()),
        };
        assert!(init_logging(&config).is_err());
    }
}
