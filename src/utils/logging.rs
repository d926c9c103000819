//! # Logging Setup
//!
//! Installs a `tracing-subscriber` registry from a [`LoggingConfig`], with one fmt
//! layer per enabled output (console, file).
//!
//! `RUST_LOG` takes precedence over the configured level when it is set, so a
//! deployment can raise verbosity for a single module without a config change.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Where log lines go
#[derive(Debug, Clone, PartialEq, Eq)]
struct Outputs<'a> {
    console: bool,
    file: Option<&'a str>,
}

fn outputs(config: &LoggingConfig) -> Result<Outputs<'_>> {
    let file = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => Some(path),
        (true, None) => {
            return Err(ProtocolError::ConfigError(
                "log_file_path must be specified when log_to_file is true".into(),
            ))
        }
        (false, _) => None,
    };
    if !config.log_to_console && file.is_none() {
        return Err(ProtocolError::ConfigError(
            "At least one logging output (console or file) must be enabled".into(),
        ));
    }
    Ok(Outputs {
        console: config.log_to_console,
        file,
    })
}

fn fmt_layer<S, W>(writer: W, json: bool, ansi: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(ansi);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber described by `config`.
///
/// Fails with [`ProtocolError::ConfigError`] if a subscriber is already installed, no
/// output is enabled, or the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let outputs = outputs(config)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let mut layers: Vec<BoxedLayer<Registry>> = Vec::with_capacity(2);
    if outputs.console {
        layers.push(fmt_layer(std::io::stdout, config.json_format, true));
    }
    if let Some(path) = outputs.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
        layers.push(fmt_layer(Mutex::new(file), config.json_format, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;
    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_outputs_follow_config() {
        let config = LoggingConfig::default();
        assert_eq!(
            outputs(&config).unwrap(),
            Outputs {
                console: true,
                file: None
            }
        );

        let config = LoggingConfig {
            log_to_console: false,
            log_to_file: true,
            log_file_path: Some("pipeline.log".into()),
            ..LoggingConfig::default()
        };
        assert_eq!(
            outputs(&config).unwrap(),
            Outputs {
                console: false,
                file: Some("pipeline.log")
            }
        );
    }

    #[test]
    fn test_outputs_need_a_destination() {
        let silent = LoggingConfig {
            log_to_console: false,
            ..LoggingConfig::default()
        };
        assert!(matches!(outputs(&silent), Err(ProtocolError::ConfigError(_))));

        let pathless = LoggingConfig {
            log_to_file: true,
            ..LoggingConfig::default()
        };
        assert!(matches!(outputs(&pathless), Err(ProtocolError::ConfigError(_))));
    }
}
