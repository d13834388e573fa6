use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::Error;

type FilteredRegistry = Layered<EnvFilter, Registry>;

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to
/// stderr unless a file path is configured.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let configured = level_filter(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    let writer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer: Box<dyn Layer<FilteredRegistry> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}

/// Filter for a configured level name; always a plain level, never a target directive
fn level_filter(level: &str) -> Result<EnvFilter, Error> {
    let level = parse_log_level(level)?;
    Ok(EnvFilter::new(LevelFilter::from_level(level).to_string()))
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> Result<Level, Error> {
    match level.trim().to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(Error::InvalidLogLevel(level.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(" info ").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("error").unwrap(), Level::ERROR);
        assert!(matches!(
            parse_log_level("loud"),
            Err(Error::InvalidLogLevel(level)) if level == "loud"
        ));
    }

    #[test]
    fn test_level_filter_uses_parsed_level() {
        assert_eq!(level_filter("warning").unwrap().max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(level_filter("WARN").unwrap().max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(level_filter("debug").unwrap().max_level_hint(), Some(LevelFilter::DEBUG));
        assert!(matches!(level_filter("loud"), Err(Error::InvalidLogLevel(_))));
    }

    #[test]
    fn test_init_logging_rejects_invalid_level() {
        let config = LoggingConfig {
            level: "verbose".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
