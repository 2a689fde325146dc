use std::{fs::OpenOptions, path::PathBuf, str::FromStr, sync::Mutex, sync::Once};

use tracing::Level;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::{config::LogSettings, error::ConfigError};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Whether to include the event target
    pub targets: bool,
    /// Whether to include source code locations
    pub source_location: bool,
    /// Whether to log span open and close
    pub log_spans: bool,
    /// Output file path (None for stdout)
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            targets: true,
            source_location: false,
            log_spans: false,
            file_path: None,
        }
    }
}

impl LogConfig {
    pub fn from_settings(settings: &LogSettings) -> Result<Self, ConfigError> {
        let level = Level::from_str(&settings.level)
            .map_err(|e| ConfigError::invalid("logging.level", format!("'{}': {e}", settings.level)))?;
        Ok(Self {
            level,
            file_path: settings.file.clone(),
            ..Default::default()
        })
    }
}

/// Initialize logging system
///
/// Only the first call installs a subscriber; later calls return `Ok(())`.
pub fn setup_logging(config: LogConfig) -> Result<(), ConfigError> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = setup_logging_internal(config);
    });

    result
}

fn setup_logging_internal(config: LogConfig) -> Result<(), ConfigError> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.targets)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(if config.log_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    let installed = match config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            subscriber.with_ansi(false).with_writer(Mutex::new(file)).try_init()
        }
        None => subscriber.try_init(),
    };

    installed.map_err(|e| ConfigError::Logging(e.to_string()))
}
