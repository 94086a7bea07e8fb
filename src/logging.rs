//! Logging setup for the DSE node.
//!
//! - `RUST_LOG` overrides the configured level
//! - stdout output, pretty or JSON
//! - optional daily-rolling log file written from a background thread
//! - records emitted through the `log` crate are forwarded to `tracing`

use std::{io, path::PathBuf};

use data_connector::ConfigMap;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, registry::Registry, EnvFilter, Layer};

const MASK: &str = "****";
const SENSITIVE_KEYS: &[&str] = &["password", "secret", "token"];

fn default_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "dse-node.log".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Write a daily-rolling file here in addition to stdout.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            log_dir: None,
            log_file: default_log_file(),
        }
    }
}

/// Keeps the file writer alive; dropping it flushes the log file.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, io::Error> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.json {
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stdout)
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .boxed(),
        );
    }

    let mut file_guard = None;
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, &config.log_file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .boxed(),
        );
        file_guard = Some(guard);
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(env_filter);
    tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;
    tracing_log::LogTracer::init().map_err(|e| io::Error::other(e.to_string()))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Copy of `config` safe to log: values of the listed `secrets` and of keys
/// that look sensitive are masked.
pub fn mask_secrets(config: &ConfigMap, secrets: &[String]) -> ConfigMap {
    config
        .iter()
        .map(|(k, v)| {
            let lowered = k.to_ascii_lowercase();
            let sensitive = secrets.iter().any(|s| s == k)
                || SENSITIVE_KEYS.iter().any(|s| lowered.contains(s));
            let v = if sensitive { MASK.to_string() } else { v.clone() };
            (k.clone(), v)
        })
        .collect()
}
