//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem, supporting
//! human-readable and JSON output.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,hippool=trace")
//! - `HIPPOOL_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `HIPPOOL_LOG_FORMAT`: Output format ("human" or "json")

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "HIPPOOL_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "HIPPOOL_LOG_FORMAT";
const DEFAULT_LOG_LEVEL: &str = "warn";

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to EnvFilter string
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Initialize logging from environment variables.
///
/// Reads `RUST_LOG` (standard tracing filter), `HIPPOOL_LOG_LEVEL`, and
/// `HIPPOOL_LOG_FORMAT`; defaults to `warn` level and human-readable format.
///
/// This function is idempotent - calling it multiple times will only
/// initialize the subscriber once.
pub fn init_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let env_filter = build_env_filter();

        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::from_str(&s))
            .unwrap_or_default();

        let result = match format {
            LogFormat::Json => {
                let layer = tracing_subscriber::fmt::layer().json().with_target(false);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer)
                    .try_init()
            }
            LogFormat::Human => {
                let layer = tracing_subscriber::fmt::layer().with_target(true);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer)
                    .try_init()
            }
        };
        // Another subscriber may already be installed by the embedding
        // application; that is fine.
        if let Err(e) = result {
            tracing::debug!("tracing subscriber already installed: {}", e);
        }
    });
}

/// Build the environment filter for log level.
/// Tries RUST_LOG first (standard tracing convention), then HIPPOOL_LOG_LEVEL.
fn build_env_filter() -> EnvFilter {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        if let Ok(filter) = EnvFilter::try_new(rust_log) {
            return filter;
        }
    }
    if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
        if let Some(level) = LogLevel::from_str(&level) {
            return EnvFilter::new(level.as_filter_str());
        }
    }
    EnvFilter::new(DEFAULT_LOG_LEVEL)
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
