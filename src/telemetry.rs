//! Shared tracing bootstrap for rangemover binaries.

use crate::{Error, Result};

use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

/// Parsed telemetry configuration from environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub format: LogFormat,
    pub thread_ids: bool,
    /// `RUST_LOG`-style directives layered over the base level
    pub directives: Option<String>,
}

impl TelemetryConfig {
    /// Environment variables (all optional):
    /// - RANGEMOVER_SERVICE_NAME
    /// - RANGEMOVER_LOG_FORMAT: json (default) or text
    /// - RANGEMOVER_LOG_THREAD_IDS: boolean, default true
    /// - RUST_LOG: per-target filter directives
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name = std::env::var("RANGEMOVER_SERVICE_NAME")
            .unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "RANGEMOVER_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let format = match std::env::var("RANGEMOVER_LOG_FORMAT") {
            Ok(raw) => parse_log_format(&raw)?,
            Err(_) => LogFormat::Json,
        };

        let directives = std::env::var("RUST_LOG")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            service_name: service_name.to_string(),
            format,
            thread_ids: parse_optional_bool("RANGEMOVER_LOG_THREAD_IDS")?.unwrap_or(true),
            directives,
        })
    }
}

/// Installed global subscriber for one process.
#[derive(Debug)]
pub struct Telemetry {
    config: TelemetryConfig,
}

impl Telemetry {
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;

        let mut filter = EnvFilter::default().add_directive(LevelFilter::from_level(level).into());
        if let Some(directives) = &config.directives {
            for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
                let parsed = directive.trim().parse().map_err(|e| {
                    Error::Config(format!("invalid RUST_LOG directive '{directive}': {e}"))
                })?;
                filter = filter.add_directive(parsed);
            }
        }

        let builder = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(config.thread_ids);
        let installed = match config.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed.map_err(|e| {
            Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
        })?;

        info!(
            service_name = %config.service_name,
            log_format = config.format.as_str(),
            %level,
            "Telemetry bootstrap initialized"
        );
        Ok(Self { config })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn format(&self) -> LogFormat {
        self.config.format
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "text" | "pretty" => Ok(LogFormat::Text),
        other => Err(Error::Config(format!(
            "invalid log format '{other}', expected json or text"
        ))),
    }
}

fn parse_optional_bool(name: &str) -> Result<Option<bool>> {
    let Some(raw) = std::env::var(name).ok() else {
        return Ok(None);
    };
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}
