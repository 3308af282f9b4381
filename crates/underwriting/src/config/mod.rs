use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the underwriting service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub pipeline: PipelineSettings,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig {
                log_level,
                include_target: environment != AppEnvironment::Production,
                ansi: false,
            },
            pipeline: PipelineSettings::from_env()?,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub include_target: bool,
    pub ansi: bool,
}

const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_UTC_OFFSET_HOURS: i32 = 7;

/// Runtime knobs handed to the pipeline at construction time.
///
/// Rule thresholds are not part of this struct; they are versioned per rule family
/// and resolved fresh for every run (see `workflows::underwriting::thresholds`).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Upper bound for every individual external provider call. Default: 10s.
    pub provider_timeout: Duration,
    /// Offset of the fixed local zone used for age, tenure and ban-window dates. Default: +7.
    pub utc_offset_hours: i32,
    /// Turn a behavioral scorer failure into a CONTINGENCY verdict instead of aborting. Default: off.
    pub contingency_on_scorer_failure: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_millis(DEFAULT_PROVIDER_TIMEOUT_MS),
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
            contingency_on_scorer_failure: false,
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let provider_timeout = match env::var("UNDERWRITING_PROVIDER_TIMEOUT_MS") {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(millis) if millis > 0 => Duration::from_millis(millis),
                _ => return Err(ConfigError::InvalidProviderTimeout(raw)),
            },
            Err(_) => defaults.provider_timeout,
        };

        let utc_offset_hours = match env::var("UNDERWRITING_UTC_OFFSET_HOURS") {
            Ok(raw) => match raw.trim().parse::<i32>() {
                Ok(hours) if (-12..=14).contains(&hours) => hours,
                _ => return Err(ConfigError::InvalidUtcOffset(raw)),
            },
            Err(_) => defaults.utc_offset_hours,
        };

        let contingency_on_scorer_failure = env::var("UNDERWRITING_SCORER_CONTINGENCY")
            .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.contingency_on_scorer_failure);

        Ok(Self {
            provider_timeout,
            utc_offset_hours,
            contingency_on_scorer_failure,
        })
    }

    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600)
            .or_else(|| FixedOffset::east_opt(DEFAULT_UTC_OFFSET_HOURS * 3600))
            .unwrap_or_else(|| Utc.fix())
    }

    /// Today's date in the configured local zone.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.local_offset()).date_naive()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidProviderTimeout(String),
    InvalidUtcOffset(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidProviderTimeout(raw) => write!(
                f,
                "UNDERWRITING_PROVIDER_TIMEOUT_MS must be a positive number of milliseconds (found '{raw}')"
            ),
            ConfigError::InvalidUtcOffset(raw) => write!(
                f,
                "UNDERWRITING_UTC_OFFSET_HOURS must be between -12 and 14 (found '{raw}')"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}
