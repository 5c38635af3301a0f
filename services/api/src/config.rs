use patient_sim_core::bridge::BridgeSettings;
use patient_sim_core::scenario::ModelSettings;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub telnyx_api_key: SecretString,
    pub telnyx_connection_id: String,
    pub telnyx_from_number: String,
    pub target_number: String,
    pub telnyx_api_base: String,
    /// Public base URL Telnyx reaches this service on, without a trailing slash.
    pub webhook_base_url: String,
    pub openai_api_key: SecretString,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub patient_speaks_first: bool,
    pub max_call_duration: Duration,
    pub transcripts_dir: PathBuf,
    pub scenarios_path: Option<PathBuf>,
    pub handshake_timeout: Duration,
    pub drain_grace: Duration,
    pub channel_close_timeout: Duration,
    pub log_level: Level,
}

fn required(var: &str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(var.to_string())),
    }
}

fn optional(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parsed<T>(var: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = optional(var, default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(var.to_string(), format!("'{raw}': {e}")))
}

fn millis(var: &str, default: &str) -> Result<Duration, ConfigError> {
    parsed::<u64>(var, default).map(Duration::from_millis)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parsed::<SocketAddr>("BIND_ADDRESS", "0.0.0.0:8000")?;

        let telnyx_api_key = SecretString::from(required("TELNYX_API_KEY")?);
        let telnyx_connection_id = required("TELNYX_CONNECTION_ID")?;
        let telnyx_from_number = required("TELNYX_FROM_NUMBER")?;
        let target_number = required("TARGET_NUMBER")?;
        let telnyx_api_base = optional("TELNYX_API_BASE", "https://api.telnyx.com/v2")
            .trim_end_matches('/')
            .to_string();

        let webhook_base_url = required("WEBHOOK_BASE_URL")?
            .trim_end_matches('/')
            .to_string();
        if !webhook_base_url.starts_with("https://") && !webhook_base_url.starts_with("http://") {
            return Err(ConfigError::InvalidValue(
                "WEBHOOK_BASE_URL".to_string(),
                format!("'{webhook_base_url}' must start with http:// or https://"),
            ));
        }

        let openai_api_key = SecretString::from(required("OPENAI_API_KEY")?);
        let realtime_model = optional("REALTIME_MODEL", "gpt-4o-realtime-preview");
        let realtime_voice = optional("REALTIME_VOICE", "alloy");
        let patient_speaks_first = parsed::<bool>("PATIENT_SPEAKS_FIRST", "false")?;

        let max_call_duration =
            parsed::<u64>("MAX_CALL_DURATION_SECS", "240").map(Duration::from_secs)?;
        let transcripts_dir = PathBuf::from(optional("TRANSCRIPTS_DIR", "./transcripts"));
        let scenarios_path = std::env::var("SCENARIOS_PATH").ok().map(PathBuf::from);

        let handshake_timeout = millis("HANDSHAKE_TIMEOUT_MS", "10000")?;
        let drain_grace = millis("DRAIN_GRACE_MS", "1500")?;
        let channel_close_timeout = millis("CHANNEL_CLOSE_TIMEOUT_MS", "2000")?;

        let log_level_str = optional("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            telnyx_api_key,
            telnyx_connection_id,
            telnyx_from_number,
            target_number,
            telnyx_api_base,
            webhook_base_url,
            openai_api_key,
            realtime_model,
            realtime_voice,
            patient_speaks_first,
            max_call_duration,
            transcripts_dir,
            scenarios_path,
            handshake_timeout,
            drain_grace,
            channel_close_timeout,
            log_level,
        })
    }

    /// Where Telnyx posts call-control events.
    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.webhook_base_url)
    }

    /// Where Telnyx opens the media-stream WebSocket.
    pub fn stream_url(&self) -> String {
        let base = if let Some(host) = self.webhook_base_url.strip_prefix("https://") {
            format!("wss://{host}")
        } else if let Some(host) = self.webhook_base_url.strip_prefix("http://") {
            format!("ws://{host}")
        } else {
            self.webhook_base_url.clone()
        };
        format!("{base}/media-stream")
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            transcripts_dir: self.transcripts_dir.clone(),
            handshake_timeout: self.handshake_timeout,
            drain_grace: self.drain_grace,
            close_timeout: self.channel_close_timeout,
            model: ModelSettings {
                voice: self.realtime_voice.clone(),
                patient_speaks_first: self.patient_speaks_first,
                ..ModelSettings::default()
            },
            ..BridgeSettings::default()
        }
    }
}
