//! TOML Configuration File Support
//!
//! Centralized configuration for the coaching client, read from
//! `~/.config/coachline/coach.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied in this order, later layers winning:
//! 1. Default values
//! 2. TOML configuration file
//! 3. Environment variables
//! 4. CLI arguments (via [`ConfigOverrides`])
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! api_url = "https://coach.example.com/api/v1"
//! request_timeout_secs = 30
//!
//! [connection]
//! ws_url = "wss://coach.example.com/live"
//! heartbeat_enabled = true
//! heartbeat_interval_secs = 30
//! reconnect_attempts = 5
//! reconnect_delay_ms = 1000
//!
//! [session]
//! participant_id = "demo-user"
//! persona = "direct_challenger"
//! session_type = "check_in"
//! handoff_window = 4
//!
//! [storage]
//! data_dir = "/home/me/.local/share/coachline/sessions"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::DEFAULT_API_URL;
use crate::connection::{HeartbeatConfig, ReconnectPolicy};
use crate::safety::HANDOFF_WINDOW;
use crate::session::{Persona, SessionType};

/// Upper bound on reconnect attempts accepted from configuration
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[backend]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Base URL of the coaching API
    pub api_url: Option<String>,
    /// Bearer token
    pub auth_token: Option<String>,
    /// Timeout for non-streaming requests
    pub request_timeout_secs: Option<u64>,
}

/// `[connection]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionToml {
    /// Live-connection URL
    pub ws_url: Option<String>,
    /// Whether to ping while connected
    pub heartbeat_enabled: Option<bool>,
    /// Ping interval in seconds
    pub heartbeat_interval_secs: Option<u64>,
    /// Reconnect attempts after a loss
    pub reconnect_attempts: Option<u32>,
    /// First reconnect delay in milliseconds
    pub reconnect_delay_ms: Option<u64>,
}

/// `[session]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// Participant identifier
    pub participant_id: Option<String>,
    /// Coaching persona
    pub persona: Option<String>,
    /// Session type
    pub session_type: Option<String>,
    /// Style assumed when a reply carries no metadata
    pub default_style: Option<String>,
    /// Messages inspected on handoff
    pub handoff_window: Option<usize>,
}

/// `[storage]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// Session directory
    pub data_dir: Option<PathBuf>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachToml {
    /// Backend section
    pub backend: BackendToml,
    /// Connection section
    pub connection: ConnectionToml,
    /// Session section
    pub session: SessionToml,
    /// Storage section
    pub storage: StorageToml,
}

// =============================================================================
// Resolved Settings
// =============================================================================

/// Coaching API settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSettings {
    /// Base URL
    pub api_url: String,
    /// Bearer token
    pub auth_token: Option<String>,
    /// Timeout for non-streaming requests, in seconds
    pub request_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            request_timeout_secs: 30,
        }
    }
}

/// Live connection settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Live-connection URL; `None` leaves the connection manager unused
    pub ws_url: Option<String>,
    /// Heartbeat
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectPolicy,
}

/// Session defaults
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    /// Participant identifier
    pub participant_id: String,
    /// Coaching persona
    pub persona: Persona,
    /// Session type
    pub session_type: SessionType,
    /// Style assumed when a reply carries no metadata
    pub default_style: String,
    /// Messages inspected on handoff
    pub handoff_window: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            participant_id: "demo-user".to_string(),
            persona: Persona::default(),
            session_type: SessionType::default(),
            default_style: "supportive".to_string(),
            handoff_window: HANDOFF_WINDOW,
        }
    }
}

/// Storage settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageSettings {
    /// Session directory; `None` uses the XDG data directory
    pub data_dir: Option<PathBuf>,
}

/// Centralized configuration for the coaching client
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug, Default)]
pub struct CoachConfig {
    /// Backend settings
    pub backend: BackendSettings,
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Session settings
    pub session: SessionSettings,
    /// Storage settings
    pub storage: StorageSettings,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Highest-priority layer that set a value
    source: ConfigSource,
}

impl CoachConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for a zero heartbeat interval, a zero
    /// reconnect delay, more than [`MAX_RECONNECT_ATTEMPTS`] attempts, a zero
    /// handoff window or a blank participant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;
        if connection.heartbeat.enabled && connection.heartbeat.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if connection.reconnect.base_delay.is_zero() {
            return Err(ConfigError::ValidationError(
                "reconnect delay must be greater than zero".to_string(),
            ));
        }
        if connection.reconnect.max_attempts > MAX_RECONNECT_ATTEMPTS {
            return Err(ConfigError::ValidationError(format!(
                "reconnect attempts {} exceeds the limit of {MAX_RECONNECT_ATTEMPTS}",
                connection.reconnect.max_attempts
            )));
        }
        if self.session.handoff_window == 0 {
            return Err(ConfigError::ValidationError(
                "handoff window must be at least 1".to_string(),
            ));
        }
        if self.session.participant_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "participant id must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/coachline/coach.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("coachline").join("coach.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation. A missing file is not an error.
pub fn load_config() -> Result<CoachConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<CoachConfig, ConfigError> {
    let mut config = CoachConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: CoachToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_persona(raw: &str) -> Result<Persona, ConfigError> {
    raw.parse().map_err(ConfigError::ValidationError)
}

fn parse_session_type(raw: &str) -> Result<SessionType, ConfigError> {
    raw.parse().map_err(ConfigError::ValidationError)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut CoachConfig, toml: &CoachToml) -> Result<(), ConfigError> {
    // Backend
    if let Some(ref url) = toml.backend.api_url {
        config.backend.api_url.clone_from(url);
    }
    if toml.backend.auth_token.is_some() {
        config.backend.auth_token.clone_from(&toml.backend.auth_token);
    }
    if let Some(timeout) = toml.backend.request_timeout_secs {
        config.backend.request_timeout_secs = timeout;
    }

    // Connection
    if toml.connection.ws_url.is_some() {
        config.connection.ws_url.clone_from(&toml.connection.ws_url);
    }
    if let Some(enabled) = toml.connection.heartbeat_enabled {
        config.connection.heartbeat.enabled = enabled;
    }
    if let Some(interval) = toml.connection.heartbeat_interval_secs {
        config.connection.heartbeat.interval = Duration::from_secs(interval);
    }
    if let Some(attempts) = toml.connection.reconnect_attempts {
        config.connection.reconnect.max_attempts = attempts;
    }
    if let Some(delay) = toml.connection.reconnect_delay_ms {
        config.connection.reconnect.base_delay = Duration::from_millis(delay);
    }

    // Session
    if let Some(ref participant) = toml.session.participant_id {
        config.session.participant_id.clone_from(participant);
    }
    if let Some(ref persona) = toml.session.persona {
        config.session.persona = parse_persona(persona)?;
    }
    if let Some(ref session_type) = toml.session.session_type {
        config.session.session_type = parse_session_type(session_type)?;
    }
    if let Some(ref style) = toml.session.default_style {
        config.session.default_style.clone_from(style);
    }
    if let Some(window) = toml.session.handoff_window {
        config.session.handoff_window = window;
    }

    // Storage
    if toml.storage.data_dir.is_some() {
        config.storage.data_dir.clone_from(&toml.storage.data_dir);
    }
    Ok(())
}

/// Apply environment variable overrides; `lookup` reads one variable
fn apply_env_config<F>(config: &mut CoachConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("COACH_API_URL") {
        config.backend.api_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(token) = lookup("COACH_AUTH_TOKEN") {
        config.backend.auth_token = Some(token).filter(|t| !t.is_empty());
        config.source = ConfigSource::Env;
    }
    if let Some(url) = lookup("COACH_WS_URL") {
        config.connection.ws_url = Some(url).filter(|u| !u.is_empty());
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = lookup("COACH_DATA_DIR") {
        config.storage.data_dir = Some(PathBuf::from(dir));
        config.source = ConfigSource::Env;
    }
    if let Some(participant) = lookup("COACH_PARTICIPANT") {
        config.session.participant_id = participant;
        config.source = ConfigSource::Env;
    }
    if let Some(persona) = lookup("COACH_PERSONA") {
        config.session.persona = parse_persona(&persona)?;
        config.source = ConfigSource::Env;
    }
    if let Some(interval) = lookup("COACH_HEARTBEAT_INTERVAL") {
        if let Ok(secs) = interval.parse::<u64>() {
            config.connection.heartbeat.interval = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(attempts) = lookup("COACH_RECONNECT_ATTEMPTS") {
        if let Ok(n) = attempts.parse::<u32>() {
            config.connection.reconnect.max_attempts = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(delay) = lookup("COACH_RECONNECT_DELAY") {
        if let Ok(ms) = delay.parse::<u64>() {
            config.connection.reconnect.base_delay = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// API URL override
    pub api_url: Option<String>,
    /// Participant override
    pub participant_id: Option<String>,
    /// Persona override
    pub persona: Option<Persona>,
    /// Session type override
    pub session_type: Option<SessionType>,
    /// Data directory override
    pub data_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set API URL override
    #[must_use]
    pub fn with_api_url(mut self, url: String) -> Self {
        self.api_url = Some(url);
        self
    }

    /// Set persona override
    #[must_use]
    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = Some(persona);
        self
    }

    /// Set data directory override
    #[must_use]
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    fn is_empty(&self) -> bool {
        self.api_url.is_none()
            && self.participant_id.is_none()
            && self.persona.is_none()
            && self.session_type.is_none()
            && self.data_dir.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut CoachConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref url) = self.api_url {
            config.backend.api_url.clone_from(url);
        }
        if let Some(ref participant) = self.participant_id {
            config.session.participant_id.clone_from(participant);
        }
        if let Some(persona) = self.persona {
            config.session.persona = persona;
        }
        if let Some(session_type) = self.session_type {
            config.session.session_type = session_type;
        }
        if self.data_dir.is_some() {
            config.storage.data_dir.clone_from(&self.data_dir);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CoachConfig::default();

        assert_eq!(config.backend.api_url, DEFAULT_API_URL);
        assert_eq!(config.connection.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(config.connection.reconnect.max_attempts, 5);
        assert_eq!(config.connection.reconnect.base_delay, Duration::from_secs(1));
        assert_eq!(config.session.persona, Persona::SupportiveStrategist);
        assert_eq!(config.session.handoff_window, 4);
        assert_eq!(config.source(), ConfigSource::Default);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[backend]
api_url = "https://coach.test/api"

[connection]
ws_url = "wss://coach.test/live"
heartbeat_interval_secs = 10
reconnect_attempts = 3

[session]
persona = "direct_challenger"
session_type = "deep-dive"
"#
        )
        .unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.backend.api_url, "https://coach.test/api");
        assert_eq!(config.connection.ws_url.as_deref(), Some("wss://coach.test/live"));
        assert_eq!(config.connection.heartbeat.interval, Duration::from_secs(10));
        assert_eq!(config.connection.reconnect.max_attempts, 3);
        assert_eq!(config.session.persona, Persona::DirectChallenger);
        assert_eq!(config.session.session_type, SessionType::DeepDive);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/coachline/coach.toml")))
                .unwrap();
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[backend\napi_url = ").unwrap();
        assert!(matches!(
            load_config_from_path(Some(file.path().to_path_buf())),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_unknown_persona_rejected() {
        let toml: CoachToml = toml::from_str("[session]\npersona = \"drill_sergeant\"").unwrap();
        let mut config = CoachConfig::default();
        assert!(matches!(
            apply_toml_config(&mut config, &toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let toml: CoachToml =
            toml::from_str("[connection]\nreconnect_attempts = 2\nreconnect_delay_ms = 250")
                .unwrap();
        let mut config = CoachConfig::default();
        apply_toml_config(&mut config, &toml).unwrap();

        let env = env_from(&[
            ("COACH_RECONNECT_ATTEMPTS", "7"),
            ("COACH_HEARTBEAT_INTERVAL", "not-a-number"),
            ("COACH_AUTH_TOKEN", ""),
            ("COACH_PERSONA", "Direct-Challenger"),
        ]);
        apply_env_config(&mut config, env).unwrap();

        assert_eq!(config.connection.reconnect.max_attempts, 7);
        assert_eq!(config.connection.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.connection.heartbeat.interval, Duration::from_secs(30));
        assert_eq!(config.backend.auth_token, None);
        assert_eq!(config.session.persona, Persona::DirectChallenger);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_validation() {
        let mut config = CoachConfig::default();
        config.connection.reconnect.max_attempts = MAX_RECONNECT_ATTEMPTS + 1;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = CoachConfig::default();
        config.connection.heartbeat.interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.connection.heartbeat.enabled = false;
        config.validate().unwrap();

        let mut config = CoachConfig::default();
        config.connection.reconnect.base_delay = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = CoachConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);

        ConfigOverrides::new()
            .with_api_url("http://127.0.0.1:9000".to_string())
            .with_persona(Persona::DirectChallenger)
            .with_data_dir(PathBuf::from("/tmp/coach"))
            .apply(&mut config);

        assert_eq!(config.backend.api_url, "http://127.0.0.1:9000");
        assert_eq!(config.session.persona, Persona::DirectChallenger);
        assert_eq!(config.storage.data_dir, Some(PathBuf::from("/tmp/coach")));
        assert_eq!(config.source(), ConfigSource::Cli);
    }
}
