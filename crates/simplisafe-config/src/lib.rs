//! Shared configuration for SimpliSafe tools.
//!
//! TOML profiles, refresh-token resolution (env + keyring + plaintext),
//! and translation to `simplisafe_api::ClientConfig`. The API crate never
//! reads files or the environment; everything on disk goes through here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use simplisafe_api::{ApiClient, CallbackHandle, ClientConfig, RetryPolicy, TransportConfig};

const KEYRING_SERVICE: &str = "simplisafe";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no refresh token configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("profile '{0}' not found")]
    UnknownProfile(String),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    /// Tuning shared by every profile.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named account profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, or the default profile when `name` is `None`.
    pub fn profile<'a>(
        &'a self,
        name: Option<&'a str>,
    ) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get(name)
            .map(|profile| (name, profile))
            .ok_or_else(|| ConfigError::UnknownProfile(name.into()))
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// HTTP timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Attempts per REST call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// A 401 this soon after a refresh reuses the fresh token.
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: u64,

    /// Event stream inactivity before a reconnect.
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_attempts: default_max_attempts(),
            refresh_window_secs: default_refresh_window(),
            watchdog_timeout_secs: default_watchdog_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

fn default_timeout() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_refresh_window() -> u64 {
    5
}
fn default_watchdog_timeout() -> u64 {
    300
}
fn default_heartbeat_interval() -> u64 {
    55
}

/// A named account profile.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Profile {
    /// REST base override (e.g. a proxy).
    pub api_url: Option<String>,

    /// OAuth base override.
    pub auth_url: Option<String>,

    /// Event stream URL override.
    pub websocket_url: Option<String>,

    /// Refresh token (plaintext, prefer keyring or env var).
    pub refresh_token: Option<String>,

    /// Environment variable name containing the refresh token.
    pub refresh_token_env: Option<String>,

    pub user_agent: Option<String>,

    /// Override timeout.
    pub timeout: Option<u64>,

    /// Override attempts per REST call.
    pub max_attempts: Option<u32>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "simplisafe", "simplisafe").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("simplisafe");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path`, then `SIMPLISAFE_`-prefixed env vars on top.
///
/// Nested keys use a double underscore:
/// `SIMPLISAFE_DEFAULTS__MAX_ATTEMPTS=5`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SIMPLISAFE_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Refresh-token storage ───────────────────────────────────────────

fn keyring_entry(profile_name: &str) -> Result<keyring::Entry, ConfigError> {
    Ok(keyring::Entry::new(
        KEYRING_SERVICE,
        &format!("{profile_name}/refresh-token"),
    )?)
}

/// Resolve a profile's refresh token from the credential chain.
pub fn resolve_refresh_token(
    profile: &Profile,
    profile_name: &str,
) -> Result<SecretString, ConfigError> {
    // 1. Profile's refresh_token_env → env var lookup
    if let Some(ref env_name) = profile.refresh_token_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring_entry(profile_name) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    if let Some(ref token) = profile.refresh_token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Write `token` to the system keyring under `profile_name`.
pub fn store_refresh_token(profile_name: &str, token: &SecretString) -> Result<(), ConfigError> {
    keyring_entry(profile_name)?.set_password(token.expose_secret())?;
    Ok(())
}

/// Keep the keyring copy of `profile_name`'s refresh token current as
/// `client` rotates it. Failures are logged and otherwise ignored.
pub fn persist_refresh_tokens(client: &ApiClient, profile_name: &str) -> CallbackHandle {
    let profile_name = profile_name.to_owned();
    client.add_refresh_token_callback(move |token| {
        let token = SecretString::from(token.to_owned());
        if let Err(e) = store_refresh_token(&profile_name, &token) {
            warn!(profile = %profile_name, error = %e, "could not store rotated refresh token");
        }
    })
}

// ── Translation to ClientConfig ─────────────────────────────────────

/// Build a `ClientConfig` from a profile and the shared defaults.
///
/// Credentials are not part of the result; pass the token from
/// [`resolve_refresh_token`] to `ApiClient::from_refresh_token`.
pub fn profile_to_client_config(
    profile: &Profile,
    defaults: &Defaults,
) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(ref url) = profile.api_url {
        config.api_base = validate_url("api_url", url, &["http", "https"])?;
    }
    if let Some(ref url) = profile.auth_url {
        config.auth_base = validate_url("auth_url", url, &["http", "https"])?;
    }
    if let Some(ref url) = profile.websocket_url {
        config.websocket_url = validate_url("websocket_url", url, &["ws", "wss"])?;
    }

    let max_attempts = profile.max_attempts.unwrap_or(defaults.max_attempts);
    if max_attempts == 0 {
        return Err(ConfigError::Validation {
            field: "max_attempts".into(),
            reason: "must be at least 1".into(),
        });
    }

    let mut transport = TransportConfig {
        timeout: Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout)),
        ..TransportConfig::default()
    };
    if let Some(ref agent) = profile.user_agent {
        transport.user_agent.clone_from(agent);
    }

    config.transport = transport;
    config.retry = RetryPolicy {
        max_attempts,
        ..RetryPolicy::default()
    };
    config.refresh_window = Duration::from_secs(defaults.refresh_window_secs);
    config.watchdog_timeout = Duration::from_secs(defaults.watchdog_timeout_secs);
    config.heartbeat_interval = Duration::from_secs(defaults.heartbeat_interval_secs);
    Ok(config)
}

fn validate_url(field: &str, raw: &str, schemes: &[&str]) -> Result<String, ConfigError> {
    let url: url::Url = raw.parse().map_err(|_| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL: {raw}"),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Validation {
            field: field.into(),
            reason: format!("expected scheme {}, got '{}'", schemes.join(" or "), url.scheme()),
        });
    }
    Ok(url.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(cfg.default_profile.as_deref(), Some("default"));
        assert_eq!(cfg.defaults.max_attempts, 3);
        assert_eq!(cfg.defaults.watchdog_timeout_secs, 300);
        assert!(cfg.profiles.is_empty());
    }

    #[test]
    fn profiles_and_defaults_load_from_toml() {
        let (_dir, path) = write_config(
            r#"
default_profile = "home"

[defaults]
timeout = 20
max_attempts = 5

[profiles.home]
refresh_token_env = "HOME_SS_TOKEN"

[profiles.cabin]
api_url = "https://proxy.local/v1/"
max_attempts = 1
"#,
        );

        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.defaults.timeout, 20);
        assert_eq!(cfg.defaults.max_attempts, 5);
        assert_eq!(cfg.defaults.refresh_window_secs, 5);

        let (name, home) = cfg.profile(None).unwrap();
        assert_eq!(name, "home");
        assert_eq!(home.refresh_token_env.as_deref(), Some("HOME_SS_TOKEN"));

        let (_, cabin) = cfg.profile(Some("cabin")).unwrap();
        assert_eq!(cabin.api_url.as_deref(), Some("https://proxy.local/v1/"));
    }

    #[test]
    fn unknown_profile_is_reported() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.profile(Some("nowhere")),
            Err(ConfigError::UnknownProfile(name)) if name == "nowhere"
        ));
    }

    #[test]
    fn malformed_toml_is_a_figment_error() {
        let (_dir, path) = write_config("[defaults\ntimeout = ");
        assert!(matches!(
            load_config_from(&path),
            Err(ConfigError::Figment(_))
        ));
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.profiles.insert(
            "default".into(),
            Profile {
                refresh_token_env: Some("SS_TOKEN".into()),
                timeout: Some(15),
                ..Profile::default()
            },
        );
        save_config_to(&cfg, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        let (_, profile) = loaded.profile(None).unwrap();
        assert_eq!(profile.refresh_token_env.as_deref(), Some("SS_TOKEN"));
        assert_eq!(profile.timeout, Some(15));
    }

    #[test]
    fn refresh_token_env_takes_precedence() {
        let expected = std::env::var("PATH").unwrap();
        let profile = Profile {
            refresh_token_env: Some("PATH".into()),
            refresh_token: Some("plaintext".into()),
            ..Profile::default()
        };

        let token = resolve_refresh_token(&profile, "env-precedence-test").unwrap();
        assert_eq!(token.expose_secret(), expected);
    }

    #[test]
    fn profile_overrides_apply() {
        let profile = Profile {
            api_url: Some("http://localhost:8080/v1/".into()),
            websocket_url: Some("ws://localhost:8081".into()),
            user_agent: Some("test-agent".into()),
            max_attempts: Some(1),
            ..Profile::default()
        };
        let defaults = Defaults {
            timeout: 42,
            ..Defaults::default()
        };

        let cfg = profile_to_client_config(&profile, &defaults).unwrap();
        assert_eq!(cfg.api_base, "http://localhost:8080/v1/");
        assert_eq!(cfg.auth_base, ClientConfig::default().auth_base);
        assert_eq!(cfg.websocket_url, "ws://localhost:8081/");
        assert_eq!(cfg.transport.user_agent, "test-agent");
        assert_eq!(cfg.transport.timeout, Duration::from_secs(42));
        assert_eq!(cfg.retry.max_attempts, 1);
        assert_eq!(cfg.watchdog_timeout, Duration::from_secs(300));
    }

    #[test]
    fn wrong_scheme_is_rejected() {
        let profile = Profile {
            websocket_url: Some("https://socket.example".into()),
            ..Profile::default()
        };
        let err = profile_to_client_config(&profile, &Defaults::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "websocket_url"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let profile = Profile {
            max_attempts: Some(0),
            ..Profile::default()
        };
        assert!(matches!(
            profile_to_client_config(&profile, &Defaults::default()),
            Err(ConfigError::Validation { .. })
        ));
    }
}
