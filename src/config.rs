//! Configuration loader and validator for the wallet push dispatcher.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `app.stale_after_seconds` (30 days).
pub const MAX_STALE_AFTER_SECONDS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub dispatch: Dispatch,
    pub apple: Apple,
    pub google: Google,
}

/// Worker and lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// Most scheduled requests handled per sweep tick.
    pub sweep_limit: u32,
    /// Audience size above which approval hands off to the background worker.
    pub queue_threshold: i64,
    pub send_timeout_ms: u64,
    pub stale_after_seconds: u64,
}

impl App {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Window after which an unfinished claim counts as abandoned.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_seconds.min(MAX_STALE_AFTER_SECONDS) as i64)
    }

    /// Expand a leading `~/` using `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }
}

/// Concurrency width per platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dispatch {
    pub apple_batch_width: usize,
    pub google_batch_width: usize,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            apple_batch_width: 20,
            google_batch_width: 10,
        }
    }
}

/// APNs settings. `auth_token` is minted outside this service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Apple {
    pub apns_url: String,
    pub pass_type_id: String,
    pub auth_token: String,
}

/// Google Wallet API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Google {
    pub api_base: String,
    pub issuer_id: String,
    pub access_token: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    pub fn default_database_url(&self) -> String {
        format!("sqlite://{}/wallet_push.db", self.app.resolved_data_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.sweep_limit == 0 {
        return Err(ConfigError::Invalid("app.sweep_limit must be > 0"));
    }
    if cfg.app.queue_threshold <= 0 {
        return Err(ConfigError::Invalid("app.queue_threshold must be > 0"));
    }
    if cfg.app.send_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.send_timeout_ms must be > 0"));
    }
    if cfg.app.stale_after_seconds == 0 {
        return Err(ConfigError::Invalid("app.stale_after_seconds must be > 0"));
    }
    if cfg.app.stale_after_seconds > MAX_STALE_AFTER_SECONDS {
        return Err(ConfigError::Invalid("app.stale_after_seconds must be at most 30 days"));
    }

    if cfg.dispatch.apple_batch_width == 0 {
        return Err(ConfigError::Invalid("dispatch.apple_batch_width must be > 0"));
    }
    if cfg.dispatch.google_batch_width == 0 {
        return Err(ConfigError::Invalid("dispatch.google_batch_width must be > 0"));
    }

    if cfg.apple.apns_url.trim().is_empty() {
        return Err(ConfigError::Invalid("apple.apns_url must be non-empty"));
    }
    if cfg.apple.pass_type_id.trim().is_empty() {
        return Err(ConfigError::Invalid("apple.pass_type_id must be non-empty"));
    }
    if cfg.apple.auth_token.trim().is_empty() {
        return Err(ConfigError::Invalid("apple.auth_token must be non-empty"));
    }

    if cfg.google.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("google.api_base must be non-empty"));
    }
    if cfg.google.issuer_id.trim().is_empty() {
        return Err(ConfigError::Invalid("google.issuer_id must be non-empty"));
    }
    if cfg.google.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("google.access_token must be non-empty"));
    }

    Ok(())
}

/// Example configuration with every key present.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 1000
  sweep_limit: 10
  queue_threshold: 500
  send_timeout_ms: 10000
  stale_after_seconds: 900

dispatch:
  apple_batch_width: 20
  google_batch_width: 10

apple:
  apns_url: "https://api.push.apple.com"
  pass_type_id: "pass.com.example.loyalty"
  auth_token: "YOUR_APNS_PROVIDER_TOKEN"

google:
  api_base: "https://walletobjects.googleapis.com/"
  issuer_id: "3388000000000000000"
  access_token: "YOUR_GOOGLE_WALLET_ACCESS_TOKEN"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.dispatch, Dispatch::default());
        assert_eq!(cfg.app.send_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn invalid_numeric_knobs() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.sweep_limit = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("sweep_limit")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.queue_threshold = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.dispatch.google_batch_width = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("google_batch_width")), _ => panic!("wrong error") }
    }

    #[test]
    fn stale_window_is_bounded() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        assert_eq!(cfg.app.stale_after(), chrono::Duration::minutes(15));

        cfg.app.stale_after_seconds = 10_000_000_000_000;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("stale_after_seconds")), _ => panic!("wrong error") }
        assert_eq!(cfg.app.stale_after(), chrono::Duration::days(30));

        cfg.app.stale_after_seconds = u64::MAX;
        assert!(cfg.app.stale_after() > chrono::Duration::zero());

        cfg.app.stale_after_seconds = MAX_STALE_AFTER_SECONDS;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_platform_credentials() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.apple.auth_token = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("apple.auth_token")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.google.issuer_id = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("google.issuer_id")), _ => panic!("wrong error") }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(cfg.default_database_url().ends_with("/data/wallet_push.db"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.google.issuer_id, "3388000000000000000");
    }
}
