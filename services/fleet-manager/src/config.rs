//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The notifier bot token is loaded from the FLEET_NOTIFY_TOKEN env var or
//! `notify.token_file`, never stored in the TOML directly to avoid leaking
//! secrets. Pool credentials live in the state file, not here.

use common::Secret;
use fleet::{FleetSettings, Greeting};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub greeting: GreetingConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    /// JSON state file; created empty if missing
    pub path: PathBuf,
}

/// Admin HTTP API settings
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Bot platform endpoint and timeouts
#[derive(Debug, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            poll_timeout_secs: default_poll_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Admin notification channel
#[derive(Debug, Default, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    /// Path to a file containing the notifier bot token (alternative to
    /// FLEET_NOTIFY_TOKEN env var)
    #[serde(default)]
    pub token_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_send_delay")]
    pub send_delay_ms: u64,
    #[serde(default = "default_migration_template")]
    pub migration_template: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_delay_ms: default_send_delay(),
            migration_template: default_migration_template(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GreetingConfig {
    #[serde(default = "default_greeting")]
    pub text: String,
    #[serde(default)]
    pub photo: Option<PathBuf>,
}

impl Default for GreetingConfig {
    fn default() -> Self {
        Self {
            text: default_greeting(),
            photo: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_resume_on_start")]
    pub resume_on_start: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            resume_on_start: default_resume_on_start(),
        }
    }
}

fn default_max_connections() -> usize {
    64
}

fn default_api_url() -> String {
    "https://api.telegram.org".into()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    40
}

fn default_send_delay() -> u64 {
    20
}

fn default_migration_template() -> String {
    "We have moved! Continue here: *link*".into()
}

fn default_greeting() -> String {
    "Hello!".into()
}

fn default_resume_on_start() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Notifier token resolution order:
    /// 1. FLEET_NOTIFY_TOKEN env var
    /// 2. notify.token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.platform.api_url.starts_with("http://")
            && !config.platform.api_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "api_url must start with http:// or https://, got: {}",
                config.platform.api_url
            )));
        }

        if config.platform.poll_timeout_secs == 0 || config.platform.request_timeout_secs == 0 {
            return Err(common::Error::Config(
                "poll_timeout_secs and request_timeout_secs must be greater than 0".into(),
            ));
        }

        // A long poll must end before the HTTP request times out
        if config.platform.poll_timeout_secs >= config.platform.request_timeout_secs {
            return Err(common::Error::Config(format!(
                "poll_timeout_secs ({}) must be less than request_timeout_secs ({})",
                config.platform.poll_timeout_secs, config.platform.request_timeout_secs
            )));
        }

        if config.admin.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        // Resolve notifier token: env var takes precedence over file
        let token = if let Ok(token) = std::env::var("FLEET_NOTIFY_TOKEN") {
            Some(Secret::new(token.trim().to_owned()))
        } else if let Some(ref token_file) = config.notify.token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            Some(Secret::new(token.trim().to_owned()))
        } else {
            None
        };
        if let Some(token) = token.filter(|t| !t.is_blank()) {
            config.notify.token = Some(token);
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("fleet-manager.toml")
    }

    /// Runtime settings for the fleet manager.
    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            greeting: Greeting {
                text: self.greeting.text.clone(),
                photo: self.greeting.photo.clone(),
            },
            poll_timeout: Duration::from_secs(self.platform.poll_timeout_secs),
            send_delay: Duration::from_millis(self.broadcast.send_delay_ms),
            migration_template: self.broadcast.migration_template.clone(),
            resume_on_start: self.fleet.resume_on_start,
        }
    }
}
