//! Configuration management

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::connection::{ReconnectMode, ReconnectPolicy};
use crate::content::ContentUrls;
use crate::node::{NodeSettings, Role, INBOX_CAPACITY};

const APP_DIR_NAME: &str = "infotainment-link";
const ENV_PREFIX: &str = "INFOTAINMENT";
const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub role: Role,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub playlist: PlaylistConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Generated from role and hostname when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Outgoing request queue size
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_qos() -> u8 {
    1
}

fn default_capacity() -> usize {
    100
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            qos: default_qos(),
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_slot")]
    pub slot: u32,
    /// Zip archive the controller installs on the head unit
    pub bundle: Option<PathBuf>,
    #[serde(default)]
    pub auto_provision: bool,
}

fn default_app_name() -> String {
    "playlist".to_string()
}

fn default_slot() -> u32 {
    1
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            slot: default_slot(),
            bundle: None,
            auto_provision: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Defaults to `<data dir>/www`
    pub apps_dir: Option<PathBuf>,
    #[serde(default = "default_content_base_url")]
    pub content_base_url: String,
    #[serde(default = "default_start_screen_url")]
    pub start_screen_url: String,
    /// Page-load deadline for `start`
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
}

fn default_content_base_url() -> String {
    "http://localhost:8080/".to_string()
}

fn default_start_screen_url() -> String {
    "about:blank".to_string()
}

fn default_start_timeout_ms() -> u64 {
    30_000
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            apps_dir: None,
            content_base_url: default_content_base_url(),
            start_screen_url: default_start_screen_url(),
            start_timeout_ms: default_start_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub policy: ReconnectMode,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 0 = unlimited
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectMode::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistConfig {
    #[serde(default = "default_sync_reply_topic")]
    pub sync_reply_topic: String,
}

fn default_sync_reply_topic() -> String {
    crate::router::TOPIC_PLAYLIST.to_string()
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            sync_reply_topic: default_sync_reply_topic(),
        }
    }
}

impl Config {
    /// Configured client id, or `<role>-<hostname>-<random>`
    pub fn client_id(&self) -> String {
        match &self.broker.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => default_client_id(self.role),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            mode: self.reconnect.policy,
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            role: self.role,
            app: self.app.name.clone(),
            slot: self.app.slot,
            auto_provision: self.app.auto_provision,
            bundle: self.app.bundle.clone(),
            apps_dir: self
                .host
                .apps_dir
                .clone()
                .unwrap_or_else(|| get_data_dir().join("www")),
            content: ContentUrls::new(
                self.host.content_base_url.as_str(),
                self.host.start_screen_url.as_str(),
            ),
            start_timeout: Duration::from_millis(self.host.start_timeout_ms),
            reconnect: self.reconnect_policy(),
            sync_reply_topic: self.playlist.sync_reply_topic.clone(),
            inbox_capacity: INBOX_CAPACITY,
        }
    }

    #[cfg(feature = "mqtt")]
    pub fn mqtt_settings(&self) -> crate::transport::MqttSettings {
        use crate::transport::MqttSettings;

        let mut settings = MqttSettings::new(&self.broker.host, self.broker.port, self.client_id());
        settings.username = self.broker.username.clone();
        settings.password = self.broker.password.clone();
        settings.keep_alive = Duration::from_secs(self.broker.keep_alive_secs);
        settings.qos = MqttSettings::qos_from_level(self.broker.qos);
        settings.capacity = self.broker.capacity.max(1);
        settings
    }
}

pub fn default_client_id(role: Role) -> String {
    let hostname = gethostname::gethostname();
    format!(
        "{}-{}-{:04x}",
        role,
        hostname.to_string_lossy(),
        rand::random::<u16>()
    )
}

/// Parse a broker address as carried on NFC tags: `tcp://host:port`.
/// `mqtt://` and a bare `host[:port]` are accepted too.
pub fn parse_broker_url(raw: &str) -> Result<(String, u16)> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("tcp://{}", raw)
    };
    let url = Url::parse(&candidate).map_err(|e| anyhow!("invalid broker url '{}': {}", raw, e))?;
    if !matches!(url.scheme(), "tcp" | "mqtt") {
        return Err(anyhow!(
            "unsupported broker url scheme '{}' in '{}'",
            url.scheme(),
            raw
        ));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("broker url '{}' has no host", raw))?;
    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_BROKER_PORT)))
}

/// Get config directory (XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("INFOTAINMENT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from(".")
}

/// Get data directory (XDG_DATA_HOME or platform default)
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("INFOTAINMENT_DATA_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local/share").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    PathBuf::from("./data")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (INFOTAINMENT_ROLE, INFOTAINMENT_BROKER__HOST, etc.)
        .add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Broker address from an NFC tag wins over host/port
    if let Ok(raw) = std::env::var("INFOTAINMENT_BROKER_URL") {
        let (host, port) = parse_broker_url(&raw)?;
        builder = builder
            .set_override("broker.host", host)?
            .set_override("broker.port", port as i64)?;
    }

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}
