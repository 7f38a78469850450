use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TRAFFIC_LINK_";
const MIN_RECONNECT_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub url: String,
    pub reconnect_delay_ms: u64,
    pub open_timeout_ms: u64,
    /// How long `send` waits for the link to open before giving up.
    pub send_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/ws".to_string(),
            reconnect_delay_ms: 3000,
            open_timeout_ms: 5000,
            send_timeout_ms: 5000,
        }
    }
}

impl RemoteConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 7070,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    error = %err,
                    "ignoring unreadable config file"
                ),
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Remote controller settings
        if let Some(val) = var("REMOTE_URL") {
            self.remote.url = val;
        }
        if let Some(val) = var("RECONNECT_DELAY_MS") {
            if let Ok(ms) = val.parse() {
                self.remote.reconnect_delay_ms = ms;
            }
        }
        if let Some(val) = var("OPEN_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.remote.open_timeout_ms = ms;
            }
        }
        if let Some(val) = var("SEND_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.remote.send_timeout_ms = ms;
            }
        }

        // Bridge settings
        if let Some(val) = var("BRIDGE_ENABLED") {
            self.bridge.enabled = val.parse().unwrap_or(false);
        }
        if let Some(val) = var("BRIDGE_PORT") {
            if let Ok(port) = val.parse() {
                self.bridge.port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.remote.url.trim();
        if url.is_empty() {
            return Err("remote.url must be set".into());
        }
        if !url.starts_with("ws://") {
            return Err("remote.url must be a ws:// URL".into());
        }
        if self.remote.reconnect_delay_ms < MIN_RECONNECT_DELAY_MS {
            return Err(format!(
                "remote.reconnect_delay_ms must be >= {MIN_RECONNECT_DELAY_MS}"
            )
            .into());
        }
        if self.remote.open_timeout_ms == 0 {
            return Err("remote.open_timeout_ms must be non-zero".into());
        }
        if self.remote.send_timeout_ms == 0 {
            return Err("remote.send_timeout_ms must be non-zero".into());
        }
        if self.bridge.enabled && self.bridge.port == 0 {
            return Err("bridge.port must be non-zero when bridge.enabled = true".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join("TrafficLink").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
