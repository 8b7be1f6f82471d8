//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$CHAINMAIL_CONFIG` (environment variable)
//! 2. `~/.config/chainmail/config.toml` (Linux/macOS)
//!    `%APPDATA%\chainmail\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::proxy::SocksVersion;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Account and proxy pool locations.
    pub pool: PoolConfig,
    /// Proxy chain construction.
    pub chain: ChainConfig,
    /// Receive/send session policy.
    pub session: SessionConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Root directory holding per-account mail folders.
    pub data_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Account and proxy pool locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// JSON file with mail accounts.
    pub accounts_file: PathBuf,
    /// JSON file with proxy accounts.
    pub proxies_file: PathBuf,
    /// Directory receiving timestamped backup copies on save.
    pub backup_dir: Option<PathBuf>,
    /// Restrict proxy selection to one SOCKS version.
    pub proxy_kind: Option<SocksVersion>,
}

/// Proxy chain construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Secure-shell port used when the proxy host carries none.
    pub ssh_port: u16,
    /// Loopback port reserved for SOCKS4 forwards.
    pub socks4_port: u16,
    /// Loopback port reserved for SOCKS5 forwards.
    pub socks5_port: u16,
    /// Bind the SOCKS listener and the shell socket to the tunnel's local
    /// address when a tunnel is up.
    pub bind_to_tunnel: bool,
    /// Static tunnel address (used when no helper is configured).
    pub tunnel_address: Option<String>,
    /// External route-helper command printing the tunnel address.
    pub tunnel_helper: Option<Vec<String>>,
    /// Time budget for one helper invocation, in seconds.
    pub helper_timeout_secs: u64,
    /// TCP connect timeout for the shell session, in seconds.
    pub connect_timeout_secs: u64,
}

/// Receive/send session policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delete fetched messages from the server and expunge after the loop.
    pub purge: bool,
    /// Stamp an origination-IP header with the chain's egress address.
    pub fake_origin_ip: bool,
    /// Per-operation protocol I/O timeout, in seconds (none = unbounded).
    pub io_timeout_secs: Option<u64>,
    /// Outbound queue folder name below the account root.
    pub queue_dir: String,
    /// Sent archive folder name below the account root.
    pub sent_dir: String,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            data_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            accounts_file: PathBuf::from("accounts.json"),
            proxies_file: PathBuf::from("proxies.json"),
            backup_dir: None,
            proxy_kind: None,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            ssh_port: 22,
            socks4_port: 1084,
            socks5_port: 1085,
            bind_to_tunnel: false,
            tunnel_address: None,
            tunnel_helper: None,
            helper_timeout_secs: 5,
            connect_timeout_secs: 15,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            purge: false,
            fake_origin_ip: false,
            io_timeout_secs: None,
            queue_dir: "outbox".to_string(),
            sent_dir: "sent".to_string(),
        }
    }
}

impl ChainConfig {
    /// Loopback port reserved for the given SOCKS version.
    pub fn socks_port(&self, version: SocksVersion) -> u16 {
        match version {
            SocksVersion::V4 => self.socks4_port,
            SocksVersion::V5 => self.socks5_port,
        }
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SessionConfig {
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("CHAINMAIL_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("chainmail").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chainmail")
}

/// Return the root directory for per-account mail folders.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.data_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chainmail")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("chainmail.log")
}
